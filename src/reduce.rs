// Streaming reducers. Both rely on the order of their input and keep O(1)
// state, so they can wrap any sink of a sorted stream.

use crate::error::Result;
use crate::io::RecordSink;
use crate::records::{Comparator, Record, Weighted};
use crate::sort::SinkDecorator;

use std::cmp::Ordering;
use std::sync::Arc;

/// Sums the weights of adjacent records that are equal under `key`.
///
/// The input must be sorted by the full record key, otherwise equal records
/// that are not adjacent pass through as separate outputs.
pub struct WeightSumSink<T, S> {
    inner: S,
    key: Comparator<T>,
    pending: Option<Weighted<T>>,
    closed: bool,
}

impl<T, S> WeightSumSink<T, S>
where
    S: RecordSink<Weighted<T>>,
{
    pub fn new(inner: S, key: Comparator<T>) -> WeightSumSink<T, S> {
        Self { inner, key, pending: None, closed: false }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<T: Record, S: RecordSink<Weighted<T>>> RecordSink<Weighted<T>> for WeightSumSink<T, S> {

    fn write(&mut self, record: Weighted<T>) -> Result<()> {
        match self.pending.as_mut() {
            Some(pending) if (self.key)(&pending.record, &record.record) == Ordering::Equal => {
                pending.weight += record.weight;
                Ok(())
            }
            _ => match self.pending.replace(record) {
                Some(done) => self.inner.write(done),
                None => Ok(()),
            },
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let flushed = match self.pending.take() {
            Some(done) => self.inner.write(done),
            None => Ok(()),
        };
        let closed = self.inner.close();
        flushed?;
        closed
    }
}

/// Run sink decorator folding duplicates of every sorted run.
pub fn weight_sum_decorator<T: Record>(key: Comparator<T>) -> SinkDecorator<Weighted<T>> {
    Arc::new(move |sink: Box<dyn RecordSink<Weighted<T>>>| {
        Box::new(WeightSumSink::new(sink, key.clone())) as Box<dyn RecordSink<Weighted<T>>>
    })
}

/// Emits only the first `k` records of each class.
///
/// Records arrive grouped by `class` and, within a class, nearest first. The
/// selection is streaming: if the order within a class is wrong the first k
/// seen are kept anyway.
pub struct TopKSink<T, S> {
    inner: S,
    class: Comparator<T>,
    k: usize,
    current: Option<T>,
    rank: usize,
}

impl<T, S> TopKSink<T, S> {
    pub fn new(inner: S, class: Comparator<T>, k: usize) -> TopKSink<T, S> {
        Self { inner, class, k, current: None, rank: 0 }
    }
}

impl<T: Record, S: RecordSink<T>> RecordSink<T> for TopKSink<T, S> {

    fn write(&mut self, record: T) -> Result<()> {
        let same_class = match &self.current {
            Some(current) => (self.class)(current, &record) == Ordering::Equal,
            None => false,
        };
        if !same_class {
            self.current = Some(record.clone());
            self.rank = 0;
        }
        self.rank += 1;
        if self.rank <= self.k {
            self.inner.write(record)
        } else {
            Ok(())
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

pub fn top_k_decorator<T: Record>(class: Comparator<T>, k: usize) -> SinkDecorator<T> {
    Arc::new(move |sink: Box<dyn RecordSink<T>>| {
        Box::new(TopKSink::new(sink, class.clone(), k)) as Box<dyn RecordSink<T>>
    })
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::{drain_into, vec_source, VecSink};
    use crate::records::{neighbour_order, TokenPair};

    fn weighted(id1: u32, id2: u32, weight: f64) -> Weighted<TokenPair> {
        Weighted::new(TokenPair::new(id1, id2), weight)
    }

    #[test]
    fn sums_adjacent_duplicates() {
        let out = VecSink::new();
        let mut sink = WeightSumSink::new(out.clone(), TokenPair::index_order());
        let input = vec![
            weighted(0, 1, 1.0),
            weighted(0, 1, 2.5),
            weighted(0, 2, 1.0),
            weighted(1, 0, 4.0),
            weighted(1, 0, 1.0),
            weighted(1, 0, 1.0),
        ];
        drain_into(vec_source(input), &mut sink).unwrap();
        let got: Vec<(TokenPair, f64)> = out.records().iter().map(|w| (w.record, w.weight)).collect();
        assert_eq!(got, vec![
            (TokenPair::new(0, 1), 3.5),
            (TokenPair::new(0, 2), 1.0),
            (TokenPair::new(1, 0), 6.0),
        ]);
    }

    #[test]
    fn singletons_pass_through_and_close_is_idempotent() {
        let out = VecSink::new();
        let mut sink = WeightSumSink::new(out.clone(), TokenPair::index_order());
        sink.write(weighted(3, 3, 0.25)).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert_eq!(out.records().len(), 1);
        assert_eq!(out.records()[0].weight, 0.25);
    }

    #[test]
    fn top_k_keeps_first_k_per_class() {
        let out = VecSink::new();
        let mut sink = TopKSink::new(out.clone(), Weighted::record_order(TokenPair::first_index_order()), 2);
        let mut input = vec![
            weighted(0, 1, 0.9),
            weighted(0, 2, 0.8),
            weighted(0, 3, 0.7),
            weighted(0, 4, 0.6),
            weighted(1, 0, 0.5),
            weighted(2, 0, 0.4),
            weighted(2, 1, 0.3),
            weighted(2, 5, 0.35),
        ];
        let order = neighbour_order();
        input.sort_by(|a, b| order(a, b));
        drain_into(vec_source(input), &mut sink).unwrap();

        let got: Vec<(u32, u32)> = out.records().iter().map(|w| (w.record.id1, w.record.id2)).collect();
        assert_eq!(got, vec![(0, 1), (0, 2), (1, 0), (2, 0), (2, 5)]);
    }

    #[test]
    fn decorators_wrap_boxed_sinks() {
        let out: VecSink<Weighted<TokenPair>> = VecSink::new();
        let decorate = weight_sum_decorator(TokenPair::index_order());
        let mut sink = decorate(Box::new(out.clone()));
        drain_into(vec_source(vec![weighted(1, 1, 1.0), weighted(1, 1, 1.0)]), &mut sink).unwrap();
        assert_eq!(out.records().len(), 1);
        assert_eq!(out.records()[0].weight, 2.0);
    }
}
