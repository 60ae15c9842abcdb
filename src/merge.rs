use crate::error::Result;
use crate::io::RecordSink;
use crate::records::Comparator;

use std::cmp::Ordering;

/// Streams two sources, each sorted ascending under `cmp`, into `sink`.
///
/// On equal keys the record from `a` is written first and the one from `b`
/// follows; nothing is deduplicated. When one side runs dry the rest of the
/// other is copied unchanged. The sink is left open, the caller closes it.
pub fn merge_sorted<T, A, B, S>(a: A, b: B, cmp: &Comparator<T>, sink: &mut S) -> Result<u64>
where
    A: IntoIterator<Item = Result<T>>,
    B: IntoIterator<Item = Result<T>>,
    S: RecordSink<T> + ?Sized,
{
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    let mut head_a = a.next().transpose()?;
    let mut head_b = b.next().transpose()?;
    let mut written = 0;

    loop {
        let take_a = match (&head_a, &head_b) {
            (Some(x), Some(y)) => cmp(x, y) != Ordering::Greater,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_a {
            if let Some(record) = head_a.take() {
                sink.write(record)?;
            }
            head_a = a.next().transpose()?;
        } else {
            if let Some(record) = head_b.take() {
                sink.write(record)?;
            }
            head_b = b.next().transpose()?;
        }
        written += 1;
    }
    Ok(written)
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::{vec_source, VecSink};
    use crate::records::{Token, TokenPair, Weighted};
    use std::sync::Arc;

    fn tokens(ids: &[u32]) -> Vec<Token> {
        ids.iter().map(|&id| Token::new(id)).collect()
    }

    #[test]
    fn interleaves_and_drains_remainder() {
        let mut sink = VecSink::new();
        let n = merge_sorted(
            vec_source(tokens(&[1, 4, 9])),
            vec_source(tokens(&[2, 3, 10, 11, 12])),
            &Token::order(),
            &mut sink,
        ).unwrap();
        assert_eq!(n, 8);
        let ids: Vec<u32> = sink.records().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 9, 10, 11, 12]);
    }

    #[test]
    fn equal_keys_keep_both_with_a_first() {
        let order = Weighted::record_order(TokenPair::index_order());
        let a = vec![Weighted::new(TokenPair::new(1, 1), 1.0), Weighted::new(TokenPair::new(2, 2), 1.0)];
        let b = vec![Weighted::new(TokenPair::new(1, 1), 5.0)];
        let mut sink = VecSink::new();
        merge_sorted(vec_source(a), vec_source(b), &order, &mut sink).unwrap();
        let weights: Vec<f64> = sink.records().iter().map(|w| w.weight).collect();
        assert_eq!(weights, vec![1.0, 5.0, 1.0]);
    }

    #[test]
    fn one_side_empty() {
        let mut sink = VecSink::new();
        let cmp: Comparator<u32> = Arc::new(|a: &u32, b: &u32| a.cmp(b));
        merge_sorted(vec_source(Vec::new()), vec_source(vec![3u32, 5]), &cmp, &mut sink).unwrap();
        assert_eq!(sink.records(), vec![3, 5]);
    }
}
