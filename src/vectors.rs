use crate::error::{Error, Result};
use crate::io::RecordSource;
use crate::records::{TokenId, TokenPair, Weighted};

use serde::{Deserialize, Serialize};

/// Feature weights of one entry, ascending by feature id. Feature ids are
/// unique and every stored weight is positive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    keys: Vec<TokenId>,
    values: Vec<f64>,
    sum: f64,
}

impl SparseVector {

    /// Builds a vector from (feature, weight) pairs in any order. Duplicate
    /// features are summed, non-positive totals are dropped.
    pub fn from_pairs(mut pairs: Vec<(TokenId, f64)>) -> SparseVector {
        pairs.sort_by_key(|&(k, _)| k);
        let mut vector = SparseVector::default();
        let mut pending: Option<(TokenId, f64)> = None;
        for (key, value) in pairs {
            pending = match pending {
                Some((k, v)) if k == key => Some((k, v + value)),
                Some((k, v)) => {
                    vector.push_positive(k, v);
                    Some((key, value))
                }
                None => Some((key, value)),
            };
        }
        if let Some((k, v)) = pending {
            vector.push_positive(k, v);
        }
        vector
    }

    fn push_positive(&mut self, key: TokenId, value: f64) {
        if value > 0.0 {
            self.keys.push(key);
            self.values.push(value);
            self.sum += value;
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[TokenId] {
        &self.keys
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Total weight.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    pub fn get(&self, key: TokenId) -> Option<f64> {
        self.keys.binary_search(&key).ok().map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (TokenId, f64)> + '_ {
        self.keys.iter().copied().zip(self.values.iter().copied())
    }
}

/// An entry together with its feature vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedVector {
    pub entry: TokenId,
    pub vector: SparseVector,
}

/// Groups a stream of entry/feature events sorted by index order into one
/// vector per entry.
///
/// Adjacent duplicate events are summed. An event that sorts before its
/// predecessor is an error, the grouping would otherwise silently split an
/// entry in two.
pub struct VectorSource {
    events: RecordSource<Weighted<TokenPair>>,
    context: String,
    lookahead: Option<Weighted<TokenPair>>,
    done: bool,
}

impl VectorSource {

    pub fn new(events: RecordSource<Weighted<TokenPair>>, context: impl Into<String>) -> VectorSource {
        Self { events, context: context.into(), lookahead: None, done: false }
    }

    fn pull(&mut self) -> Result<Option<Weighted<TokenPair>>> {
        if let Some(event) = self.lookahead.take() {
            return Ok(Some(event));
        }
        self.events.next().transpose()
    }

    fn next_vector(&mut self) -> Result<Option<IndexedVector>> {
        loop {
            let Some(first) = self.pull()? else {
                return Ok(None);
            };
            let entry = first.record.id1;
            let mut keys = vec![first.record.id2];
            let mut values = vec![first.weight];

            while let Some(event) = self.pull()? {
                let last = TokenPair::new(entry, keys[keys.len() - 1]);
                if event.record < last {
                    return Err(Error::format(
                        self.context.clone(),
                        format!("event {} follows {}, input is not sorted", event.record, last),
                    ));
                }
                if event.record.id1 != entry {
                    self.lookahead = Some(event);
                    break;
                }
                if event.record.id2 == last.id2 {
                    let n = values.len();
                    values[n - 1] += event.weight;
                } else {
                    keys.push(event.record.id2);
                    values.push(event.weight);
                }
            }

            let mut vector = SparseVector::default();
            for (k, v) in keys.into_iter().zip(values) {
                vector.push_positive(k, v);
            }
            // an entry whose weights are all non-positive has no vector
            if !vector.is_empty() {
                return Ok(Some(IndexedVector { entry, vector }));
            }
        }
    }
}

impl Iterator for VectorSource {
    type Item = Result<IndexedVector>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_vector() {
            Ok(Some(vector)) => Some(Ok(vector)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::vec_source;

    fn event(entry: u32, feature: u32, weight: f64) -> Weighted<TokenPair> {
        Weighted::new(TokenPair::new(entry, feature), weight)
    }

    #[test]
    fn groups_events_by_entry() {
        let events = vec![
            event(0, 1, 2.0),
            event(0, 2, 1.0),
            event(0, 2, 1.5),
            event(3, 1, 1.0),
            event(3, 3, 3.0),
        ];
        let vectors: Vec<IndexedVector> = VectorSource::new(vec_source(events), "test")
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].entry, 0);
        assert_eq!(vectors[0].vector.keys(), &[1, 2]);
        assert_eq!(vectors[0].vector.values(), &[2.0, 2.5]);
        assert_eq!(vectors[0].vector.sum(), 4.5);
        assert_eq!(vectors[1].vector.get(3), Some(3.0));
    }

    #[test]
    fn drops_non_positive_features() {
        let events = vec![event(0, 1, 0.0), event(0, 2, -1.0), event(1, 1, 1.0)];
        let vectors: Vec<IndexedVector> = VectorSource::new(vec_source(events), "test")
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].entry, 1);
    }

    #[test]
    fn rejects_unsorted_input() {
        let events = vec![event(2, 1, 1.0), event(1, 1, 1.0)];
        let result: Result<Vec<IndexedVector>> = VectorSource::new(vec_source(events), "test").collect();
        assert!(matches!(result, Err(Error::Format { .. })));
    }

    #[test]
    fn from_pairs_normalises() {
        let v = SparseVector::from_pairs(vec![(5, 1.0), (2, 2.0), (5, 1.0), (7, 0.0)]);
        assert_eq!(v.keys(), &[2, 5]);
        assert_eq!(v.values(), &[2.0, 2.0]);
        assert!((v.norm() - 8f64.sqrt()).abs() < 1e-12);
    }
}
