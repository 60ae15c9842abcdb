// Record types flowing through the sort engine and the all-pairs search, and
// the orders defined over them.

use std::cmp::Ordering;
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub type TokenId = u32;

/// Anything the external sort engine can carry through temp files.
pub trait Record: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Record for T where T: Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {}

pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Negates a comparator.
pub fn reverse<T: 'static>(cmp: Comparator<T>) -> Comparator<T> {
    Arc::new(move |a: &T, b: &T| cmp(b, a))
}

/// Uses `second` only where `first` considers the records equal.
pub fn then<T: 'static>(first: Comparator<T>, second: Comparator<T>) -> Comparator<T> {
    Arc::new(move |a: &T, b: &T| first(a, b).then_with(|| second(a, b)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
}

impl Token {
    pub fn new(id: TokenId) -> Token {
        Self { id }
    }

    pub fn order() -> Comparator<Token> {
        Arc::new(|a: &Token, b: &Token| a.id.cmp(&b.id))
    }
}

/// An entry/feature co-occurrence or an entry/entry similarity edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenPair {
    pub id1: TokenId,
    pub id2: TokenId,
}

impl TokenPair {

    pub fn new(id1: TokenId, id2: TokenId) -> TokenPair {
        Self { id1, id2 }
    }

    pub fn is_identity(&self) -> bool {
        self.id1 == self.id2
    }

    pub fn swap(&self) -> TokenPair {
        TokenPair::new(self.id2, self.id1)
    }

    /// lexicographic on (id1, id2)
    pub fn index_order() -> Comparator<TokenPair> {
        Arc::new(|a: &TokenPair, b: &TokenPair| a.cmp(b))
    }

    /// Groups pairs sharing the first id, used for neighbour classes.
    pub fn first_index_order() -> Comparator<TokenPair> {
        Arc::new(|a: &TokenPair, b: &TokenPair| a.id1.cmp(&b.id1))
    }

    pub fn second_index_order() -> Comparator<TokenPair> {
        Arc::new(|a: &TokenPair, b: &TokenPair| a.id2.cmp(&b.id2))
    }
}

impl Display for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.id1, self.id2)
    }
}

/// A record paired with a weight. Two weighted records are the same record
/// when their inner records are equal, the weights are not compared.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Weighted<T> {
    pub record: T,
    pub weight: f64,
}

impl<T> Weighted<T> {

    pub fn new(record: T, weight: f64) -> Weighted<T> {
        Self { record, weight }
    }

    pub fn same_record(&self, other: &Weighted<T>) -> bool
    where
        T: PartialEq,
    {
        self.record == other.record
    }
}

impl<T: 'static> Weighted<T> {

    /// Orders by the inner record only.
    pub fn record_order(inner: Comparator<T>) -> Comparator<Weighted<T>> {
        Arc::new(move |a: &Weighted<T>, b: &Weighted<T>| inner(&a.record, &b.record))
    }

    /// Ascending weight, total order over floats.
    pub fn weight_order() -> Comparator<Weighted<T>> {
        Arc::new(|a: &Weighted<T>, b: &Weighted<T>| a.weight.total_cmp(&b.weight))
    }
}

impl<T: Display> Display for Weighted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}", self.record, self.weight)
    }
}

/// Neighbour order: grouped by first id, nearest (highest weight) first, ties
/// broken on the second id so the output is deterministic.
pub fn neighbour_order() -> Comparator<Weighted<TokenPair>> {
    then(
        then(
            Weighted::record_order(TokenPair::first_index_order()),
            reverse(Weighted::weight_order()),
        ),
        Weighted::record_order(TokenPair::second_index_order()),
    )
}
