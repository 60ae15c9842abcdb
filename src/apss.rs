// All pairs similarity search. Two inner algorithms, naive and inverted
// index, plus a threaded driver that stripes the A side over the worker pool.

use crate::chunker::Chunker;
use crate::error::{Error, Result};
use crate::io::{RecordSink, RecordSource};
use crate::measure::{Measure, MeasureKind, ScoreWeighting};
use crate::observer::RunObserver;
use crate::records::{Token, TokenId, TokenPair, Weighted};
use crate::scheduler::{Task, TaskKind, WorkerPool, KEY_STRIPE};
use crate::stats::FeatureStats;
use crate::vectors::IndexedVector;
use crate::weighting::FeatureWeighting;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};

/// Pairs a worker collects before taking the shared sink lock.
pub const PAIR_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApssAlgorithm {
    Naive,
    #[default]
    Inverted,
}

/// Which scored pairs are written out.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairFilter {
    pub min_similarity: f64,
    pub max_similarity: f64,
    pub identity_pairs: bool,
}

impl Default for PairFilter {
    fn default() -> Self {
        Self { min_similarity: f64::NEG_INFINITY, max_similarity: f64::INFINITY, identity_pairs: false }
    }
}

impl PairFilter {

    pub fn accepts_score(&self, score: f64) -> bool {
        score >= self.min_similarity && score <= self.max_similarity
    }

    pub fn accepts_entries(&self, a: TokenId, b: TokenId) -> bool {
        self.identity_pairs || a != b
    }
}

impl Display for PairFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}], identity pairs: {}", self.min_similarity, self.max_similarity, self.identity_pairs)
    }
}

#[derive(Debug, Default)]
pub struct ApssStats {
    candidates: AtomicU64,
    comparisons: AtomicU64,
    productions: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApssCounts {
    pub candidates: u64,
    pub comparisons: u64,
    pub productions: u64,
}

impl ApssStats {
    pub fn counts(&self) -> ApssCounts {
        ApssCounts {
            candidates: self.candidates.load(Ordering::Relaxed),
            comparisons: self.comparisons.load(Ordering::Relaxed),
            productions: self.productions.load(Ordering::Relaxed),
        }
    }
}

impl Display for ApssCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} candidates, {} comparisons, {} pairs produced", self.candidates, self.comparisons, self.productions)
    }
}

/// Scores one (a, b) pair and decides whether it is kept.
#[derive(Clone, Debug)]
pub struct PairScorer {
    measure: Measure,
    weighting: ScoreWeighting,
    filter: PairFilter,
    reversed: bool,
}

impl PairScorer {

    pub fn new(measure: Measure, weighting: ScoreWeighting, filter: PairFilter, reversed: bool) -> PairScorer {
        Self { measure, weighting, filter, reversed }
    }

    pub fn measure(&self) -> &Measure {
        &self.measure
    }

    /// True when a pair sharing no feature can never pass the filter, so the
    /// inverted index may skip it without changing the output.
    pub fn skips_disjoint(&self) -> bool {
        match self.measure.disjoint_score() {
            Some(score) => !self.filter.accepts_score(self.weighting.apply(score)),
            None => false,
        }
    }

    pub fn score(&self, a: &IndexedVector, b: &IndexedVector, stats: &ApssStats) -> Option<Weighted<TokenPair>> {
        if !self.filter.accepts_entries(a.entry, b.entry) {
            return None;
        }
        stats.comparisons.fetch_add(1, Ordering::Relaxed);
        let raw = if self.reversed {
            self.measure.similarity(&b.vector, &a.vector)
        } else {
            self.measure.similarity(&a.vector, &b.vector)
        };
        let score = self.weighting.apply(raw);
        if self.filter.accepts_score(score) {
            stats.productions.fetch_add(1, Ordering::Relaxed);
            Some(Weighted::new(TokenPair::new(a.entry, b.entry), score))
        } else {
            None
        }
    }
}

/// Posting lists of the B side: feature id to the positions of the B vectors
/// holding that feature, ascending.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<TokenId, Vec<usize>>,
}

impl InvertedIndex {

    pub fn build(b_side: &[IndexedVector]) -> InvertedIndex {
        let mut postings: HashMap<TokenId, Vec<usize>> = HashMap::new();
        for (position, b) in b_side.iter().enumerate() {
            for &feature in b.vector.keys() {
                postings.entry(feature).or_default().push(position);
            }
        }
        Self { postings }
    }

    pub fn features(&self) -> usize {
        self.postings.len()
    }

    /// Positions of every B vector sharing a feature with `a`, ascending.
    pub fn candidates(&self, a: &IndexedVector) -> Vec<usize> {
        let mut candidates: Vec<usize> = a
            .vector
            .keys()
            .iter()
            .filter_map(|feature| self.postings.get(feature))
            .flatten()
            .copied()
            .collect();
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }
}

/// Scores every `a` against every `b`.
pub fn naive_apss(
    a_side: &[IndexedVector],
    b_side: &[IndexedVector],
    scorer: &PairScorer,
    stats: &ApssStats,
    sink: &mut dyn RecordSink<Weighted<TokenPair>>,
) -> Result<()> {
    for a in a_side {
        stats.candidates.fetch_add(b_side.len() as u64, Ordering::Relaxed);
        for b in b_side {
            if let Some(pair) = scorer.score(a, b, stats) {
                sink.write(pair)?;
            }
        }
    }
    Ok(())
}

/// Scores each `a` only against the B vectors found through its posting
/// lists, when the scorer allows skipping disjoint pairs. Otherwise falls
/// back to the full scan. Either way the output equals `naive_apss`.
pub fn inverted_apss(
    a_side: &[IndexedVector],
    b_side: &[IndexedVector],
    index: &InvertedIndex,
    scorer: &PairScorer,
    stats: &ApssStats,
    sink: &mut dyn RecordSink<Weighted<TokenPair>>,
) -> Result<()> {
    if !scorer.skips_disjoint() {
        return naive_apss(a_side, b_side, scorer, stats, sink);
    }
    for a in a_side {
        let candidates = index.candidates(a);
        stats.candidates.fetch_add(candidates.len() as u64, Ordering::Relaxed);
        for position in candidates {
            if let Some(pair) = scorer.score(a, &b_side[position], stats) {
                sink.write(pair)?;
            }
        }
    }
    Ok(())
}

pub type SharedSink = Arc<Mutex<Box<dyn RecordSink<Weighted<TokenPair>>>>>;

// Per worker buffer in front of the shared sink. Closing flushes the buffer
// but leaves the shared sink open.
struct BufferedSink {
    shared: SharedSink,
    buffer: Vec<Weighted<TokenPair>>,
}

impl BufferedSink {

    fn new(shared: SharedSink) -> BufferedSink {
        Self { shared, buffer: Vec::with_capacity(PAIR_BUFFER_SIZE) }
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut shared = self.shared.lock().map_err(|_| Error::disconnected("pair sink lock poisoned"))?;
        for pair in self.buffer.drain(..) {
            shared.write(pair)?;
        }
        Ok(())
    }
}

impl RecordSink<Weighted<TokenPair>> for BufferedSink {

    fn write(&mut self, record: Weighted<TokenPair>) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= PAIR_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApssState {
    LoadStats,
    StripeDispatch,
    AwaitAll,
    Done,
    Failed,
}

/// Everything a threaded run needs besides its inputs.
#[derive(Clone, Debug)]
pub struct ApssOptions {
    pub measure: MeasureKind,
    pub weighting: ScoreWeighting,
    /// Applied to both sides before scoring.
    pub feature_weighting: FeatureWeighting,
    pub filter: PairFilter,
    pub reversed: bool,
    pub algorithm: ApssAlgorithm,
    /// A vectors per stripe. Unset means ⌈|B| / threads⌉: A is streamed and
    /// its size unknown up front, B is the same file in a full build.
    pub stripe_size: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApssReport {
    pub a_vectors: usize,
    pub b_vectors: usize,
    pub stripes: usize,
    pub counts: ApssCounts,
}

// feature weighting shared by the B side and every A stripe
struct Reweigh {
    weighting: FeatureWeighting,
    stats: Option<Arc<FeatureStats>>,
}

impl Reweigh {
    // vectors left without a positive weight are dropped
    fn all(&self, vectors: Vec<IndexedVector>) -> Vec<IndexedVector> {
        if self.weighting == FeatureWeighting::Identity {
            return vectors;
        }
        vectors
            .into_iter()
            .map(|v| self.weighting.apply_indexed(v, self.stats.as_deref()))
            .filter(|v| !v.vector.is_empty())
            .collect()
    }
}

// read only B side shared by all stripes
struct BSide {
    vectors: Vec<IndexedVector>,
    index: Option<InvertedIndex>,
}

pub struct ThreadedApss {
    options: ApssOptions,
    pool: WorkerPool,
    state: ApssState,
}

impl ThreadedApss {

    pub fn new(options: ApssOptions, pool: WorkerPool) -> Result<ThreadedApss> {
        if options.stripe_size == Some(0) {
            return Err(Error::config("stripe_size", "must be at least 1"));
        }
        if options.filter.min_similarity > options.filter.max_similarity {
            return Err(Error::config("min_similarity", "exceeds max_similarity"));
        }
        Ok(Self { options, pool, state: ApssState::LoadStats })
    }

    pub fn state(&self) -> ApssState {
        self.state
    }

    /// Runs the A source against the B source and writes accepted pairs to
    /// `sink`, closing it at the end. `features` is read only when the
    /// measure or the feature weighting needs feature statistics.
    pub fn run(
        &mut self,
        a_source: RecordSource<IndexedVector>,
        b_source: RecordSource<IndexedVector>,
        features: Option<RecordSource<Weighted<Token>>>,
        sink: Box<dyn RecordSink<Weighted<TokenPair>>>,
        observer: &RunObserver,
    ) -> Result<ApssReport> {
        let shared: SharedSink = Arc::new(Mutex::new(sink));
        let outcome = self.execute(a_source, b_source, features, shared.clone(), observer);
        let closed = match shared.lock() {
            Ok(mut sink) => sink.close(),
            Err(_) => Err(Error::disconnected("pair sink lock poisoned")),
        };
        match outcome.and_then(|report| closed.map(|_| report)) {
            Ok(report) => {
                self.state = ApssState::Done;
                observer.info(&format!("all pairs done over {} stripes: {}", report.stripes, report.counts));
                Ok(report)
            }
            Err(e) => {
                observer.warn(&format!("all pairs failed in {:?}: {}", self.state, e));
                self.state = ApssState::Failed;
                Err(e)
            }
        }
    }

    fn enter(&mut self, state: ApssState, observer: &RunObserver) {
        self.state = state;
        observer.stage(&format!("{:?}", state));
    }

    fn execute(
        &mut self,
        a_source: RecordSource<IndexedVector>,
        b_source: RecordSource<IndexedVector>,
        features: Option<RecordSource<Weighted<Token>>>,
        shared: SharedSink,
        observer: &RunObserver,
    ) -> Result<ApssReport> {
        self.enter(ApssState::LoadStats, observer);
        let needs_stats = self.options.measure.needs_stats() || self.options.feature_weighting.needs_stats();
        let stats = match (needs_stats, features) {
            (true, Some(features)) => Some(Arc::new(FeatureStats::load(features, observer)?)),
            (true, None) => {
                return Err(Error::config("features_file", format!(
                    "{:?} with {:?} weighting needs feature statistics",
                    self.options.measure, self.options.feature_weighting)))
            }
            (false, _) => None,
        };
        let reweigh = Arc::new(Reweigh { weighting: self.options.feature_weighting, stats: stats.clone() });
        let measure = Measure::new(self.options.measure, stats)?;
        if matches!(self.options.measure, MeasureKind::KendallTau) {
            observer.warn("kendall tau is quadratic in the number of features per pair, expect a slow run");
        }
        let scorer = Arc::new(PairScorer::new(measure, self.options.weighting, self.options.filter, self.options.reversed));

        let vectors = reweigh.all(b_source.collect::<Result<Vec<IndexedVector>>>()?);
        let index = match self.options.algorithm {
            ApssAlgorithm::Inverted => Some(InvertedIndex::build(&vectors)),
            ApssAlgorithm::Naive => None,
        };
        if let Some(index) = &index {
            observer.debug(&format!("indexed {} features of {} vectors", index.features(), vectors.len()));
            if !scorer.skips_disjoint() {
                observer.warn("filter accepts disjoint pairs, inverted index falls back to a full scan; \
                    set a min_similarity above the measure's disjoint score to prune");
            }
        }
        let b_side = Arc::new(BSide { vectors, index });

        self.enter(ApssState::StripeDispatch, observer);
        let threads = self.pool.threads();
        let stripe_size = self
            .options
            .stripe_size
            .unwrap_or_else(|| ((b_side.vectors.len() + threads - 1) / threads).max(1));
        let counters = Arc::new(ApssStats::default());
        let mut scheduler = self.pool.scheduler();
        let mut report = ApssReport { b_vectors: b_side.vectors.len(), ..ApssReport::default() };

        for stripe in Chunker::new(a_source, stripe_size)? {
            let stripe = stripe?;
            report.a_vectors += stripe.len();
            report.stripes += 1;

            let (b_side, scorer, counters, shared) = (b_side.clone(), scorer.clone(), counters.clone(), shared.clone());
            let reweigh = reweigh.clone();
            let index = stripe.index;
            let task = Task::new(TaskKind::ApssStripe, move || {
                let a_side = reweigh.all(stripe.records);
                let mut out = BufferedSink::new(shared);
                let scored = match &b_side.index {
                    Some(idx) => inverted_apss(&a_side, &b_side.vectors, idx, &scorer, &counters, &mut out),
                    None => naive_apss(&a_side, &b_side.vectors, &scorer, &counters, &mut out),
                };
                let flushed = out.close();
                scored?;
                flushed
            })
            .with_property(KEY_STRIPE, index);
            scheduler.submit(task);

            for _ in scheduler.poll_completed()? {
                observer.task_completed();
            }
        }

        self.enter(ApssState::AwaitAll, observer);
        for _ in scheduler.await_all()? {
            observer.task_completed();
        }
        report.counts = counters.counts();
        Ok(report)
    }
}
