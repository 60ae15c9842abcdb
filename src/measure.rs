// Similarity measures over sparse feature vectors. The set of measures is
// closed, a measure is picked by name from the alias table below.

use crate::error::{Error, Result};
use crate::stats::FeatureStats;
use crate::vectors::SparseVector;

use std::fmt::Display;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-10;

/// Measure selection as it appears in the configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureSpec {
    pub name: String,
    pub lee_alpha: f64,
    pub weeds_beta: f64,
    pub weeds_gamma: f64,
    pub lp_p: f64,
    pub lambda: f64,
}

impl Default for MeasureSpec {
    fn default() -> Self {
        Self {
            name: String::from("lin"),
            lee_alpha: 0.99,
            weeds_beta: 0.5,
            weeds_gamma: 0.5,
            lp_p: 2.0,
            lambda: 0.5,
        }
    }
}

impl Display for MeasureSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (lee_alpha: {}, weeds_beta: {}, weeds_gamma: {}, lp_p: {}, lambda: {})",
            self.name, self.lee_alpha, self.weeds_beta, self.weeds_gamma, self.lp_p, self.lambda)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasureKind {
    Jaccard,
    Dice,
    Cosine,
    DotProduct,
    Lin,
    Precision,
    Recall,
    Weeds { beta: f64, gamma: f64 },
    Lp { p: f64 },
    JensenShannon,
    LeeSkew { alpha: f64 },
    Confusion,
    KendallTau,
    Lambda { lambda: f64 },
}

impl MeasureSpec {

    /// Resolves the name through the alias table and checks the parameters
    /// the chosen measure reads.
    pub fn kind(&self) -> Result<MeasureKind> {
        let kind = match self.name.to_ascii_lowercase().as_str() {
            "jaccard" => MeasureKind::Jaccard,
            "dice" => MeasureKind::Dice,
            "cosine" => MeasureKind::Cosine,
            "dot" | "dotproduct" => MeasureKind::DotProduct,
            "lin" => MeasureKind::Lin,
            "precision" => MeasureKind::Precision,
            "recall" => MeasureKind::Recall,
            "weeds" | "crmi" => MeasureKind::Weeds { beta: self.weeds_beta, gamma: self.weeds_gamma },
            "lp" | "minkowski" => MeasureKind::Lp { p: self.lp_p },
            "manhattan" => MeasureKind::Lp { p: 1.0 },
            "euclidean" => MeasureKind::Lp { p: 2.0 },
            "js" | "jsd" | "jensenshannon" => MeasureKind::JensenShannon,
            "lee" | "leeskew" | "alphaskew" => MeasureKind::LeeSkew { alpha: self.lee_alpha },
            "confusion" => MeasureKind::Confusion,
            "kendall" | "kendalltau" | "tau" => MeasureKind::KendallTau,
            "lambda" | "lambdadivergence" => MeasureKind::Lambda { lambda: self.lambda },
            _ => return Err(Error::UnknownMeasure(self.name.clone())),
        };
        match kind {
            MeasureKind::Weeds { beta, gamma } => {
                if !(0.0..=1.0).contains(&beta) {
                    return Err(Error::config("weeds_beta", format!("expected in [0, 1], found {}", beta)));
                }
                if !(0.0..=1.0).contains(&gamma) {
                    return Err(Error::config("weeds_gamma", format!("expected in [0, 1], found {}", gamma)));
                }
            }
            MeasureKind::Lp { p } if p.is_nan() => {
                return Err(Error::config("lp_p", "must be a number"));
            }
            MeasureKind::LeeSkew { alpha } if !(alpha > 0.0 && alpha < 1.0) => {
                return Err(Error::config("lee_alpha", format!("expected in (0, 1), found {}", alpha)));
            }
            MeasureKind::Lambda { lambda } if !(lambda > 0.0 && lambda < 1.0) => {
                return Err(Error::config("lambda", format!("expected in (0, 1), found {}", lambda)));
            }
            _ => {}
        }
        Ok(kind)
    }
}

impl MeasureKind {
    pub fn needs_stats(&self) -> bool {
        matches!(self, MeasureKind::Confusion | MeasureKind::KendallTau)
    }
}

/// How a raw score is transformed before pairs are filtered and written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreWeighting {
    #[default]
    Identity,
    Negate,
    Inverse,
}

impl ScoreWeighting {
    pub fn apply(&self, score: f64) -> f64 {
        match self {
            ScoreWeighting::Identity => score,
            ScoreWeighting::Negate => -score,
            ScoreWeighting::Inverse => 1.0 / (1.0 + score),
        }
    }
}

/// A ready to use measure, bound to the statistics it needs.
#[derive(Clone, Debug)]
pub struct Measure {
    kind: MeasureKind,
    stats: Option<Arc<FeatureStats>>,
}

impl Measure {

    pub fn new(kind: MeasureKind, stats: Option<Arc<FeatureStats>>) -> Result<Measure> {
        if kind.needs_stats() && stats.is_none() {
            return Err(Error::config("measure", format!("{:?} needs feature statistics", kind)));
        }
        Ok(Self { kind, stats })
    }

    pub fn kind(&self) -> MeasureKind {
        self.kind
    }

    /// sim(a, b) == sim(b, a) for every pair
    pub fn is_commutative(&self) -> bool {
        match self.kind {
            MeasureKind::Precision | MeasureKind::Recall | MeasureKind::LeeSkew { .. } | MeasureKind::Confusion => false,
            MeasureKind::Weeds { beta, gamma } => (gamma - 1.0).abs() < EPSILON || (beta - 0.5).abs() < EPSILON,
            MeasureKind::Lambda { lambda } => (lambda - 0.5).abs() < EPSILON,
            _ => true,
        }
    }

    /// The score every pair without a shared feature receives, when that
    /// score does not depend on the vectors.
    pub fn disjoint_score(&self) -> Option<f64> {
        match self.kind {
            MeasureKind::Lp { .. }
            | MeasureKind::JensenShannon
            | MeasureKind::LeeSkew { .. }
            | MeasureKind::KendallTau
            | MeasureKind::Lambda { .. } => None,
            _ => Some(0.0),
        }
    }

    pub fn similarity(&self, a: &SparseVector, b: &SparseVector) -> f64 {
        match self.kind {
            MeasureKind::Jaccard => {
                let shared = shared_count(a, b);
                if shared == 0.0 { 0.0 } else { shared / (a.len() as f64 + b.len() as f64 - shared) }
            }
            MeasureKind::Dice => {
                let shared = shared_count(a, b);
                if shared == 0.0 { 0.0 } else { 2.0 * shared / (a.len() as f64 + b.len() as f64) }
            }
            MeasureKind::Cosine => {
                let denominator = a.norm() * b.norm();
                if denominator == 0.0 { 0.0 } else { dot(a, b) / denominator }
            }
            MeasureKind::DotProduct => dot(a, b),
            MeasureKind::Lin => {
                let shared = fold_shared(a, b, |x, y| x + y);
                if shared == 0.0 { 0.0 } else { shared / (a.sum() + b.sum()) }
            }
            MeasureKind::Precision => precision(a, b),
            MeasureKind::Recall => recall(a, b),
            MeasureKind::Weeds { beta, gamma } => {
                let p = precision(a, b);
                let r = recall(a, b);
                let arithmetic = beta * p + (1.0 - beta) * r;
                let harmonic = if p + r != 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
                gamma * harmonic + (1.0 - gamma) * arithmetic
            }
            MeasureKind::Lp { p } => lp_distance(a, b, p),
            MeasureKind::JensenShannon => jensen_shannon(a, b),
            MeasureKind::LeeSkew { alpha } => lee_skew(a, b, alpha),
            MeasureKind::Confusion => match &self.stats {
                Some(stats) => confusion(a, b, stats),
                None => 0.0,
            },
            MeasureKind::KendallTau => match &self.stats {
                Some(stats) => kendall_tau(a, b, stats.cardinality),
                None => 0.0,
            },
            MeasureKind::Lambda { lambda } => lambda_divergence(a, b, lambda),
        }
    }
}

// Two pointer walk over the union of both key sets. `f` receives the weight
// on each side, zero where a side lacks the feature.
fn walk_union<F: FnMut(u32, f64, f64)>(a: &SparseVector, b: &SparseVector, mut f: F) {
    let (ka, va) = (a.keys(), a.values());
    let (kb, vb) = (b.keys(), b.values());
    let (mut i, mut j) = (0, 0);
    while i < ka.len() && j < kb.len() {
        if ka[i] < kb[j] {
            f(ka[i], va[i], 0.0);
            i += 1;
        } else if ka[i] > kb[j] {
            f(kb[j], 0.0, vb[j]);
            j += 1;
        } else {
            f(ka[i], va[i], vb[j]);
            i += 1;
            j += 1;
        }
    }
    for k in i..ka.len() {
        f(ka[k], va[k], 0.0);
    }
    for k in j..kb.len() {
        f(kb[k], 0.0, vb[k]);
    }
}

fn fold_shared<F: Fn(f64, f64) -> f64>(a: &SparseVector, b: &SparseVector, f: F) -> f64 {
    let (ka, va) = (a.keys(), a.values());
    let (kb, vb) = (b.keys(), b.values());
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    while i < ka.len() && j < kb.len() {
        if ka[i] < kb[j] {
            i += 1;
        } else if ka[i] > kb[j] {
            j += 1;
        } else {
            total += f(va[i], vb[j]);
            i += 1;
            j += 1;
        }
    }
    total
}

fn shared_count(a: &SparseVector, b: &SparseVector) -> f64 {
    fold_shared(a, b, |_, _| 1.0)
}

fn dot(a: &SparseVector, b: &SparseVector) -> f64 {
    fold_shared(a, b, |x, y| x * y)
}

// share of b's weight found on features a also has
fn precision(a: &SparseVector, b: &SparseVector) -> f64 {
    let shared = fold_shared(a, b, |_, y| y);
    if shared == 0.0 { 0.0 } else { shared / b.sum() }
}

fn recall(a: &SparseVector, b: &SparseVector) -> f64 {
    let shared = fold_shared(a, b, |x, _| x);
    if shared == 0.0 { 0.0 } else { shared / a.sum() }
}

fn lp_distance(a: &SparseVector, b: &SparseVector, p: f64) -> f64 {
    if p == 0.0 {
        let mut differing = 0.0;
        walk_union(a, b, |_, x, y| if x != y { differing += 1.0 });
        differing
    } else if p == f64::INFINITY {
        let mut max = 0.0f64;
        walk_union(a, b, |_, x, y| max = max.max((x - y).abs()));
        max
    } else if p == f64::NEG_INFINITY {
        let mut min = f64::INFINITY;
        walk_union(a, b, |_, x, y| min = min.min((x - y).abs()));
        if min.is_infinite() { 0.0 } else { min }
    } else {
        let mut total = 0.0;
        walk_union(a, b, |_, x, y| total += (x - y).abs().powf(p));
        total.powf(1.0 / p)
    }
}

fn jensen_shannon(a: &SparseVector, b: &SparseVector) -> f64 {
    let (sa, sb) = (a.sum(), b.sum());
    let mut divergence = 0.0;
    walk_union(a, b, |_, x, y| {
        let q = if sa > 0.0 { x / sa } else { 0.0 };
        let r = if sb > 0.0 { y / sb } else { 0.0 };
        if q > 0.0 && r > 0.0 {
            let log_avg = (0.5 * (q + r)).log2();
            divergence += 0.5 * q * (q.log2() - log_avg) + 0.5 * r * (r.log2() - log_avg);
        } else {
            divergence += 0.5 * (q + r);
        }
    });
    // snap float noise onto the bounds
    if (divergence - 1.0).abs() < EPSILON {
        1.0
    } else if divergence.abs() < EPSILON {
        0.0
    } else {
        divergence
    }
}

// skew divergence of b from a, mixing alpha of a into b
fn lee_skew(a: &SparseVector, b: &SparseVector, alpha: f64) -> f64 {
    let (sa, sb) = (a.sum(), b.sum());
    let mut divergence = 0.0;
    walk_union(a, b, |_, x, y| {
        if y > 0.0 {
            let q = if sa > 0.0 { x / sa } else { 0.0 };
            let r = y / sb;
            let log_avg = (alpha * q + (1.0 - alpha) * r).log2();
            divergence += r * (r.log2() - log_avg);
        }
    });
    divergence
}

// JS divergence with the mixture weighted lambda towards a; a feature only
// one side has contributes its share times log2 of the inverse weight
fn lambda_divergence(a: &SparseVector, b: &SparseVector, lambda: f64) -> f64 {
    let (sa, sb) = (a.sum(), b.sum());
    let mut divergence = 0.0;
    walk_union(a, b, |_, x, y| {
        let q = if sa > 0.0 { x / sa } else { 0.0 };
        let r = if sb > 0.0 { y / sb } else { 0.0 };
        if q > 0.0 && r > 0.0 {
            let log_avg = (lambda * q + (1.0 - lambda) * r).log2();
            divergence += lambda * q * (q.log2() - log_avg) + (1.0 - lambda) * r * (r.log2() - log_avg);
        } else if q > 0.0 {
            divergence += lambda * q * -lambda.log2();
        } else if r > 0.0 {
            divergence += (1.0 - lambda) * r * -(1.0 - lambda).log2();
        }
    });
    if (divergence - 1.0).abs() < EPSILON {
        1.0
    } else if divergence.abs() < EPSILON {
        0.0
    } else {
        divergence
    }
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

// Kendall's tau-a over all `features` dimensions, a missing feature counts
// as weight 0. Dimensions neither vector has only add agreement with the
// shared ones, so the quadratic loop runs over the union alone.
fn kendall_tau(a: &SparseVector, b: &SparseVector, features: usize) -> f64 {
    let mut union: Vec<(f64, f64)> = Vec::with_capacity(a.len() + b.len());
    walk_union(a, b, |_, x, y| union.push((x, y)));
    let n = features.max(union.len()) as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mut agreement = 0.0;
    for (i, &(xi, yi)) in union.iter().enumerate() {
        for &(xj, yj) in &union[i + 1..] {
            agreement += sign(xi - xj) * sign(yi - yj);
        }
    }
    let outside = n - union.len() as f64;
    agreement += outside * union.iter().map(|&(x, y)| sign(x) * sign(y)).sum::<f64>();
    agreement / (n * (n - 1.0) / 2.0)
}

fn confusion(a: &SparseVector, b: &SparseVector, stats: &FeatureStats) -> f64 {
    if stats.grand_total <= 0.0 {
        return 0.0;
    }
    let p_ea = a.sum() / stats.grand_total;
    let (ka, va) = (a.keys(), a.values());
    let (kb, vb) = (b.keys(), b.values());
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    while i < ka.len() && j < kb.len() {
        if ka[i] < kb[j] {
            i += 1;
        } else if ka[i] > kb[j] {
            j += 1;
        } else {
            let p_fea = va[i] / a.sum();
            let p_feb = vb[j] / b.sum();
            let p_f = stats.prior(ka[i]);
            if p_fea * p_feb * p_ea * p_f > 0.0 {
                total += p_fea * p_feb * p_ea / p_f;
            }
            i += 1;
            j += 1;
        }
    }
    total
}
