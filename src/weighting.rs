// Feature weightings applied to each entry's vector before it is compared.
// All but the length normalisation read the global feature marginals.

use crate::stats::FeatureStats;
use crate::vectors::{IndexedVector, SparseVector};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureWeighting {
    /// raw counts
    #[default]
    Identity,
    /// log2 p(e,f) / p(e)p(f), negative associations dropped
    PositivePmi,
    SquaredPmi,
    TTest,
    /// log likelihood ratio of the feature given the entry
    Llr,
    ChiSquared,
    Dice,
    /// scaled to unit euclidean length
    L2Unit,
}

impl FeatureWeighting {

    pub fn needs_stats(&self) -> bool {
        !matches!(self, FeatureWeighting::Identity | FeatureWeighting::L2Unit)
    }

    /// Reweights every feature of `vector`. Weights that come out
    /// non-positive or not finite are dropped, like non-positive counts.
    /// Without statistics only the weightings that need none apply.
    pub fn apply(&self, vector: &SparseVector, stats: Option<&FeatureStats>) -> SparseVector {
        match (self, stats) {
            (FeatureWeighting::Identity, _) => vector.clone(),
            (FeatureWeighting::L2Unit, _) => {
                let norm = vector.norm();
                if norm == 0.0 {
                    return vector.clone();
                }
                SparseVector::from_pairs(vector.iter().map(|(k, v)| (k, v / norm)).collect())
            }
            (_, None) => vector.clone(),
            (weighting, Some(stats)) => {
                let entry_total = vector.sum();
                let pairs = vector
                    .iter()
                    .map(|(k, v)| (k, weighting.contextual(v, entry_total, stats.marginal(k), stats.grand_total)))
                    .filter(|(_, v)| v.is_finite())
                    .collect();
                SparseVector::from_pairs(pairs)
            }
        }
    }

    pub fn apply_indexed(&self, vector: IndexedVector, stats: Option<&FeatureStats>) -> IndexedVector {
        match self {
            FeatureWeighting::Identity => vector,
            _ => IndexedVector { entry: vector.entry, vector: self.apply(&vector.vector, stats) },
        }
    }

    // `value` is the entry/feature weight, `entry` the entry's total weight,
    // `feature` the feature marginal and `total` the grand total
    fn contextual(&self, value: f64, entry: f64, feature: f64, total: f64) -> f64 {
        let joint = value / total;
        let entry_prior = entry / total;
        let feature_prior = feature / total;
        match self {
            FeatureWeighting::PositivePmi => (joint / (entry_prior * feature_prior)).log2(),
            FeatureWeighting::SquaredPmi => 2.0 * joint.log2() - (entry_prior.log2() + feature_prior.log2()),
            FeatureWeighting::TTest => {
                let product = entry_prior * feature_prior;
                (joint - product) / product.sqrt()
            }
            FeatureWeighting::Llr => {
                let alternative = (value / entry).log2();
                let null = ((feature - value) / (total - entry)).log2();
                2.0 * (alternative - null)
            }
            FeatureWeighting::ChiSquared => {
                // contingency table of entry against feature
                let o11 = value;
                let o12 = entry - value;
                let o21 = feature - value;
                let o22 = total - o11 - o12 - o21;
                let d = o11 * o22 - o12 * o21;
                total * d * d / ((o11 + o12) * (o11 + o21) * (o12 + o22) * (o21 + o22))
            }
            FeatureWeighting::Dice => 2.0 * value / (entry + feature),
            FeatureWeighting::Identity | FeatureWeighting::L2Unit => value,
        }
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use ndarray::Array1;

    fn stats(marginals: &[f64]) -> FeatureStats {
        let marginals = Array1::from(marginals.to_vec());
        FeatureStats { grand_total: marginals.sum(), cardinality: marginals.len(), marginals }
    }

    fn weights(weighting: FeatureWeighting, pairs: &[(u32, f64)], stats: &FeatureStats) -> Vec<(u32, f64)> {
        weighting.apply(&SparseVector::from_pairs(pairs.to_vec()), Some(stats)).iter().collect()
    }

    #[test]
    fn positive_pmi_keeps_only_associations() {
        // entry holds 1 of 4, feature 0 holds 1 of 4: log2(4) = 2
        let s = stats(&[1.0, 3.0]);
        assert_eq!(weights(FeatureWeighting::PositivePmi, &[(0, 1.0)], &s), vec![(0, 2.0)]);
        // exactly as frequent as chance, log2(1) = 0, dropped
        let s = stats(&[2.0, 2.0]);
        assert!(weights(FeatureWeighting::PositivePmi, &[(0, 1.0), (1, 1.0)], &s).is_empty());
    }

    #[test]
    fn dice_and_ttest() {
        let s = stats(&[2.0, 6.0]);
        // 2 * 1 / (2 + 2)
        let dice = weights(FeatureWeighting::Dice, &[(0, 1.0), (1, 1.0)], &s);
        assert!((dice[0].1 - 0.5).abs() < 1e-12);
        // joint 1/8 against product 2/8 * 2/8
        let t = weights(FeatureWeighting::TTest, &[(0, 1.0), (1, 1.0)], &s);
        assert!((t[0].1 - (0.125 - 0.0625) / 0.25).abs() < 1e-12);
    }

    #[test]
    fn chi_squared_of_a_perfect_association() {
        // entry 0 owns feature 0, the rest of the table is feature 1
        let s = stats(&[2.0, 2.0]);
        let chi = weights(FeatureWeighting::ChiSquared, &[(0, 2.0)], &s);
        assert!((chi[0].1 - 4.0).abs() < 1e-12);
    }

    #[test]
    fn unbounded_weights_are_dropped() {
        // the feature only occurs with this entry, the null hypothesis has
        // probability zero
        let s = stats(&[2.0, 2.0]);
        assert!(weights(FeatureWeighting::Llr, &[(0, 2.0)], &s).is_empty());
        let llr = weights(FeatureWeighting::Llr, &[(0, 1.0), (1, 1.0)], &stats(&[2.0, 6.0]));
        // log2(1/2) - log2(1/6), doubled
        assert!((llr[0].1 - 2.0 * (3f64).log2()).abs() < 1e-12);
    }

    #[test]
    fn l2_unit_needs_no_stats() {
        let v = SparseVector::from_pairs(vec![(0, 3.0), (1, 4.0)]);
        assert!(!FeatureWeighting::L2Unit.needs_stats());
        let unit = FeatureWeighting::L2Unit.apply(&v, None);
        assert!((unit.norm() - 1.0).abs() < 1e-12);
        assert_eq!(FeatureWeighting::Identity.apply(&v, None), v);
        assert!(FeatureWeighting::SquaredPmi.needs_stats());
    }
}
