use crate::error::Result;
use crate::io::RecordSource;
use crate::observer::RunObserver;
use crate::records::{Token, TokenId, Weighted};

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Global feature statistics some measures need, read once per run from the
/// features frequency file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub marginals: Array1<f64>,
    pub grand_total: f64,
    pub cardinality: usize,
}

impl FeatureStats {

    pub fn load(features: RecordSource<Weighted<Token>>, observer: &RunObserver) -> Result<FeatureStats> {
        let mut totals: Vec<f64> = Vec::new();
        let mut seen: Vec<bool> = Vec::new();
        let mut duplicates = 0usize;
        for feature in features {
            let feature = feature?;
            let id = feature.record.id as usize;
            if id >= totals.len() {
                totals.resize(id + 1, 0.0);
                seen.resize(id + 1, false);
            }
            if seen[id] {
                duplicates += 1;
            }
            seen[id] = true;
            totals[id] += feature.weight;
        }
        if duplicates > 0 {
            observer.warn(&format!("merged {} duplicate feature frequencies", duplicates));
        }

        let marginals = Array1::from(totals);
        let stats = FeatureStats {
            grand_total: marginals.sum(),
            cardinality: marginals.len(),
            marginals,
        };
        observer.debug(&format!("loaded {} feature marginals, grand total {}", stats.cardinality, stats.grand_total));
        Ok(stats)
    }

    pub fn marginal(&self, feature: TokenId) -> f64 {
        self.marginals.get(feature as usize).copied().unwrap_or(0.0)
    }

    /// p(f), the share of all weight carried by one feature.
    pub fn prior(&self, feature: TokenId) -> f64 {
        if self.grand_total > 0.0 {
            self.marginal(feature) / self.grand_total
        } else {
            0.0
        }
    }
}
