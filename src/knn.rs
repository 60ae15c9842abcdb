use crate::error::{Error, Result};
use crate::io::{BinaryCodec, RecordCodec};
use crate::observer::RunObserver;
use crate::records::{neighbour_order, TokenPair, Weighted};
use crate::reduce::top_k_decorator;
use crate::scheduler::WorkerPool;
use crate::sort::{ExternalSort, SortOptions, SortReport};

use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_K: usize = 100;

pub struct Neighbours {}

impl Neighbours {

    /// Keeps the `k` nearest neighbours of every entry of the similarity file
    /// `src`. Output is grouped by entry, nearest first.
    ///
    /// The top-k selection wraps every run the sort writes, so no run ever
    /// holds more than `k` pairs per entry.
    pub fn run(
        src: &Path,
        dst: &Path,
        k: usize,
        options: &SortOptions,
        compress: bool,
        pool: &WorkerPool,
        observer: &RunObserver,
    ) -> Result<SortReport> {
        if k < 1 {
            return Err(Error::config("k", "must be at least 1"));
        }
        let codec: Arc<dyn RecordCodec<Weighted<TokenPair>>> = Arc::new(BinaryCodec::new(compress));
        let sort = ExternalSort::new(
            SortOptions { reverse: false, ..options.clone() },
            neighbour_order(),
            codec,
            pool.clone(),
        )?
        .with_sink_decorator(top_k_decorator(Weighted::record_order(TokenPair::first_index_order()), k));
        observer.info(&format!("selecting {} nearest neighbours", k));
        sort.sort_file(src, dst, observer)
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::{drain_into, vec_source};
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    #[test]
    fn keeps_k_nearest_per_entry() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("sims.bin");
        let dst = dir.path().join("neighbours.bin");
        let codec: BinaryCodec<Weighted<TokenPair>> = BinaryCodec::new(false);

        // entry 0 has 10 neighbours, entry 1 only two
        let mut pairs: Vec<Weighted<TokenPair>> = (1..=10u32)
            .map(|j| Weighted::new(TokenPair::new(0, j), j as f64 / 10.0))
            .collect();
        pairs.push(Weighted::new(TokenPair::new(1, 0), 0.3));
        pairs.push(Weighted::new(TokenPair::new(1, 5), 0.7));
        pairs.shuffle(&mut StdRng::seed_from_u64(4));
        drain_into(vec_source(pairs), &mut codec.open_sink(&src).unwrap()).unwrap();

        let options = SortOptions { chunk_size: 3, temp_dir: Some(dir.path().join("tmp")), ..SortOptions::default() };
        let observer = RunObserver::start("knn-test");
        Neighbours::run(&src, &dst, 3, &options, false, &WorkerPool::new(2).unwrap(), &observer).unwrap();

        let got: Vec<(u32, u32)> = codec
            .open_source(&dst)
            .unwrap()
            .map(|p| p.unwrap().record)
            .map(|p| (p.id1, p.id2))
            .collect();
        assert_eq!(got, vec![(0, 10), (0, 9), (0, 8), (1, 5), (1, 0)]);
    }

    #[test]
    fn zero_k_rejected() {
        let dir = TempDir::new().unwrap();
        let observer = RunObserver::start("knn-test");
        let err = Neighbours::run(
            &dir.path().join("a"),
            &dir.path().join("b"),
            0,
            &SortOptions::default(),
            false,
            &WorkerPool::new(1).unwrap(),
            &observer,
        )
        .unwrap_err();
        assert!(err.is_config());
    }
}
