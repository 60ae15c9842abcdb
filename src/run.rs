// imports
use crate::apss::{ApssReport, ThreadedApss};
use crate::config::Config;
use crate::count::{CountReport, Counts};
use crate::enumerator::{unindex_pairs, Enumerator};
use crate::error::{Error, Result};
use crate::filter::{FilterReport, Filters};
use crate::io::{BinaryCodec, RecordCodec, RecordSource, TsvCodec};
use crate::knn::Neighbours;
use crate::observer::RunObserver;
use crate::records::{Token, TokenPair, Weighted};
use crate::scheduler::WorkerPool;
use crate::sort::{ExternalSort, SortReport};
use crate::vectors::{IndexedVector, VectorSource};

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use log::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// count, filter when configured, all pairs, and neighbours in one go
    Build,
    Count,
    /// drops rare or unwanted entries, features and events from the counts
    Filter,
    AllPairs,
    Knn,
    /// sorts a weighted pairs TSV file, independent of the other stages
    Sort,
}

pub struct Pipeline {
    config: Config,
    pool: WorkerPool,
}

impl Pipeline {

    /// Validates the configuration and prepares the output directory. Nothing
    /// is read or written besides that.
    pub fn new(config: Config) -> Result<Pipeline> {
        config.validate()?;
        fs::create_dir_all(&config.output_dir)
            .map_err(|e| Error::io(format!("cannot create output dir {}", config.output_dir.display()), e))?;
        let pool = WorkerPool::new(config.threads())?;
        info!("{}", config);
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run(&self, stage: Stage) -> Result<()> {
        let timer = Instant::now();
        match stage {
            Stage::Build => self.build()?,
            Stage::Count => {
                self.count()?;
            }
            Stage::Filter => {
                self.filter()?;
            }
            Stage::AllPairs => {
                self.allpairs()?;
            }
            Stage::Knn => {
                self.knn()?;
            }
            Stage::Sort => {
                self.sort()?;
            }
        }
        info!("finished {:?}, took {} seconds ...", stage, timer.elapsed().as_secs());
        Ok(())
    }

    // runs the main procedure of 4 steps -
    // -> counting entries, features and events
    // -> filtering the counts, skipped when no filter is set
    // -> all pairs similarity
    // -> nearest neighbours, written out as strings
    fn build(&self) -> Result<()> {
        let files = self.config.files();
        if self.config.saved_counts && files.counts.exist() {
            info!("reusing counts saved in {}", self.config.output_dir.display());
        } else {
            if self.config.saved_counts {
                info!("saved_counts is set but counts are missing, counting again");
            }
            let timer = Instant::now();
            self.count()?;
            info!("finished counting, took {} seconds ...", timer.elapsed().as_secs());
        }

        if self.config.filter.is_active() {
            let timer = Instant::now();
            self.filter()?;
            info!("finished filtering, took {} seconds ...", timer.elapsed().as_secs());
        }

        let timer = Instant::now();
        self.allpairs()?;
        info!("finished all pairs, took {} seconds ...", timer.elapsed().as_secs());

        let timer = Instant::now();
        self.knn()?;
        info!("finished neighbours, took {} seconds ...", timer.elapsed().as_secs());
        Ok(())
    }

    pub fn count(&self) -> Result<CountReport> {
        let observer = RunObserver::start("count");
        let report = Counts::run(
            &self.config.input_file,
            &self.config.files().counts,
            &self.config.sort_options(),
            self.config.compress_temp_files,
            &self.pool,
            &observer,
        );
        observer.finish();
        report
    }

    pub fn filter(&self) -> Result<FilterReport> {
        let files = self.config.files();
        let observer = RunObserver::start("filter");
        let report = Filters::from_section(&self.config.filter).and_then(|filters| {
            filters.run(
                &files.counts,
                &files.filtered,
                self.config.compress_temp_files,
                self.config.temp_dir.as_deref(),
                self.config.cleanup_on_failure,
                &observer,
            )
        });
        observer.finish();
        report
    }

    fn vectors(&self, events: &Path) -> Result<RecordSource<IndexedVector>> {
        let codec: BinaryCodec<Weighted<TokenPair>> = BinaryCodec::new(self.config.compress_temp_files);
        let source = VectorSource::new(codec.open_source(events)?, events.display().to_string());
        Ok(Box::new(source))
    }

    pub fn allpairs(&self) -> Result<ApssReport> {
        let files = self.config.files();
        let observer = RunObserver::start("allpairs");
        let options = self.config.apss_options()?;
        // a configured filter means the filter stage's files are the input
        let (events, features) = if self.config.filter.is_active() {
            (&files.filtered.events, &files.filtered.features)
        } else {
            (&files.counts.events, &files.counts.features)
        };

        let features = if options.measure.needs_stats() || options.feature_weighting.needs_stats() {
            let codec: BinaryCodec<Weighted<Token>> = BinaryCodec::new(self.config.compress_temp_files);
            Some(codec.open_source(features)?)
        } else {
            None
        };
        // the same events file is opened twice, once per side
        let a_side = self.vectors(events)?;
        let b_side = self.vectors(events)?;
        let codec: BinaryCodec<Weighted<TokenPair>> = BinaryCodec::new(self.config.compress_temp_files);
        let sink = codec.open_sink(&files.similarities)?;

        let mut apss = ThreadedApss::new(options, self.pool.clone())?;
        let report = apss.run(a_side, b_side, features, sink, &observer);
        observer.finish();
        report
    }

    pub fn knn(&self) -> Result<SortReport> {
        let files = self.config.files();
        let observer = RunObserver::start("knn");
        let report = Neighbours::run(
            &files.similarities,
            &files.neighbours,
            self.config.knn.k,
            &self.config.sort_options(),
            self.config.compress_temp_files,
            &self.pool,
            &observer,
        )?;

        let entries = Enumerator::load(&files.counts.entries_index)?;
        let codec: BinaryCodec<Weighted<TokenPair>> = BinaryCodec::new(self.config.compress_temp_files);
        let lines = unindex_pairs(codec.open_source(&files.neighbours)?, &entries, &files.neighbours_strings)?;
        observer.info(&format!("wrote {} neighbour lines to {}", lines, files.neighbours_strings.display()));
        observer.finish();
        Ok(report)
    }

    pub fn sort(&self) -> Result<SortReport> {
        let files = self.config.files();
        let observer = RunObserver::start("sort");
        let codec: Arc<TsvCodec<Weighted<TokenPair>>> = Arc::new(TsvCodec::new());
        let sort = ExternalSort::new(
            self.config.sort_options(),
            Weighted::record_order(TokenPair::index_order()),
            codec,
            self.pool.clone(),
        )?;
        let report = sort.sort_file(&self.config.input_file, &files.sorted, &observer);
        observer.finish();
        report
    }
}
