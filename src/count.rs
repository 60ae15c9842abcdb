// imports
use crate::enumerator::Enumerator;
use crate::error::{Error, Result};
use crate::io::{channel_source, drain_into, open_reader, BinaryCodec, RecordCodec, TsvCodec};
use crate::observer::RunObserver;
use crate::records::{Record, Token, TokenPair, Weighted};
use crate::reduce::weight_sum_decorator;
use crate::scheduler::WorkerPool;
use crate::sort::{ExternalSort, SortOptions, SortReport};

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread;

/// Records waiting between the reader and each sort.
const HANDOFF_CAPACITY: usize = 8192;

/// Where the count stage puts its outputs inside the output directory.
#[derive(Clone, Debug, PartialEq)]
pub struct CountFiles {
    pub entries: PathBuf,
    pub features: PathBuf,
    pub events: PathBuf,
    pub entries_tsv: PathBuf,
    pub features_tsv: PathBuf,
    pub events_tsv: PathBuf,
    pub entries_index: PathBuf,
    pub features_index: PathBuf,
}

impl CountFiles {
    pub fn in_dir(dir: &Path) -> CountFiles {
        Self {
            entries: dir.join("entries.bin"),
            features: dir.join("features.bin"),
            events: dir.join("events.bin"),
            entries_tsv: dir.join("entries.tsv"),
            features_tsv: dir.join("features.tsv"),
            events_tsv: dir.join("events.tsv"),
            entries_index: dir.join("entries.index.json"),
            features_index: dir.join("features.index.json"),
        }
    }

    /// True when a previous count left every file the later stages read.
    pub fn exist(&self) -> bool {
        [&self.entries, &self.features, &self.events, &self.entries_index, &self.features_index]
            .iter()
            .all(|p| p.exists())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountReport {
    pub instances: u64,
    pub entries: SortReport,
    pub features: SortReport,
    pub events: SortReport,
}

pub struct Counts {}

impl Counts {

    /// Parses one `entry<TAB>feature[<TAB>weight]` line, weight defaults to 1.
    fn parse_line(line: &str) -> std::result::Result<Option<(&str, &str, f64)>, String> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return Ok(None);
        }
        let mut fields = line.split('\t');
        let entry = fields.next().unwrap_or_default();
        let feature = fields.next().ok_or_else(|| String::from("missing feature column"))?;
        let weight = match fields.next() {
            Some(w) => w.trim().parse::<f64>().map_err(|_| format!("cannot parse weight from \"{}\"", w))?,
            None => 1.0,
        };
        if entry.is_empty() || feature.is_empty() {
            return Err(String::from("empty entry or feature"));
        }
        Ok(Some((entry, feature, weight)))
    }

    // reader side: enumerates every instance and fans it out to the three sorts
    fn read_instances(
        input: &Path,
        entries: &Enumerator,
        features: &Enumerator,
        to_entries: &SyncSender<Result<Weighted<Token>>>,
        to_features: &SyncSender<Result<Weighted<Token>>>,
        to_events: &SyncSender<Result<Weighted<TokenPair>>>,
    ) -> Result<u64> {
        let reader = open_reader(input)?;
        let closed = || Error::disconnected("count sort stopped reading");
        let mut instances = 0;
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io(format!("cannot read {}", input.display()), e))?;
            let (entry, feature, weight) = match Counts::parse_line(&line) {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(m) => return Err(Error::format(format!("{}:{}", input.display(), i + 1), m)),
            };
            let entry = entries.index_of(entry)?;
            let feature = features.index_of(feature)?;
            to_entries.send(Ok(Weighted::new(Token::new(entry), weight))).map_err(|_| closed())?;
            to_features.send(Ok(Weighted::new(Token::new(feature), weight))).map_err(|_| closed())?;
            to_events.send(Ok(Weighted::new(TokenPair::new(entry, feature), weight))).map_err(|_| closed())?;
            instances += 1;
        }
        Ok(instances)
    }

    /// Counts entries, features and entry/feature events of the instances
    /// file. The three sorts run side by side on `pool`, each folding
    /// duplicate keys into one weighted record.
    pub fn run(
        input: &Path,
        files: &CountFiles,
        options: &SortOptions,
        compress_temp_files: bool,
        pool: &WorkerPool,
        observer: &RunObserver,
    ) -> Result<CountReport> {
        let entries = Enumerator::new();
        let features = Enumerator::new();

        let (to_entries, entries_rx) = sync_channel(HANDOFF_CAPACITY);
        let (to_features, features_rx) = sync_channel(HANDOFF_CAPACITY);
        let (to_events, events_rx) = sync_channel(HANDOFF_CAPACITY);

        let token_sort = |name: &str| -> Result<ExternalSort<Weighted<Token>>> {
            ExternalSort::new(
                SortOptions { reverse: false, ..options.clone() },
                Weighted::record_order(Token::order()),
                Arc::new(BinaryCodec::new(compress_temp_files)),
                pool.clone(),
            )
            .map(|sort| {
                observer.debug(&format!("{} sort ready", name));
                sort.with_sink_decorator(weight_sum_decorator(Token::order()))
            })
        };
        let entries_sort = token_sort("entries")?;
        let features_sort = token_sort("features")?;
        let events_sort = ExternalSort::new(
            SortOptions { reverse: false, ..options.clone() },
            Weighted::record_order(TokenPair::index_order()),
            Arc::new(BinaryCodec::new(compress_temp_files)),
            pool.clone(),
        )?
        .with_sink_decorator(weight_sum_decorator(TokenPair::index_order()));

        let entries_observer = observer.child("entries");
        let features_observer = observer.child("features");
        let events_observer = observer.child("events");

        let (read, sorted_entries, sorted_features, sorted_events) = thread::scope(|scope| {
            let entries_run = scope.spawn(|| entries_sort.sort(channel_source(entries_rx), &files.entries, &entries_observer));
            let features_run = scope.spawn(|| features_sort.sort(channel_source(features_rx), &files.features, &features_observer));
            let events_run = scope.spawn(|| events_sort.sort(channel_source(events_rx), &files.events, &events_observer));

            let read = Counts::read_instances(input, &entries, &features, &to_entries, &to_features, &to_events);
            if let Err(e) = &read {
                // fail every sort so none of them moves a partial result into place
                let _ = to_entries.send(Err(Error::format("instances", e.to_string())));
                let _ = to_features.send(Err(Error::format("instances", e.to_string())));
                let _ = to_events.send(Err(Error::format("instances", e.to_string())));
            }
            drop((to_entries, to_features, to_events));

            (read, join(entries_run), join(features_run), join(events_run))
        });
        entries_observer.finish();
        features_observer.finish();
        events_observer.finish();

        let report = match read {
            Err(Error::Disconnected { context }) => {
                // the reader stopped because a sort gave up, that sort's error is the cause
                sorted_entries?;
                sorted_features?;
                sorted_events?;
                return Err(Error::disconnected(context));
            }
            read => CountReport {
                instances: read?,
                entries: sorted_entries?,
                features: sorted_features?,
                events: sorted_events?,
            },
        };
        let instances = report.instances;
        observer.info(&format!("read {} instances, {} entries, {} features",
            instances, entries.len(), features.len()));

        entries.save(&files.entries_index)?;
        features.save(&files.features_index)?;

        let codec_tokens: BinaryCodec<Weighted<Token>> = BinaryCodec::new(compress_temp_files);
        let codec_events: BinaryCodec<Weighted<TokenPair>> = BinaryCodec::new(compress_temp_files);
        Counts::write_tsv(&codec_tokens, &files.entries, &files.entries_tsv)?;
        Counts::write_tsv(&codec_tokens, &files.features, &files.features_tsv)?;
        Counts::write_tsv(&codec_events, &files.events, &files.events_tsv)?;

        Ok(report)
    }

    fn write_tsv<T>(codec: &dyn RecordCodec<T>, src: &Path, dst: &Path) -> Result<u64>
    where
        T: Record,
        TsvCodec<T>: RecordCodec<T>,
    {
        let mut sink = TsvCodec::<T>::new().open_sink(dst)?;
        drain_into(codec.open_source(src)?, &mut sink)
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(Error::TaskPanicked { task: String::from("count sort"), message: String::from("sort thread panicked") }),
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::read_to_string;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> SortOptions {
        SortOptions { chunk_size: 3, temp_dir: Some(dir.path().join("tmp")), ..SortOptions::default() }
    }

    #[test]
    fn parse_lines() {
        assert_eq!(Counts::parse_line("cat\tfur").unwrap(), Some(("cat", "fur", 1.0)));
        assert_eq!(Counts::parse_line("cat\tfur\t2.5\r").unwrap(), Some(("cat", "fur", 2.5)));
        assert_eq!(Counts::parse_line("   ").unwrap(), None);
        assert!(Counts::parse_line("cat").is_err());
        assert!(Counts::parse_line("cat\tfur\tlots").is_err());
    }

    #[test]
    fn counts_with_weight_sums() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("instances.tsv");
        std::fs::write(&input, "cat\tfur\ndog\tfur\ncat\tfur\ncat\tmeow\t2\n\ndog\tbark\n").unwrap();
        let files = CountFiles::in_dir(dir.path());
        let observer = RunObserver::start("count-test");

        let report = Counts::run(&input, &files, &options(&dir), false, &WorkerPool::new(2).unwrap(), &observer).unwrap();
        assert_eq!(report.instances, 5);
        assert!(files.exist());

        // ids follow first sight: cat 0, dog 1; fur 0, meow 1, bark 2
        assert_eq!(read_to_string(&files.entries_tsv).unwrap(), "0\t4\n1\t2\n");
        assert_eq!(read_to_string(&files.features_tsv).unwrap(), "0\t3\n1\t2\n2\t1\n");
        assert_eq!(read_to_string(&files.events_tsv).unwrap(), "0\t0\t2\n0\t1\t2\n1\t0\t1\n1\t2\t1\n");

        let entries = Enumerator::load(&files.entries_index).unwrap();
        assert_eq!(entries.value_of(1).unwrap(), "dog");
    }

    #[test]
    fn malformed_input_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("instances.tsv");
        std::fs::write(&input, "cat\tfur\nbroken-line\n").unwrap();
        let files = CountFiles::in_dir(dir.path());
        let observer = RunObserver::start("count-test");

        let err = Counts::run(&input, &files, &options(&dir), false, &WorkerPool::new(2).unwrap(), &observer).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(!files.entries.exists());
        assert!(!files.events.exists());
    }

    #[test]
    fn failing_sort_reports_its_own_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("instances.tsv");
        let lines: String = (0..20_000).map(|i| format!("w{}\tf{}\n", i % 50, i % 70)).collect();
        std::fs::write(&input, lines).unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let options = SortOptions { chunk_size: 100, temp_dir: Some(blocker.join("tmp")), ..SortOptions::default() };
        let files = CountFiles::in_dir(dir.path());
        let observer = RunObserver::start("count-test");

        let err = Counts::run(&input, &files, &options, false, &WorkerPool::new(2).unwrap(), &observer).unwrap_err();
        assert!(err.to_string().contains("cannot create temp dir"), "{}", err);
        assert!(!files.entries.exists());
    }
}
