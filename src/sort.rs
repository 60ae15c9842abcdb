// Out-of-core sort: chunks are sorted in memory and written as runs, runs are
// merged pairwise through a binary-counter merge tree on the worker pool, and
// the last run standing is moved onto the destination.

use crate::chunker::{Chunk, Chunker};
use crate::error::{Error, Result};
use crate::io::{drain_into, move_file, RecordCodec, RecordSink, RecordSource, TempFileFactory};
use crate::merge::merge_sorted;
use crate::observer::RunObserver;
use crate::records::{reverse, Comparator, Record};
use crate::scheduler::{
    Scheduler, Task, TaskInfo, TaskKind, WorkerPool, KEY_DEPTH, KEY_DST_FILE, KEY_LINEAGE, KEY_SRC_FILE,
    KEY_SRC_FILE_A, KEY_SRC_FILE_B,
};

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on merge tree depth, a run at depth d holds chunk_size * 2^d records.
pub const MAX_DEPTH: usize = 64;

pub const DEFAULT_CHUNK_SIZE: usize = 500_000;

/// Wraps every run sink the sort opens, temp runs included. Used to fold
/// reducers into the merge so runs shrink as they are written.
pub type SinkDecorator<T> = Arc<dyn Fn(Box<dyn RecordSink<T>>) -> Box<dyn RecordSink<T>> + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct SortOptions {
    pub chunk_size: usize,
    pub reverse: bool,
    pub cleanup_on_failure: bool,
    pub temp_dir: Option<PathBuf>,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, reverse: false, cleanup_on_failure: false, temp_dir: None }
    }
}

impl Display for SortOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk_size: {}, reverse: {}, cleanup_on_failure: {}, temp_dir: {:?}",
            self.chunk_size, self.reverse, self.cleanup_on_failure, self.temp_dir)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortState {
    Mapping,
    Merging,
    Finishing,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortReport {
    pub records: u64,
    pub chunks: usize,
    pub merges: usize,
    /// Merge tree slots holding a run once every task drained, bit d for
    /// depth d. Equals `chunks` when the tree is consistent.
    pub occupied_slots: u64,
}

pub struct ExternalSort<T: Record> {
    options: SortOptions,
    comparator: Comparator<T>,
    codec: Arc<dyn RecordCodec<T>>,
    decorator: Option<SinkDecorator<T>>,
    pool: WorkerPool,
}

impl<T: Record> ExternalSort<T> {

    pub fn new(
        options: SortOptions,
        comparator: Comparator<T>,
        codec: Arc<dyn RecordCodec<T>>,
        pool: WorkerPool,
    ) -> Result<ExternalSort<T>> {
        if options.chunk_size < 1 {
            return Err(Error::config("chunk_size", "must be at least 1"));
        }
        let comparator = if options.reverse { reverse(comparator) } else { comparator };
        Ok(Self { options, comparator, codec, decorator: None, pool })
    }

    pub fn with_sink_decorator(mut self, decorator: SinkDecorator<T>) -> ExternalSort<T> {
        self.decorator = Some(decorator);
        self
    }

    pub fn options(&self) -> &SortOptions {
        &self.options
    }

    /// Sorts the records of `src` (read with this sort's codec) into `dst`.
    pub fn sort_file(&self, src: &Path, dst: &Path, observer: &RunObserver) -> Result<SortReport> {
        if same_path(src, dst) {
            return Err(Error::config("destination", format!("{} is also the source", dst.display())));
        }
        let source = self.codec.open_source(src)?;
        self.sort(source, dst, observer)
    }

    /// Sorts a record stream into `dst`. The destination only appears after
    /// every merge succeeded.
    pub fn sort(&self, source: RecordSource<T>, dst: &Path, observer: &RunObserver) -> Result<SortReport> {
        let temp = Arc::new(TempFileFactory::new(self.options.temp_dir.as_deref())?);
        let mut run = SortRun {
            sort: self,
            scheduler: self.pool.scheduler(),
            temp: temp.clone(),
            slots: vec![None; MAX_DEPTH],
            state: SortState::Mapping,
            observer,
            report: SortReport::default(),
        };
        observer.debug(&format!("sorting into {} with {}", dst.display(), self.options));

        match run.execute(source, dst) {
            Ok(report) => {
                observer.info(&format!("sorted {} records in {} chunks with {} merges",
                    report.records, report.chunks, report.merges));
                Ok(report)
            }
            Err(e) => {
                observer.warn(&format!("sort failed while {:?}: {}", run.state, e));
                run.state = SortState::Failed;
                // drain the pool first so no worker is still writing a run
                let _ = run.scheduler.await_all();
                if self.options.cleanup_on_failure {
                    let removed = temp.cleanup();
                    observer.warn(&format!("sort failed, removed {} temp files", removed));
                } else {
                    let left = temp.live_files().len();
                    observer.warn(&format!("sort failed, leaving {} temp files in {}", left, temp.dir().display()));
                }
                Err(e)
            }
        }
    }

    fn open_run_sink(&self, path: &Path) -> Result<Box<dyn RecordSink<T>>> {
        open_decorated(self.codec.as_ref(), self.decorator.as_ref(), path)
    }
}

fn open_decorated<T: Record>(
    codec: &dyn RecordCodec<T>,
    decorator: Option<&SinkDecorator<T>>,
    path: &Path,
) -> Result<Box<dyn RecordSink<T>>> {
    let sink = codec.open_sink(path)?;
    Ok(match decorator {
        Some(decorate) => decorate(sink),
        None => sink,
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

struct SortRun<'a, T: Record> {
    sort: &'a ExternalSort<T>,
    scheduler: Scheduler,
    temp: Arc<TempFileFactory>,
    slots: Vec<Option<PathBuf>>,
    state: SortState,
    observer: &'a RunObserver,
    report: SortReport,
}

impl<'a, T: Record> SortRun<'a, T> {

    fn execute(&mut self, source: RecordSource<T>, dst: &Path) -> Result<SortReport> {
        self.enter(SortState::Mapping);
        let mut chunker = Chunker::new(source, self.sort.options.chunk_size)?;
        while let Some(chunk) = chunker.next_chunk()? {
            self.submit_chunk(chunk)?;
            for info in self.scheduler.poll_completed()? {
                self.completed(info)?;
            }
        }

        self.enter(SortState::Merging);
        while let Some(info) = self.scheduler.await_next()? {
            self.completed(info)?;
        }

        self.report.occupied_slots = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u64, |bits, (depth, _)| bits | (1u64 << depth));
        self.enter(SortState::Finishing);
        self.finish(dst)?;
        self.enter(SortState::Done);
        Ok(self.report)
    }

    fn enter(&mut self, state: SortState) {
        self.state = state;
        self.observer.debug(&format!("sort entering {:?}", state));
    }

    fn submit_chunk(&mut self, chunk: Chunk<T>) -> Result<()> {
        let dst = self.temp.create_file()?;
        self.report.chunks += 1;
        self.report.records += chunk.len() as u64;

        let comparator = self.sort.comparator.clone();
        let codec = self.sort.codec.clone();
        let decorator = self.sort.decorator.clone();
        let path = dst.clone();
        let task = Task::new(TaskKind::SortChunk, move || {
            let mut records = chunk.records;
            records.sort_unstable_by(|a, b| comparator(a, b));
            let mut sink = open_decorated(codec.as_ref(), decorator.as_ref(), &path)?;
            drain_into(records.into_iter().map(Ok), &mut sink)?;
            Ok(())
        })
        .with_property(KEY_DST_FILE, dst.display())
        .with_property(KEY_DEPTH, 0)
        .with_property(KEY_LINEAGE, self.observer.name());
        self.scheduler.submit(task);
        Ok(())
    }

    // completion handler, decides the follow-up work of a finished task
    fn completed(&mut self, info: TaskInfo) -> Result<()> {
        self.observer.task_completed();
        match info.kind {
            TaskKind::SortChunk => self.queue_merge(info.path(KEY_DST_FILE)?, 0),
            TaskKind::MergePair => {
                self.queue_merge(info.path(KEY_DST_FILE)?, info.depth()? + 1)?;
                self.submit_delete(info.path(KEY_SRC_FILE_A)?);
                self.submit_delete(info.path(KEY_SRC_FILE_B)?);
                Ok(())
            }
            TaskKind::DeleteFile => Ok(()),
            TaskKind::ApssStripe => Err(Error::format(info.to_string(), "not a sort task")),
        }
    }

    fn queue_merge(&mut self, file: PathBuf, depth: usize) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(Error::format("merge tree", format!("depth {} exceeds {}", depth, MAX_DEPTH)));
        }
        match self.slots[depth].take() {
            None => {
                self.slots[depth] = Some(file);
                Ok(())
            }
            Some(pending) => self.submit_merge(pending, file, depth),
        }
    }

    fn submit_merge(&mut self, a: PathBuf, b: PathBuf, depth: usize) -> Result<()> {
        let dst = self.temp.create_file()?;
        self.report.merges += 1;

        let comparator = self.sort.comparator.clone();
        let codec = self.sort.codec.clone();
        let decorator = self.sort.decorator.clone();
        let (src_a, src_b, path) = (a.clone(), b.clone(), dst.clone());
        let task = Task::new(TaskKind::MergePair, move || {
            merge_runs(codec.as_ref(), decorator.as_ref(), &comparator, &src_a, &src_b, &path)
        })
        .with_property(KEY_SRC_FILE_A, a.display())
        .with_property(KEY_SRC_FILE_B, b.display())
        .with_property(KEY_DST_FILE, dst.display())
        .with_property(KEY_DEPTH, depth)
        .with_property(KEY_LINEAGE, self.observer.name());
        self.scheduler.submit(task);
        Ok(())
    }

    fn submit_delete(&mut self, file: PathBuf) {
        let temp = self.temp.clone();
        let path = file.clone();
        let task = Task::new(TaskKind::DeleteFile, move || temp.delete(&path))
            .with_property(KEY_SRC_FILE, file.display());
        self.scheduler.submit(task);
    }

    // collapses the remaining slots from the shallow end and moves the result
    fn finish(&mut self, dst: &Path) -> Result<()> {
        let mut carry: Option<PathBuf> = None;
        for depth in 0..MAX_DEPTH {
            let Some(file) = self.slots[depth].take() else {
                continue;
            };
            carry = match carry {
                None => Some(file),
                Some(shallow) => {
                    let merged = self.temp.create_file()?;
                    self.report.merges += 1;
                    merge_runs(
                        self.sort.codec.as_ref(),
                        self.sort.decorator.as_ref(),
                        &self.sort.comparator,
                        &file,
                        &shallow,
                        &merged,
                    )?;
                    self.temp.delete(&file)?;
                    self.temp.delete(&shallow)?;
                    Some(merged)
                }
            };
        }

        match carry {
            Some(run) => {
                move_file(&run, dst)?;
                self.temp.release(&run);
            }
            None => {
                let mut sink = self.sort.open_run_sink(dst)?;
                sink.close()?;
            }
        }
        Ok(())
    }
}

fn merge_runs<T: Record>(
    codec: &dyn RecordCodec<T>,
    decorator: Option<&SinkDecorator<T>>,
    comparator: &Comparator<T>,
    a: &Path,
    b: &Path,
    dst: &Path,
) -> Result<()> {
    let source_a = codec.open_source(a)?;
    let source_b = codec.open_source(b)?;
    let mut sink = open_decorated(codec, decorator, dst)?;
    let merged = merge_sorted(source_a, source_b, comparator, &mut sink);
    let closed = sink.close();
    merged?;
    closed?;
    Ok(())
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::io::{vec_source, BinaryCodec};
    use crate::records::{Token, TokenPair, Weighted};
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    fn engine(chunk_size: usize, reverse: bool, temp: &TempDir) -> ExternalSort<Token> {
        let options = SortOptions {
            chunk_size,
            reverse,
            cleanup_on_failure: false,
            temp_dir: Some(temp.path().join("tmp")),
        };
        ExternalSort::new(options, Token::order(), Arc::new(BinaryCodec::new(false)), WorkerPool::new(3).unwrap())
            .unwrap()
    }

    fn shuffled(n: u32, seed: u64) -> Vec<Token> {
        let mut records: Vec<Token> = (0..n).map(|i| Token::new(i % 97)).collect();
        records.shuffle(&mut StdRng::seed_from_u64(seed));
        records
    }

    fn read_back(path: &Path) -> Vec<u32> {
        let codec: BinaryCodec<Token> = BinaryCodec::new(false);
        codec.open_source(path).unwrap().map(|t| t.unwrap().id).collect()
    }

    #[test]
    fn output_is_sorted_permutation() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let input = shuffled(1000, 7);

        let report = engine(33, false, &dir).sort(vec_source(input.clone()), &dst, &observer).unwrap();
        assert_eq!(report.records, 1000);
        assert_eq!(report.merges, report.chunks - 1);

        let output = read_back(&dst);
        let mut expected: Vec<u32> = input.iter().map(|t| t.id).collect();
        expected.sort();
        assert_eq!(output, expected);
        // every temp run was deleted or moved
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn reverse_flag_sorts_descending() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        engine(10, true, &dir).sort(vec_source(shuffled(200, 3)), &dst, &observer).unwrap();
        let output = read_back(&dst);
        assert!(output.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(output.len(), 200);
    }

    #[test]
    fn five_chunks_take_four_merges() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let report = engine(4, false, &dir).sort(vec_source(shuffled(20, 1)), &dst, &observer).unwrap();
        assert_eq!(report.chunks, 5);
        assert_eq!(report.merges, 4);
    }

    #[test]
    fn drained_tree_holds_the_bits_of_the_chunk_count() {
        for (records, chunks) in [(20, 5u64), (24, 6), (32, 8), (28, 7)] {
            let dir = TempDir::new().unwrap();
            let dst = dir.path().join("sorted.bin");
            let observer = RunObserver::start("sort-test");
            let report = engine(4, false, &dir).sort(vec_source(shuffled(records, 9)), &dst, &observer).unwrap();
            assert_eq!(report.chunks as u64, chunks);
            assert_eq!(report.occupied_slots, chunks);
            assert_eq!(report.merges as u64, chunks - 1);
        }
    }

    #[test]
    fn single_chunk_needs_no_merge() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let report = engine(100, false, &dir).sort(vec_source(shuffled(50, 2)), &dst, &observer).unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.merges, 0);
        assert_eq!(read_back(&dst).len(), 50);
    }

    #[test]
    fn empty_input_writes_empty_destination() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let report = engine(4, false, &dir).sort(vec_source(Vec::new()), &dst, &observer).unwrap();
        assert_eq!(report, SortReport::default());
        assert!(dst.exists());
        assert!(read_back(&dst).is_empty());
    }

    #[test]
    fn duplicates_survive_merging() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let input = vec![Token::new(5); 17];
        engine(3, false, &dir).sort(vec_source(input), &dst, &observer).unwrap();
        assert_eq!(read_back(&dst), vec![5; 17]);
    }

    #[test]
    fn failure_leaves_no_destination() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let mut records: Vec<Result<Token>> = (0..30).map(|i| Ok(Token::new(i))).collect();
        records.push(Err(Error::format("input", "truncated record")));
        let source: RecordSource<Token> = Box::new(records.into_iter());

        let mut options = engine(4, false, &dir).options().clone();
        options.cleanup_on_failure = true;
        let sort = ExternalSort::new(options, Token::order(), Arc::new(BinaryCodec::new(false)), WorkerPool::new(2).unwrap())
            .unwrap();
        assert!(sort.sort(source, &dst, &observer).is_err());
        assert!(!dst.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn failure_without_cleanup_keeps_temp_runs() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        let mut records: Vec<Result<Token>> = (0..30).map(|i| Ok(Token::new(i))).collect();
        records.push(Err(Error::format("input", "truncated record")));
        let source: RecordSource<Token> = Box::new(records.into_iter());

        let sort = engine(4, false, &dir);
        assert!(!sort.options().cleanup_on_failure);
        assert!(sort.sort(source, &dst, &observer).is_err());
        assert!(!dst.exists());
        assert!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count() > 0);
    }

    // accepts a fixed number of records, then fails every write
    struct FullDisk {
        inner: Box<dyn RecordSink<Token>>,
        room: usize,
    }

    impl RecordSink<Token> for FullDisk {
        fn write(&mut self, record: Token) -> Result<()> {
            if self.room == 0 {
                return Err(Error::io("run", std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.room -= 1;
            self.inner.write(record)
        }

        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn failing_merge_task_fails_the_sort() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("sorted.bin");
        let observer = RunObserver::start("sort-test");
        // chunk runs (4) and first merges (8) fit, the depth 1 merge (16) does not
        let decorator: SinkDecorator<Token> =
            Arc::new(|inner: Box<dyn RecordSink<Token>>| -> Box<dyn RecordSink<Token>> {
                Box::new(FullDisk { inner, room: 8 })
            });
        let sort = engine(4, false, &dir).with_sink_decorator(decorator);

        match sort.sort(vec_source(shuffled(20, 5)), &dst, &observer) {
            Err(Error::Task { task, source }) => {
                assert!(task.starts_with("MergePair"), "{}", task);
                assert!(source.to_string().contains("disk full"));
            }
            other => panic!("expected a merge task failure, got {:?}", other),
        }
        assert!(!dst.exists());
    }

    #[test]
    fn zero_chunk_size_is_a_config_error() {
        let options = SortOptions { chunk_size: 0, ..SortOptions::default() };
        let err = ExternalSort::new(options, Token::order(), Arc::new(BinaryCodec::new(false)), WorkerPool::new(1).unwrap())
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn source_and_destination_must_differ() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let observer = RunObserver::start("sort-test");
        let codec: BinaryCodec<Token> = BinaryCodec::new(false);
        drain_into(vec_source(vec![Token::new(1)]), &mut codec.open_sink(&path).unwrap()).unwrap();
        let err = engine(4, false, &dir).sort_file(&path, &path, &observer).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn sorts_weighted_pairs_with_compressed_runs() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("pairs.bin");
        let observer = RunObserver::start("sort-test");
        let options = SortOptions { chunk_size: 5, temp_dir: Some(dir.path().join("tmp")), ..SortOptions::default() };
        let codec: Arc<BinaryCodec<Weighted<TokenPair>>> = Arc::new(BinaryCodec::new(true));
        let sort = ExternalSort::new(
            options,
            Weighted::record_order(TokenPair::index_order()),
            codec.clone(),
            WorkerPool::new(2).unwrap(),
        ).unwrap();

        let mut input: Vec<Weighted<TokenPair>> = (0..40u32)
            .map(|i| Weighted::new(TokenPair::new(i % 4, i % 7), 1.0))
            .collect();
        input.shuffle(&mut StdRng::seed_from_u64(11));
        sort.sort(vec_source(input), &dst, &observer).unwrap();

        let pairs: Vec<TokenPair> = codec.open_source(&dst).unwrap().map(|w| w.unwrap().record).collect();
        assert_eq!(pairs.len(), 40);
        assert!(pairs.windows(2).all(|w| w[0] <= w[1]));
    }
}
