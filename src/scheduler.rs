// Task scheduling shared by the external sort and the threaded all-pairs
// search: a fixed pool of workers plus, per run, a FIFO queue of handles to
// outstanding work.

use crate::error::{Error, Result};

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

pub const KEY_SRC_FILE: &str = "src.file";
pub const KEY_SRC_FILE_A: &str = "src.file.a";
pub const KEY_SRC_FILE_B: &str = "src.file.b";
pub const KEY_DST_FILE: &str = "dst.file";
pub const KEY_DEPTH: &str = "depth";
pub const KEY_STRIPE: &str = "stripe";
pub const KEY_LINEAGE: &str = "lineage";

/// Number of workers used when the configuration does not say.
pub fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) + 1
}

/// The fixed-size worker pool. Cheap to clone, every clone runs tasks on the
/// same threads.
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<ThreadPool>,
    threads: usize,
}

impl WorkerPool {

    pub fn new(threads: usize) -> Result<WorkerPool> {
        if threads < 1 {
            return Err(Error::config("threads", "must be at least 1"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("worker-{}", i))
            .build()?;
        Ok(Self { pool: Arc::new(pool), threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// A fresh handle queue bound to this pool.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    SortChunk,
    MergePair,
    DeleteFile,
    ApssStripe,
}

/// The serialisable part of a task: what kind of work it is and the string
/// keyed properties the completion handler reads to decide follow-up work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: u64,
    pub kind: TaskKind,
    pub properties: BTreeMap<String, String>,
}

impl TaskInfo {

    pub fn property(&self, key: &str) -> Result<&str> {
        self.properties
            .get(key)
            .map(|v| v.as_str())
            .ok_or_else(|| Error::format(self.to_string(), format!("missing task property {}", key)))
    }

    pub fn path(&self, key: &str) -> Result<PathBuf> {
        self.property(key).map(PathBuf::from)
    }

    pub fn depth(&self) -> Result<usize> {
        let depth = self.property(KEY_DEPTH)?;
        depth.parse().map_err(|_| Error::format(self.to_string(), format!("bad depth {}", depth)))
    }
}

impl Display for TaskInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)?;
        if let Some(dst) = self.properties.get(KEY_DST_FILE) {
            write!(f, "->{}", dst)?;
        }
        Ok(())
    }
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A unit of work: its description plus the job itself.
pub struct Task {
    kind: TaskKind,
    properties: BTreeMap<String, String>,
    job: Job,
}

impl Task {

    pub fn new<F>(kind: TaskKind, job: F) -> Task
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self { kind, properties: BTreeMap::new(), job: Box::new(job) }
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Task {
        self.properties.insert(key.to_owned(), value.to_string());
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Handle to a submitted task. The outcome of the job (an error, a panic
/// turned into an error, or success) is kept until the handle is awaited.
pub struct TaskHandle {
    info: TaskInfo,
    rx: Receiver<Result<()>>,
    outcome: Option<Result<()>>,
}

impl TaskHandle {

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Non-blocking completion check.
    pub fn is_done(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.outcome = Some(Err(Error::disconnected(format!("worker for {} vanished", self.info))));
                true
            }
        }
    }

    /// Blocks until the job ran, then re-raises its trapped error if any.
    pub fn wait(mut self) -> Result<TaskInfo> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => self
                .rx
                .recv()
                .unwrap_or_else(|_| Err(Error::disconnected(format!("worker for {} vanished", self.info)))),
        };
        match outcome {
            Ok(()) => Ok(self.info),
            Err(e) => Err(Error::task(self.info.to_string(), e)),
        }
    }
}

/// Bounds the number of tasks in flight, submitters block at the bound.
struct Throttle {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl Throttle {

    fn new(permits: usize) -> Throttle {
        Self { permits: Mutex::new(permits), freed: Condvar::new() }
    }

    fn acquire(&self) {
        let mut permits = match self.permits.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *permits == 0 {
            permits = match self.freed.wait(permits) {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = match self.permits.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        *permits += 1;
        self.freed.notify_one();
    }
}

// returns the permit even when the job panics
struct Permit(Arc<Throttle>);

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// FIFO queue of outstanding handles for one run. Several schedulers may
/// share a `WorkerPool`, their tasks interleave freely on the workers.
pub struct Scheduler {
    pool: WorkerPool,
    queue: VecDeque<TaskHandle>,
    throttle: Arc<Throttle>,
    next_id: u64,
    submitted: u64,
}

impl Scheduler {

    pub fn new(pool: WorkerPool) -> Scheduler {
        let permits = (pool.threads() * 3) / 2 + 1;
        Self::with_capacity(pool, permits)
    }

    /// `capacity` is the number of tasks allowed in flight at once.
    pub fn with_capacity(pool: WorkerPool, capacity: usize) -> Scheduler {
        Self {
            pool,
            queue: VecDeque::new(),
            throttle: Arc::new(Throttle::new(capacity.max(1))),
            next_id: 0,
            submitted: 0,
        }
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Number of handles not yet drained.
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Queues a task on the pool. Blocks while the in-flight bound is reached.
    pub fn submit(&mut self, task: Task) -> TaskInfo {
        let info = TaskInfo { id: self.next_id, kind: task.kind, properties: task.properties };
        self.next_id += 1;
        self.submitted += 1;

        self.throttle.acquire();
        let permit = Permit(self.throttle.clone());
        let (tx, rx) = sync_channel(1);
        let job = task.job;
        self.pool.pool.spawn(move || {
            let _permit = permit;
            let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                Ok(outcome) => outcome,
                Err(panic) => Err(Error::TaskPanicked { task: String::from("job"), message: panic_message(panic) }),
            };
            // the receiver is gone only if the scheduler was dropped mid-run
            let _ = tx.send(outcome);
        });

        self.queue.push_back(TaskHandle { info: info.clone(), rx, outcome: None });
        info
    }

    /// Removes every handle whose task already finished, in submission order,
    /// without blocking. Fails on the first trapped error found.
    pub fn poll_completed(&mut self) -> Result<Vec<TaskInfo>> {
        let mut completed = Vec::new();
        let mut pending = VecDeque::with_capacity(self.queue.len());
        let mut failure = None;
        while let Some(mut handle) = self.queue.pop_front() {
            if failure.is_none() && handle.is_done() {
                match handle.wait() {
                    Ok(info) => completed.push(info),
                    Err(e) => failure = Some(e),
                }
            } else {
                pending.push_back(handle);
            }
        }
        self.queue = pending;
        match failure {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Blocks on the oldest outstanding handle. `None` once the queue is empty.
    pub fn await_next(&mut self) -> Result<Option<TaskInfo>> {
        match self.queue.pop_front() {
            Some(handle) => handle.wait().map(Some),
            None => Ok(None),
        }
    }

    /// Blocks until the queue is empty and returns the first trapped error.
    /// Every handle is waited on, also after a failure, so nothing is still
    /// running when this returns.
    pub fn await_all(&mut self) -> Result<Vec<TaskInfo>> {
        let mut completed = Vec::with_capacity(self.queue.len());
        let mut failure = None;
        while let Some(handle) = self.queue.pop_front() {
            match handle.wait() {
                Ok(info) => completed.push(info),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // never leave workers writing files behind an aborted run
        for handle in self.queue.drain(..) {
            let _ = handle.wait();
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
