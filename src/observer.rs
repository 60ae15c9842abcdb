// Per-run logging handle. Engines receive one of these instead of reaching
// for a global logger, so interleaved runs on a shared pool stay apart in the
// log output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use log::{debug, info, warn};

pub struct RunObserver {
    name: String,
    started: Instant,
    stage: Mutex<String>,
    tasks_completed: AtomicU64,
    warnings: AtomicU64,
}

impl RunObserver {

    pub fn start(name: &str) -> RunObserver {
        info!("[{}] starting...", name);
        Self {
            name: name.to_owned(),
            started: Instant::now(),
            stage: Mutex::new(String::from("init")),
            tasks_completed: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
        }
    }

    /// A child observer for a sub-run, e.g. one sort lineage of the count stage.
    pub fn child(&self, name: &str) -> RunObserver {
        RunObserver::start(&format!("{}/{}", self.name, name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self, stage: &str) {
        if let Ok(mut current) = self.stage.lock() {
            *current = stage.to_owned();
        }
        info!("[{}] entering {} after {:.2} seconds", self.name, stage, self.started.elapsed().as_secs_f64());
    }

    pub fn info(&self, message: &str) {
        info!("[{}] {}", self.name, message);
    }

    pub fn debug(&self, message: &str) {
        debug!("[{}] {}", self.name, message);
    }

    pub fn warn(&self, message: &str) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        warn!("[{}] {}", self.name, message);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    // shutdown: logs the summary and consumes the handle
    pub fn finish(self) {
        let stage = self.stage.lock().map(|s| s.clone()).unwrap_or_default();
        info!("[{}] finished in stage {}, {} tasks, {} warnings, took {:.2} seconds",
            self.name, stage, self.tasks_completed(), self.warnings(), self.started.elapsed().as_secs_f64());
    }

}
