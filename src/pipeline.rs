//! Tick loop driving one classification engine per import part.

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::engine::{ClassificationEngine, PassReport};
use crate::folder::scan::FolderSource;
use crate::progress::{PipelineObserver, SilentObserver};

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One import part: where its files come from and the engine that
/// classifies them. Parts share nothing.
pub struct ImportPart {
    name: String,
    source: Box<dyn FolderSource>,
    engine: ClassificationEngine,
}

impl ImportPart {
    pub fn new(name: &str, source: Box<dyn FolderSource>, engine: ClassificationEngine) -> Self {
        Self {
            name: name.to_string(),
            source,
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &ClassificationEngine {
        &self.engine
    }

    fn tick(
        &mut self,
        cancel: &CancellationToken,
        observer: &dyn PipelineObserver,
    ) -> Option<PassReport> {
        match self.source.snapshot() {
            Ok(folder) => {
                let report = self.engine.run_pass(&folder, cancel);
                observer.on_part_complete(&self.name, &report);
                Some(report)
            }
            Err(e) => {
                error!("Failed to snapshot part {}: {}", self.name, e);
                observer.on_snapshot_failed(&self.name, &e.to_string());
                None
            }
        }
    }
}

pub struct Pipeline {
    parts: Vec<ImportPart>,
    tick_interval: Duration,
    observer: Arc<dyn PipelineObserver>,
    passes: u64,
}

impl Pipeline {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            parts: Vec::new(),
            tick_interval,
            observer: Arc::new(SilentObserver),
            passes: 0,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn add_part(&mut self, part: ImportPart) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[ImportPart] {
        &self.parts
    }

    pub fn part(&self, name: &str) -> Option<&ImportPart> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Snapshot every part and run one engine pass on each, parts in
    /// parallel. A part whose snapshot fails sits this tick out.
    pub fn run_pass(&mut self, cancel: &CancellationToken) -> Vec<(String, PassReport)> {
        self.passes += 1;
        let started = Instant::now();
        self.observer.on_pass_start(self.passes);

        let observer = self.observer.as_ref();
        let reports: Vec<(String, PassReport)> = self
            .parts
            .par_iter_mut()
            .filter_map(|part| {
                part.tick(cancel, observer)
                    .map(|report| (part.name.clone(), report))
            })
            .collect();

        self.observer
            .on_pass_complete(self.passes, started.elapsed().as_secs_f64());
        reports
    }

    /// Run passes every `tick_interval` until cancelled or `max_passes`
    /// have completed. Passes never overlap; ticks missed while a pass
    /// overran are skipped. Returns the number of passes run.
    pub fn run(&mut self, cancel: &CancellationToken, max_passes: Option<u64>) -> u64 {
        info!(
            "Starting pipeline over {} parts, tick every {}ms",
            self.parts.len(),
            self.tick_interval.as_millis()
        );

        let mut completed = 0;
        let mut next_tick = Instant::now();
        loop {
            if max_passes.map_or(false, |max| completed >= max) {
                break;
            }
            if !wait_until(next_tick, cancel) {
                break;
            }

            self.run_pass(cancel);
            completed += 1;

            next_tick += self.tick_interval;
            let now = Instant::now();
            if next_tick < now {
                let behind = now - next_tick;
                let interval = self.tick_interval.as_nanos().max(1);
                let skipped = (behind.as_nanos() / interval) as u32 + 1;
                debug!("Pass overran, skipping {} ticks", skipped);
                next_tick += self.tick_interval * skipped;
            }
        }

        info!("Pipeline stopped after {} passes", completed);
        self.observer.on_stopped(completed);
        completed
    }

    /// Release every live group in every part.
    pub fn shutdown(&mut self) {
        for part in &mut self.parts {
            let released = part.engine.release_all();
            if released > 0 {
                info!("Released {} pending groups in part {}", released, part.name);
            }
        }
    }
}

/// Sleep until `deadline` in short slices. Returns `false` if cancelled first.
fn wait_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}
