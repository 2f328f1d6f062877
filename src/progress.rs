use crate::engine::PassReport;

/// Trait for observing pipeline passes.
///
/// The CLI implements it with an indicatif spinner. All methods have default
/// no-op implementations.
pub trait PipelineObserver: Send + Sync {
    fn on_pass_start(&self, _pass: u64) {}
    fn on_part_complete(&self, _part: &str, _report: &PassReport) {}
    fn on_snapshot_failed(&self, _part: &str, _error: &str) {}
    fn on_pass_complete(&self, _pass: u64, _duration_secs: f64) {}
    fn on_stopped(&self, _passes: u64) {}
}

/// No-op observer for silent operation.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {}
