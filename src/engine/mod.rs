//! Classification engine.
//!
//! Each pass folds the current folder snapshot into the group set, evaluates
//! every live group against the chain (in parallel, one group per task, the
//! chain itself strictly in order), then applies the verdicts serially in
//! group-creation order so that contested dependency claims resolve the same
//! way every time.

pub mod promotion;

pub use promotion::{Promotion, PromotionPolicy};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::actions::{DispositionHandler, DryRun, GroupHandoff};
use crate::error::FilterError;
use crate::folder::{ImportFile, ImportFolder};
use crate::format::{FilterChain, FilterContext, FilterOutcome, FilterVerdict, FormatId};
use crate::group::{GroupId, GroupStatus, ImportGroup};
use crate::history::{HistorySink, Severity, TracingHistory};
use crate::pipeline::CancellationToken;

/// How many resolved groups `status` still answers for.
pub const FINISHED_CAPACITY: usize = 1024;

/// Counters for one classification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pass: u64,
    pub created: usize,
    pub evaluated: usize,
    pub imported: usize,
    pub discarded: usize,
    pub forced: usize,
    pub expired: usize,
    pub absorbed: usize,
    pub dissolved: usize,
    pub faults: usize,
    pub retrying: usize,
    pub unclaimed: usize,
    /// Cancellation hit mid-pass; no verdict from it was applied.
    pub abandoned: bool,
}

impl PassReport {
    pub fn is_quiet(&self) -> bool {
        self.created == 0
            && self.imported == 0
            && self.discarded == 0
            && self.absorbed == 0
            && self.dissolved == 0
            && self.faults == 0
    }
}

struct Evaluation {
    faults: Vec<(FormatId, String)>,
    result: EvalResult,
}

enum EvalResult {
    Claimed {
        format: FormatId,
        outcome: FilterOutcome,
        io_fault: Option<String>,
    },
    Unclaimed,
    /// Owner skipped or faulted; keep the previous verdict.
    Held,
    Cancelled,
}

struct Resolution {
    verdict: FilterVerdict,
    forced: bool,
}

pub struct ClassificationEngine {
    chain: FilterChain,
    policy: PromotionPolicy,
    history: Arc<dyn HistorySink>,
    handler: Arc<dyn DispositionHandler>,
    groups: BTreeMap<GroupId, ImportGroup>,
    owners: HashMap<String, GroupId>,
    settled: HashSet<String>,
    finished: VecDeque<(GroupId, GroupStatus)>,
    next_id: u64,
    passes: u64,
}

impl ClassificationEngine {
    pub fn new(chain: FilterChain, policy: PromotionPolicy) -> Self {
        Self {
            chain,
            policy,
            history: Arc::new(TracingHistory),
            handler: Arc::new(DryRun),
            groups: BTreeMap::new(),
            owners: HashMap::new(),
            settled: HashSet::new(),
            finished: VecDeque::new(),
            next_id: 0,
            passes: 0,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn DispositionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Live (non-terminal) groups in creation order.
    pub fn groups(&self) -> impl Iterator<Item = &ImportGroup> {
        self.groups.values()
    }

    pub fn group(&self, id: GroupId) -> Option<&ImportGroup> {
        self.groups.get(&id)
    }

    /// Current status of a live group, or the final status of one of the
    /// last [`FINISHED_CAPACITY`] resolved groups.
    pub fn status(&self, id: GroupId) -> Option<GroupStatus> {
        self.groups.get(&id).map(|g| g.status()).or_else(|| {
            self.finished
                .iter()
                .rev()
                .find(|(finished, _)| *finished == id)
                .map(|(_, status)| *status)
        })
    }

    /// The live group that owns the file at `relative_path`.
    pub fn owner_of(&self, relative_path: &str) -> Option<GroupId> {
        self.owners.get(relative_path).copied()
    }

    /// Drop every live group and file claim, flushing each group's pending
    /// history first.
    pub fn release_all(&mut self) -> usize {
        let groups = std::mem::take(&mut self.groups);
        self.owners.clear();
        let released = groups.len();
        for (id, mut group) in groups {
            let status = group.status();
            group.record(
                Severity::Info,
                format!("released at shutdown while {}", status),
            );
            debug!("Group {} released while {}", id, status);
            self.flush(&mut group);
        }
        released
    }

    /// Run one classification pass over `part`.
    pub fn run_pass(&mut self, part: &ImportFolder, cancel: &CancellationToken) -> PassReport {
        self.passes += 1;
        let mut report = PassReport {
            pass: self.passes,
            ..Default::default()
        };

        if cancel.is_cancelled() {
            report.abandoned = true;
            return report;
        }

        self.reconcile(part, &mut report);

        let chain = &self.chain;
        let live: Vec<&ImportGroup> = self.groups.values().collect();
        let evaluations: Vec<(GroupId, Evaluation)> = live
            .par_iter()
            .map(|group| (group.id(), evaluate_group(chain, part, group, cancel)))
            .collect();

        let cancelled = cancel.is_cancelled()
            || evaluations
                .iter()
                .any(|(_, e)| matches!(e.result, EvalResult::Cancelled));
        if cancelled {
            warn!(
                "Pass {} abandoned after cancellation, {} evaluations dropped",
                report.pass,
                evaluations.len()
            );
            report.abandoned = true;
            return report;
        }

        report.evaluated = evaluations.len();
        // Groups a format claims this pass; their status is stale until applied.
        let claimed: HashSet<GroupId> = evaluations
            .iter()
            .filter(|(_, e)| {
                matches!(&e.result, EvalResult::Claimed { outcome, .. } if outcome.verdict.is_claim())
            })
            .map(|(id, _)| *id)
            .collect();
        let now = Utc::now();
        for (id, evaluation) in evaluations {
            self.apply(id, evaluation, part, &claimed, now, &mut report);
        }

        for group in self.groups.values() {
            match group.status() {
                GroupStatus::Unclaimed => report.unclaimed += 1,
                status if status.is_retry() => report.retrying += 1,
                _ => {}
            }
        }

        if report.is_quiet() {
            debug!("Pass {}: {:?}", report.pass, report);
        } else {
            info!(
                "Pass {}: {} new, {} imported, {} discarded ({} forced, {} expired), {} retrying, {} unclaimed",
                report.pass,
                report.created,
                report.imported,
                report.discarded,
                report.forced,
                report.expired,
                report.retrying,
                report.unclaimed,
            );
        }

        report
    }

    /// Fold the snapshot into the group set: dissolve groups whose primary
    /// vanished, detach vanished dependencies, open groups for new files.
    fn reconcile(&mut self, part: &ImportFolder, report: &mut PassReport) {
        self.settled.retain(|path| part.file_at(path).is_some());

        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for id in ids {
            let Some(group) = self.groups.get_mut(&id) else {
                continue;
            };

            let Some(primary) = part.file_at(group.primary().relative_path()) else {
                if let Some(mut gone) = self.groups.remove(&id) {
                    let path = gone.primary().relative_path().to_string();
                    gone.record(
                        Severity::Info,
                        format!("primary file {} removed before classification finished", path),
                    );
                    for file in gone.files() {
                        self.owners.remove(file.relative_path());
                    }
                    debug!("Group {} dissolved, {} is gone", id, path);
                    report.dissolved += 1;
                    self.flush(&mut gone);
                }
                continue;
            };

            group.refresh_primary(primary.clone());
            let dropped = group.retain_dependencies(|dep| part.file_at(dep.relative_path()).is_some());
            let refreshed: Vec<ImportFile> = group
                .dependencies()
                .iter()
                .filter_map(|dep| part.file_at(dep.relative_path()).cloned())
                .collect();
            group.set_dependencies(refreshed);
            for path in dropped {
                debug!("Group {} lost dependency {}", id, path);
                self.owners.remove(&path);
            }
        }

        for file in part.all_files() {
            let key = file.relative_path();
            if self.owners.contains_key(key) || self.settled.contains(key) {
                continue;
            }
            self.next_id += 1;
            let id = GroupId::new(self.next_id);
            self.owners.insert(key.to_string(), id);
            self.groups.insert(id, ImportGroup::new(id, file.clone()));
            debug!("New group {} for {}", id, key);
            report.created += 1;
        }
    }

    fn apply(
        &mut self,
        id: GroupId,
        evaluation: Evaluation,
        part: &ImportFolder,
        claimed: &HashSet<GroupId>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        // Absorbed earlier in this pass.
        let Some(mut group) = self.groups.remove(&id) else {
            return;
        };
        group.last_evaluated_at = Some(now);
        group.skip_next.clear();

        for (format, message) in evaluation.faults {
            error!("Format {} faulted on group {}: {}", format, id, message);
            group.record(
                Severity::Error,
                format!("format {} faulted and is skipped next pass: {}", format, message),
            );
            group.skip_next.push(format);
            report.faults += 1;
        }

        let resolution = match evaluation.result {
            EvalResult::Claimed {
                format,
                outcome,
                io_fault,
            } => self.apply_claim(&mut group, format, outcome, io_fault, part, claimed, report),
            EvalResult::Unclaimed => self.apply_unclaimed(&mut group, report),
            EvalResult::Held => self.hold(&mut group, report),
            EvalResult::Cancelled => None,
        };

        match resolution {
            Some(resolution) => self.finish(group, resolution, report),
            None => {
                self.groups.insert(id, group);
            }
        }
    }

    fn apply_unclaimed(
        &self,
        group: &mut ImportGroup,
        report: &mut PassReport,
    ) -> Option<Resolution> {
        if group.last_verdict.is_none() {
            debug!("No format claims {}", group.primary().relative_path());
        }
        group.retry_elapsed = self.policy.advance(
            group.last_verdict,
            FilterVerdict::None,
            group.retry_elapsed,
            false,
        );
        group.last_verdict = Some(FilterVerdict::None);

        match self.policy.decide(FilterVerdict::None, group.retry_elapsed) {
            Promotion::Expire => {
                group.record(
                    Severity::Info,
                    format!(
                        "unknown import format, discarded after {}s unclaimed",
                        group.retry_elapsed.as_secs()
                    ),
                );
                group.status = GroupStatus::Discarding;
                report.expired += 1;
                Some(Resolution {
                    verdict: FilterVerdict::Discard,
                    forced: true,
                })
            }
            _ => None,
        }
    }

    fn apply_claim(
        &mut self,
        group: &mut ImportGroup,
        format: FormatId,
        outcome: FilterOutcome,
        io_fault: Option<String>,
        part: &ImportFolder,
        claimed: &HashSet<GroupId>,
        report: &mut PassReport,
    ) -> Option<Resolution> {
        let verdict = outcome.verdict;

        if verdict == FilterVerdict::None {
            info!("Format {} released group {}", format, group.id());
            group.record(
                Severity::Info,
                format!("format {} no longer claims this group", format),
            );
            for dep in group.dependencies() {
                self.owners.remove(dep.relative_path());
            }
            group.release();
            return None;
        }

        if group.owner.is_none() {
            debug!(
                "Format {} claims {} as {}",
                format,
                group.primary().relative_path(),
                verdict
            );
            group.owner = Some(format.clone());
        }

        let dependency_keys =
            self.attach_dependencies(group, &outcome.dependencies, part, claimed, report);
        let inputs_changed = dependency_keys != group.last_dependency_keys;
        let previous = group.last_verdict;
        let previous_status = group.status;

        group.retry_elapsed =
            self.policy
                .advance(previous, verdict, group.retry_elapsed, inputs_changed);
        group.last_verdict = Some(verdict);
        group.last_dependency_keys = dependency_keys;
        group.missing = outcome.missing;
        group.io_faulted = io_fault.is_some();

        if let Some(fault) = &io_fault {
            group.record(
                Severity::Error,
                format!("I/O fault while format {} inspected the group: {}", format, fault),
            );
        }

        match verdict {
            FilterVerdict::Import => {
                group.record(
                    Severity::Info,
                    format!(
                        "imported as {} with {} dependencies",
                        format,
                        group.dependencies().len()
                    ),
                );
                group.status = GroupStatus::Importing;
                Some(Resolution {
                    verdict,
                    forced: false,
                })
            }
            FilterVerdict::Discard => {
                let severity = if previous_status == GroupStatus::RetryDiscard {
                    Severity::Error
                } else {
                    Severity::Warning
                };
                let reason = outcome.note.unwrap_or_else(|| "unusable".to_string());
                group.record(severity, format!("discarded by {}: {}", format, reason));
                group.status = GroupStatus::Discarding;
                Some(Resolution {
                    verdict,
                    forced: false,
                })
            }
            FilterVerdict::RetryOrImport | FilterVerdict::RetryOrDiscard => {
                group.status = GroupStatus::for_verdict(verdict);
                if previous != Some(verdict) {
                    let (severity, waiting) = match verdict {
                        FilterVerdict::RetryOrImport => (Severity::Info, "optional"),
                        _ => (Severity::Warning, "required"),
                    };
                    group.record(
                        severity,
                        format!(
                            "{} waiting for {} dependencies: {}",
                            format,
                            waiting,
                            describe_missing(group.missing())
                        ),
                    );
                }
                self.promote(group, verdict, report)
            }
            FilterVerdict::None => None,
        }
    }

    /// The owner was skipped this pass: time still passes on its verdict.
    fn hold(&self, group: &mut ImportGroup, report: &mut PassReport) -> Option<Resolution> {
        let verdict = group.last_verdict?;
        group.retry_elapsed =
            self.policy
                .advance(Some(verdict), verdict, group.retry_elapsed, false);
        self.promote(group, verdict, report)
    }

    fn promote(
        &self,
        group: &mut ImportGroup,
        verdict: FilterVerdict,
        report: &mut PassReport,
    ) -> Option<Resolution> {
        let Promotion::Force(target) = self.policy.decide(verdict, group.retry_elapsed) else {
            return None;
        };

        let severity = if target == FilterVerdict::Discard && group.io_faulted {
            Severity::Error
        } else {
            Severity::Warning
        };
        let message = format!(
            "forced promotion from {} to {} after {}s; still missing: {}",
            verdict,
            target,
            group.retry_elapsed.as_secs(),
            describe_missing(group.missing())
        );
        warn!("Group {}: {}", group.id(), message);
        group.record(severity, message);
        group.status = GroupStatus::for_verdict(target);
        report.forced += 1;
        Some(Resolution {
            verdict: target,
            forced: true,
        })
    }

    /// Claim the reported dependency files for `group`, absorbing unclaimed
    /// groups that hold them. A group some format claimed this pass is never
    /// absorbed. Returns the sorted keys actually attached.
    fn attach_dependencies(
        &mut self,
        group: &mut ImportGroup,
        reported: &[String],
        part: &ImportFolder,
        claimed: &HashSet<GroupId>,
        report: &mut PassReport,
    ) -> Vec<String> {
        let mut attached: Vec<ImportFile> = Vec::new();
        let mut keys: Vec<String> = Vec::new();

        for path in reported {
            if path == group.primary().relative_path() || keys.contains(path) {
                continue;
            }
            let Some(file) = part.file_at(path) else {
                warn!("Group {}: dependency {} is not in the snapshot", group.id(), path);
                continue;
            };

            match self.owners.get(path).copied() {
                Some(owner) if owner == group.id() => {}
                Some(owner) => {
                    let absorbable = !claimed.contains(&owner)
                        && self.groups.get(&owner).map_or(false, |g| {
                            g.status() == GroupStatus::Unclaimed && g.dependencies().is_empty()
                        });
                    if !absorbable {
                        debug!("{} already belongs to group {}", path, owner);
                        continue;
                    }
                    self.absorb(owner, group.id(), report);
                }
                None if self.settled.contains(path) => continue,
                None => {}
            }

            self.owners.insert(path.clone(), group.id());
            attached.push(file.clone());
            keys.push(path.clone());
        }

        for dep in group.dependencies() {
            let key = dep.relative_path();
            if !keys.iter().any(|k| k == key) && self.owners.get(key) == Some(&group.id()) {
                self.owners.remove(key);
            }
        }

        group.set_dependencies(attached);
        keys.sort();
        keys
    }

    fn absorb(&mut self, victim: GroupId, into: GroupId, report: &mut PassReport) {
        if let Some(mut absorbed) = self.groups.remove(&victim) {
            debug!("Group {} absorbed into {}", victim, into);
            absorbed.record(
                Severity::Info,
                format!("absorbed into group {} as a dependency", into),
            );
            report.absorbed += 1;
            self.flush(&mut absorbed);
        }
    }

    fn finish(&mut self, mut group: ImportGroup, resolution: Resolution, report: &mut PassReport) {
        let format = group
            .owner()
            .and_then(|id| self.chain.get(id))
            .map(|entry| entry.descriptor().clone());
        let handoff = GroupHandoff {
            group: group.id(),
            format,
            primary: group.primary().clone(),
            dependencies: group.dependencies().to_vec(),
            missing: group.missing().to_vec(),
            forced: resolution.forced,
        };

        let result = match resolution.verdict {
            FilterVerdict::Import => self.handler.import(&handoff),
            _ => self.handler.discard(&handoff),
        };

        let final_status = match (resolution.verdict, result) {
            (FilterVerdict::Import, Ok(())) => {
                report.imported += 1;
                GroupStatus::Imported
            }
            (_, Ok(())) => {
                report.discarded += 1;
                GroupStatus::Discarded
            }
            (verdict, Err(e)) => {
                error!("Group {}: {} action failed: {}", group.id(), verdict, e);
                group.record(Severity::Error, format!("{} action failed: {}", verdict, e));
                report.discarded += 1;
                GroupStatus::Discarded
            }
        };

        group.status = final_status;
        for file in group.files() {
            self.owners.remove(file.relative_path());
            self.settled.insert(file.relative_path().to_string());
        }
        info!(
            "Group {} {} ({}, {} files)",
            group.id(),
            final_status,
            handoff.format_name(),
            handoff.files().count()
        );
        if self.finished.len() == FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back((group.id(), final_status));
        self.flush(&mut group);
    }

    fn flush(&self, group: &mut ImportGroup) {
        let entries = group.take_history();
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.history.append(&entries) {
            error!("Failed to flush history for group {}: {}", group.id(), e);
        }
    }
}

fn evaluate_group(
    chain: &FilterChain,
    part: &ImportFolder,
    group: &ImportGroup,
    cancel: &CancellationToken,
) -> Evaluation {
    let ctx = FilterContext::new(part, group.id(), group.primary(), group.dependencies(), cancel);
    let mut faults = Vec::new();

    if let Some(owner) = group.owner() {
        if group.skip_next.contains(owner) {
            return Evaluation {
                faults,
                result: EvalResult::Held,
            };
        }
        let Some(entry) = chain.get(owner) else {
            faults.push((owner.clone(), "format is not in the chain".to_string()));
            return Evaluation {
                faults,
                result: EvalResult::Held,
            };
        };
        if cancel.is_cancelled() {
            return Evaluation {
                faults,
                result: EvalResult::Cancelled,
            };
        }
        let result = match entry.invoke(&ctx) {
            Ok(outcome) => EvalResult::Claimed {
                format: owner.clone(),
                outcome,
                io_fault: None,
            },
            Err(FilterError::Io(e)) => io_fault_claim(owner, group, e),
            Err(FilterError::Fault(message)) => {
                faults.push((owner.clone(), message));
                EvalResult::Held
            }
        };
        return Evaluation { faults, result };
    }

    for entry in chain.entries() {
        if group.skip_next.contains(entry.id()) {
            continue;
        }
        if cancel.is_cancelled() {
            return Evaluation {
                faults,
                result: EvalResult::Cancelled,
            };
        }
        match entry.invoke(&ctx) {
            Ok(outcome) if outcome.verdict.is_claim() => {
                return Evaluation {
                    faults,
                    result: EvalResult::Claimed {
                        format: entry.id().clone(),
                        outcome,
                        io_fault: None,
                    },
                };
            }
            Ok(_) => {}
            Err(FilterError::Io(e)) => {
                return Evaluation {
                    faults,
                    result: io_fault_claim(entry.id(), group, e),
                };
            }
            Err(FilterError::Fault(message)) => faults.push((entry.id().clone(), message)),
        }
    }

    Evaluation {
        faults,
        result: EvalResult::Unclaimed,
    }
}

/// An I/O fault counts as a transient `RetryOrDiscard` by the faulting
/// format. Dependencies already attached stay attached.
fn io_fault_claim(format: &FormatId, group: &ImportGroup, error: std::io::Error) -> EvalResult {
    let mut outcome = FilterOutcome::retry_or_discard();
    outcome.dependencies = group
        .dependencies()
        .iter()
        .map(|dep| dep.relative_path().to_string())
        .collect();
    outcome.missing = group.missing().to_vec();
    EvalResult::Claimed {
        format: format.clone(),
        outcome,
        io_fault: Some(error.to_string()),
    }
}

fn describe_missing(missing: &[String]) -> String {
    if missing.is_empty() {
        "nothing reported".to_string()
    } else {
        missing.join(", ")
    }
}

#[cfg(test)]
mod tests;
