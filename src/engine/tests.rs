use super::*;
use crate::error::Error;
use crate::format::{FormatDescriptor, FormatRegistry, ImportFilter};
use crate::history::{HistoryEntry, MemoryHistory};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Script = dyn Fn(&FilterContext<'_>) -> Result<FilterOutcome, FilterError> + Send + Sync;

struct Scripted {
    id: String,
    calls: Arc<Mutex<Vec<String>>>,
    script: Arc<Script>,
}

impl ImportFilter for Scripted {
    fn evaluate(&self, ctx: &FilterContext<'_>) -> Result<FilterOutcome, FilterError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.id, ctx.primary().relative_path()));
        (self.script)(ctx)
    }
}

#[derive(Debug, Clone)]
struct Disposed {
    group: GroupId,
    import: bool,
    format: String,
    files: Vec<String>,
    forced: bool,
}

#[derive(Default)]
struct Recorder {
    disposed: Mutex<Vec<Disposed>>,
    fail_imports: bool,
}

impl Recorder {
    fn record(&self, handoff: &GroupHandoff, import: bool) {
        self.disposed.lock().unwrap().push(Disposed {
            group: handoff.group,
            import,
            format: handoff.format_name().to_string(),
            files: handoff
                .files()
                .map(|f| f.relative_path().to_string())
                .collect(),
            forced: handoff.forced,
        });
    }

    fn disposed(&self) -> Vec<Disposed> {
        self.disposed.lock().unwrap().clone()
    }
}

impl DispositionHandler for Recorder {
    fn import(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        if self.fail_imports {
            return Err(Error::Action {
                group: handoff.group.value(),
                reason: "target unavailable".to_string(),
            });
        }
        self.record(handoff, true);
        Ok(())
    }

    fn discard(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        self.record(handoff, false);
        Ok(())
    }
}

struct Harness {
    engine: ClassificationEngine,
    history: Arc<MemoryHistory>,
    recorder: Arc<Recorder>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn pass(&mut self, part: &ImportFolder) -> PassReport {
        self.engine.run_pass(part, &CancellationToken::new())
    }

    fn calls_to(&self, format: &str) -> usize {
        let prefix = format!("{}:", format);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn history_of(&self, id: GroupId) -> Vec<HistoryEntry> {
        self.history.for_group(id)
    }
}

fn test_policy() -> PromotionPolicy {
    PromotionPolicy {
        tick_interval: Duration::from_secs(1),
        max_retry_wait: Duration::from_secs(3),
        unclaimed_expiry: Duration::from_secs(5),
    }
}

fn script<F>(f: F) -> Arc<Script>
where
    F: Fn(&FilterContext<'_>) -> Result<FilterOutcome, FilterError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn harness_with(formats: Vec<(&str, i32, Arc<Script>)>, recorder: Recorder) -> Harness {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = FormatRegistry::new();
    for (id, priority, script) in formats {
        let calls = calls.clone();
        let name = id.to_string();
        registry
            .register(FormatDescriptor::new(id, priority, move || {
                Box::new(Scripted {
                    id: name.clone(),
                    calls: calls.clone(),
                    script: script.clone(),
                })
            }))
            .unwrap();
    }

    let history = Arc::new(MemoryHistory::new());
    let recorder = Arc::new(recorder);
    let engine = ClassificationEngine::new(registry.into_chain(), test_policy())
        .with_history(history.clone())
        .with_handler(recorder.clone());
    Harness {
        engine,
        history,
        recorder,
        calls,
    }
}

fn harness(formats: Vec<(&str, i32, Arc<Script>)>) -> Harness {
    harness_with(formats, Recorder::default())
}

fn part(paths: &[&str]) -> ImportFolder {
    ImportFolder::from_files(paths.iter().map(|p| ImportFile::in_memory(p, "data")))
}

fn ends_with(ctx: &FilterContext<'_>, suffix: &str) -> bool {
    ctx.primary().name().to_lowercase().ends_with(suffix)
}

#[test]
fn test_first_claiming_format_wins() {
    let mut h = harness(vec![
        ("f2", 5, script(|_| Ok(FilterOutcome::import()))),
        ("f1", 10, script(|_| Ok(FilterOutcome::import()))),
    ]);
    let report = h.pass(&part(&["a.dat"]));

    assert_eq!(report.created, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(h.calls_to("f1"), 1);
    assert_eq!(h.calls_to("f2"), 0);

    let disposed = h.recorder.disposed();
    assert_eq!(disposed.len(), 1);
    assert!(disposed[0].import);
    assert_eq!(disposed[0].format, "f1");
    assert_eq!(h.engine.status(disposed[0].group), Some(GroupStatus::Imported));
}

#[test]
fn test_retry_or_import_is_forced_after_max_wait() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|_| Ok(FilterOutcome::retry_or_import().with_missing("a.xml"))),
    )]);
    let folder = part(&["a.hdr"]);

    // Claim pass starts the clock at zero, then one tick per pass.
    for _ in 0..3 {
        let report = h.pass(&folder);
        assert_eq!(report.retrying, 1);
    }
    let id = h.engine.owner_of("a.hdr").unwrap();
    assert_eq!(h.engine.status(id), Some(GroupStatus::RetryImport));
    assert_eq!(h.engine.group(id).unwrap().retry_elapsed(), Duration::from_secs(2));
    assert!(h.recorder.disposed().is_empty());

    let report = h.pass(&folder);
    assert_eq!(report.forced, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(h.engine.status(id), Some(GroupStatus::Imported));

    let disposed = h.recorder.disposed();
    assert!(disposed[0].import);
    assert!(disposed[0].forced);

    let history = h.history_of(id);
    let forced = history
        .iter()
        .find(|e| e.message.contains("forced"))
        .unwrap();
    assert_eq!(forced.severity, Severity::Warning);
    assert!(forced.message.contains("a.xml"));
    assert!(history
        .iter()
        .any(|e| e.severity == Severity::Info && e.message.contains("waiting")));
}

#[test]
fn test_unclaimed_group_expires() {
    let mut h = harness(vec![("scan", 1, script(|_| Ok(FilterOutcome::none())))]);
    let folder = part(&["mystery.bin"]);

    for _ in 0..5 {
        let report = h.pass(&folder);
        assert_eq!(report.unclaimed, 1);
        assert_eq!(report.discarded, 0);
    }
    let id = h.engine.owner_of("mystery.bin").unwrap();

    let report = h.pass(&folder);
    assert_eq!(report.expired, 1);
    assert_eq!(report.discarded, 1);
    assert_eq!(h.engine.status(id), Some(GroupStatus::Discarded));

    let disposed = h.recorder.disposed();
    assert!(!disposed[0].import);
    assert_eq!(disposed[0].format, "unknown");

    let history = h.history_of(id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].severity, Severity::Info);
    assert!(history[0].message.contains("unknown import format"));
}

#[test]
fn test_terminal_groups_are_never_reopened() {
    let mut h = harness(vec![("scan", 1, script(|_| Ok(FilterOutcome::import())))]);
    let folder = part(&["a.dat"]);

    h.pass(&folder);
    let id = h.recorder.disposed()[0].group;

    for _ in 0..3 {
        let report = h.pass(&folder);
        assert_eq!(report.created, 0);
        assert_eq!(report.evaluated, 0);
    }
    assert_eq!(h.calls_to("scan"), 1);
    assert_eq!(h.engine.status(id), Some(GroupStatus::Imported));
    assert!(h.engine.owner_of("a.dat").is_none());
}

#[test]
fn test_settled_file_that_reappears_starts_a_new_group() {
    let mut h = harness(vec![("scan", 1, script(|_| Ok(FilterOutcome::import())))]);
    h.pass(&part(&["a.dat"]));
    h.pass(&part(&[]));

    let report = h.pass(&part(&["a.dat"]));
    assert_eq!(report.created, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(h.recorder.disposed().len(), 2);
}

#[test]
fn test_retry_clock_resets_when_verdict_changes() {
    let passes = Arc::new(AtomicUsize::new(0));
    let counter = passes.clone();
    let mut h = harness(vec![(
        "scan",
        1,
        script(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 2 {
                FilterOutcome::retry_or_discard().with_missing("a.raw")
            } else {
                FilterOutcome::retry_or_import().with_missing("a.xml")
            })
        }),
    )]);
    let folder = part(&["a.hdr"]);

    h.pass(&folder);
    h.pass(&folder);
    let id = h.engine.owner_of("a.hdr").unwrap();
    let group = h.engine.group(id).unwrap();
    assert_eq!(group.status(), GroupStatus::RetryDiscard);
    assert_eq!(group.retry_elapsed(), Duration::from_secs(1));

    h.pass(&folder);
    let group = h.engine.group(id).unwrap();
    assert_eq!(group.status(), GroupStatus::RetryImport);
    assert_eq!(group.retry_elapsed(), Duration::ZERO);

    h.pass(&folder);
    assert_eq!(
        h.engine.group(id).unwrap().retry_elapsed(),
        Duration::from_secs(1)
    );
}

#[test]
fn test_owner_only_is_consulted_after_claim() {
    let mut h = harness(vec![
        (
            "high",
            10,
            script(|_| Ok(FilterOutcome::retry_or_discard().with_missing("a.raw"))),
        ),
        ("low", 1, script(|_| Ok(FilterOutcome::import()))),
    ]);
    let folder = part(&["a.hdr"]);
    h.pass(&folder);
    h.pass(&folder);
    h.pass(&folder);

    assert_eq!(h.calls_to("high"), 3);
    assert_eq!(h.calls_to("low"), 0);
}

#[test]
fn test_dependency_absorbs_unclaimed_group() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|ctx| {
            if ends_with(ctx, ".hdr") {
                Ok(FilterOutcome::import().with_dependency(format!("{}.raw", ctx.primary().stem())))
            } else {
                Ok(FilterOutcome::none())
            }
        }),
    )]);
    let report = h.pass(&part(&["a.hdr", "a.raw"]));

    assert_eq!(report.created, 2);
    assert_eq!(report.absorbed, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(report.unclaimed, 0);

    let disposed = h.recorder.disposed();
    assert_eq!(disposed.len(), 1);
    assert_eq!(disposed[0].files, vec!["a.hdr", "a.raw"]);

    let absorbed = GroupId::new(2);
    assert!(h.engine.status(absorbed).is_none());
    assert!(h
        .history_of(absorbed)
        .iter()
        .any(|e| e.message.contains("absorbed into group G1")));
}

#[test]
fn test_dependency_claimed_by_other_owner_is_not_taken() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|ctx| {
            if ends_with(ctx, ".hdr") {
                Ok(FilterOutcome::retry_or_import().with_dependency("a.cal"))
            } else if ends_with(ctx, ".cal") {
                Ok(FilterOutcome::retry_or_import())
            } else {
                Ok(FilterOutcome::none())
            }
        }),
    )]);
    // a.cal sorts first, so its group is claimed before either header applies.
    let folder = part(&["a.cal", "b.hdr", "c.hdr"]);
    let report = h.pass(&folder);
    assert_eq!(report.absorbed, 0);

    let cal_owner = h.engine.owner_of("a.cal").unwrap();
    assert_eq!(h.engine.group(cal_owner).unwrap().primary().name(), "a.cal");

    let b = h.engine.owner_of("b.hdr").unwrap();
    let c = h.engine.owner_of("c.hdr").unwrap();
    assert!(h.engine.group(b).unwrap().dependencies().is_empty());
    assert!(h.engine.group(c).unwrap().dependencies().is_empty());
}

#[test]
fn test_filter_fault_falls_through_and_is_skipped_next_pass() {
    let mut h = harness(vec![
        ("broken", 10, script(|_| panic!("bad header"))),
        ("fallback", 1, script(|_| Ok(FilterOutcome::none()))),
    ]);
    let folder = part(&["a.dat"]);

    let report = h.pass(&folder);
    assert_eq!(report.faults, 1);
    assert_eq!(report.unclaimed, 1);
    assert_eq!(h.calls_to("broken"), 1);
    assert_eq!(h.calls_to("fallback"), 1);

    h.pass(&folder);
    assert_eq!(h.calls_to("broken"), 1);
    assert_eq!(h.calls_to("fallback"), 2);

    h.pass(&folder);
    assert_eq!(h.calls_to("broken"), 2);
}

#[test]
fn test_filter_fault_is_recorded_as_error() {
    let mut h = harness(vec![
        ("broken", 10, script(|_| Err(FilterError::Fault("confused".into())))),
        ("scan", 1, script(|_| Ok(FilterOutcome::import()))),
    ]);
    let report = h.pass(&part(&["a.dat"]));
    assert_eq!(report.faults, 1);
    assert_eq!(report.imported, 1);

    let id = h.recorder.disposed()[0].group;
    let history = h.history_of(id);
    assert!(history
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("confused")));
}

#[test]
fn test_io_fault_retries_then_discards_with_error() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|_| {
            Err(FilterError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "locked by writer",
            )))
        }),
    )]);
    let folder = part(&["a.hdr"]);

    let report = h.pass(&folder);
    assert_eq!(report.retrying, 1);
    let id = h.engine.owner_of("a.hdr").unwrap();
    assert_eq!(h.engine.status(id), Some(GroupStatus::RetryDiscard));

    for _ in 0..3 {
        h.pass(&folder);
    }
    assert_eq!(h.engine.status(id), Some(GroupStatus::Discarded));

    let history = h.history_of(id);
    assert!(history
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("locked by writer")));
    let forced = history
        .iter()
        .find(|e| e.message.contains("forced"))
        .unwrap();
    assert_eq!(forced.severity, Severity::Error);
}

#[test]
fn test_discard_after_retry_discard_is_error() {
    let passes = Arc::new(AtomicUsize::new(0));
    let counter = passes.clone();
    let mut h = harness(vec![(
        "scan",
        1,
        script(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(FilterOutcome::retry_or_discard().with_missing("a.raw"))
            } else {
                Ok(FilterOutcome::discard("raw file truncated"))
            }
        }),
    )]);
    let folder = part(&["a.hdr"]);
    h.pass(&folder);
    let id = h.engine.owner_of("a.hdr").unwrap();
    h.pass(&folder);

    let history = h.history_of(id);
    let last = history.last().unwrap();
    assert_eq!(last.severity, Severity::Error);
    assert!(last.message.contains("raw file truncated"));
    assert!(history
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("required")));
}

#[test]
fn test_plain_discard_is_warning() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|_| Ok(FilterOutcome::discard("empty"))),
    )]);
    h.pass(&part(&["a.hdr"]));
    let id = h.recorder.disposed()[0].group;
    let history = h.history_of(id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].severity, Severity::Warning);
}

#[test]
fn test_vanished_primary_dissolves_group() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|_| Ok(FilterOutcome::retry_or_discard())),
    )]);
    h.pass(&part(&["a.hdr"]));
    let id = h.engine.owner_of("a.hdr").unwrap();

    let report = h.pass(&part(&[]));
    assert_eq!(report.dissolved, 1);
    assert!(h.engine.status(id).is_none());
    assert!(h.recorder.disposed().is_empty());
    assert!(h
        .history_of(id)
        .iter()
        .any(|e| e.severity == Severity::Info && e.message.contains("removed")));
}

#[test]
fn test_vanished_dependency_is_detached_and_clock_restarts() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|ctx| {
            if !ends_with(ctx, ".hdr") {
                return Ok(FilterOutcome::none());
            }
            let mut outcome = FilterOutcome::retry_or_import().with_missing("a.xml");
            if ctx.part().file_at("a.raw").is_some() {
                outcome = outcome.with_dependency("a.raw");
            }
            Ok(outcome)
        }),
    )]);
    let full = part(&["a.hdr", "a.raw"]);
    h.pass(&full);
    h.pass(&full);
    let id = h.engine.owner_of("a.hdr").unwrap();
    assert_eq!(h.engine.owner_of("a.raw"), Some(id));
    assert_eq!(
        h.engine.group(id).unwrap().retry_elapsed(),
        Duration::from_secs(1)
    );

    h.pass(&part(&["a.hdr"]));
    let group = h.engine.group(id).unwrap();
    assert!(group.dependencies().is_empty());
    assert_eq!(group.retry_elapsed(), Duration::ZERO);
    assert!(h.engine.owner_of("a.raw").is_none());
}

#[test]
fn test_owner_returning_none_releases_group() {
    let passes = Arc::new(AtomicUsize::new(0));
    let counter = passes.clone();
    let mut h = harness(vec![(
        "scan",
        1,
        script(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(FilterOutcome::retry_or_discard())
            } else {
                Ok(FilterOutcome::none())
            }
        }),
    )]);
    let folder = part(&["a.hdr"]);
    h.pass(&folder);
    let id = h.engine.owner_of("a.hdr").unwrap();

    let report = h.pass(&folder);
    assert_eq!(report.unclaimed, 1);
    let group = h.engine.group(id).unwrap();
    assert_eq!(group.status(), GroupStatus::Unclaimed);
    assert!(group.owner().is_none());
}

#[test]
fn test_failed_import_action_discards_with_error() {
    let mut h = harness_with(
        vec![("scan", 1, script(|_| Ok(FilterOutcome::import())))],
        Recorder {
            fail_imports: true,
            ..Default::default()
        },
    );
    let report = h.pass(&part(&["a.hdr"]));
    assert_eq!(report.imported, 0);
    assert_eq!(report.discarded, 1);

    let id = GroupId::new(1);
    assert_eq!(h.engine.status(id), Some(GroupStatus::Discarded));
    assert!(h
        .history_of(id)
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("target unavailable")));
}

#[test]
fn test_cancelled_pass_applies_nothing() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut h = harness(vec![(
        "scan",
        1,
        script(move |_| {
            trigger.cancel();
            Ok(FilterOutcome::import())
        }),
    )]);
    let folder = part(&["a.hdr"]);

    let report = h.engine.run_pass(&folder, &cancel);
    assert!(report.abandoned);
    assert_eq!(report.imported, 0);
    assert!(h.recorder.disposed().is_empty());
    let id = h.engine.owner_of("a.hdr").unwrap();
    assert_eq!(h.engine.status(id), Some(GroupStatus::Unclaimed));

    let report = h.engine.run_pass(&folder, &cancel);
    assert!(report.abandoned);
    assert_eq!(h.calls_to("scan"), 1);
}

#[test]
fn test_evaluation_covers_many_groups() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|ctx| {
            if ends_with(ctx, ".ok") {
                Ok(FilterOutcome::import())
            } else {
                Ok(FilterOutcome::discard("not wanted"))
            }
        }),
    )]);
    let names: Vec<String> = (0..200)
        .map(|i| format!("batch{}/f{}.{}", i % 7, i, if i % 2 == 0 { "ok" } else { "no" }))
        .collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();

    let report = h.pass(&part(&refs));
    assert_eq!(report.evaluated, 200);
    assert_eq!(report.imported, 100);
    assert_eq!(report.discarded, 100);
}

#[test]
fn test_release_all_drops_live_groups() {
    let mut h = harness(vec![(
        "scan",
        1,
        script(|_| Ok(FilterOutcome::retry_or_import())),
    )]);
    h.pass(&part(&["a.hdr", "b.hdr"]));
    assert_eq!(h.engine.release_all(), 2);
    assert_eq!(h.engine.groups().count(), 0);
    assert!(h.engine.owner_of("a.hdr").is_none());
}

#[test]
fn test_group_claimed_in_same_pass_is_not_absorbed() {
    let mut h = harness(vec![
        (
            "scan",
            10,
            script(|ctx| {
                if ends_with(ctx, ".hdr") {
                    Ok(FilterOutcome::retry_or_import().with_dependency("a.raw"))
                } else {
                    Ok(FilterOutcome::none())
                }
            }),
        ),
        (
            "raw",
            1,
            script(|ctx| {
                if ends_with(ctx, ".raw") {
                    Ok(FilterOutcome::import())
                } else {
                    Ok(FilterOutcome::none())
                }
            }),
        ),
    ]);
    // a.hdr is applied first and would absorb a.raw if its claim were ignored.
    let report = h.pass(&part(&["a.hdr", "a.raw"]));

    assert_eq!(report.absorbed, 0);
    assert_eq!(report.imported, 1);
    assert_eq!(report.retrying, 1);

    let disposed = h.recorder.disposed();
    assert_eq!(disposed.len(), 1);
    assert_eq!(disposed[0].format, "raw");
    assert_eq!(disposed[0].files, vec!["a.raw"]);

    let hdr = h.engine.owner_of("a.hdr").unwrap();
    assert!(h.engine.group(hdr).unwrap().dependencies().is_empty());
}

#[test]
fn test_resolved_status_memory_is_bounded() {
    let mut h = harness(vec![("all", 1, script(|_| Ok(FilterOutcome::import())))]);

    let batch = 300;
    for cycle in 0..5 {
        let names: Vec<String> = (0..batch).map(|i| format!("c{}/f{}.dat", cycle, i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let report = h.pass(&part(&refs));
        assert_eq!(report.imported, batch);
        assert!(h.engine.finished.len() <= FINISHED_CAPACITY);
        assert!(h.engine.settled.len() <= batch);
    }

    assert_eq!(h.engine.finished.len(), FINISHED_CAPACITY);
    assert_eq!(h.engine.status(GroupId::new(1)), None);
    let last = GroupId::new(5 * batch as u64);
    assert_eq!(h.engine.status(last), Some(GroupStatus::Imported));
}

#[test]
fn test_release_all_flushes_pending_history() {
    let mut h = harness(vec![
        ("broken", 10, script(|_| Err(FilterError::Fault("bad header".into())))),
        (
            "scan",
            1,
            script(|_| Ok(FilterOutcome::retry_or_import().with_missing("a.xml"))),
        ),
    ]);
    h.pass(&part(&["a.hdr"]));
    let id = h.engine.owner_of("a.hdr").unwrap();
    assert!(h.history_of(id).is_empty());

    assert_eq!(h.engine.release_all(), 1);

    let entries = h.history_of(id);
    assert!(entries
        .iter()
        .any(|e| e.severity == Severity::Error && e.message.contains("broken faulted")));
    let last = entries.last().unwrap();
    assert_eq!(last.severity, Severity::Info);
    assert!(last.message.contains("released at shutdown"));
}
