//! The per-case watch loop: scan → diff → match → (idle) → dispatch, until the case is done.

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::broker::Broker;
use crate::catalog::ModuleRule;
use crate::dispatch::TaskDispatcher;
use crate::error::ConfigError;
use crate::idle::{DirSizeMeter, IdleDetector, SizeMeter};
use crate::matcher::{EventOrigin, FsEvent, RuleMatcher};
use crate::snapshot::{WalkOpts, scan};
use crate::store::CoordinationStore;
use crate::utils::config::WatchConsts;
use crate::{CaseContext, CaseSnapshot, CaseStatus, InputKind, SnapshotEntry, TaskInput};

/// What to do with a trigger whose dispatch failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchFailurePolicy {
    /// Count the entry as seen; it is not dispatched again in this run.
    Drop,
    /// Forget the entry so the next cycle sees it as new and tries again.
    #[default]
    Retry,
}

impl std::str::FromStr for DispatchFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "drop" => Ok(Self::Drop),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown dispatch failure policy {:?} (drop, retry)", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub scan_interval: Duration,
    pub cooldown: Duration,
    /// Start from an empty previous set instead of the persisted snapshot.
    pub reprocess: bool,
    pub walk: WalkOpts,
    pub on_dispatch_failure: DispatchFailurePolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            scan_interval: WatchConsts::SCAN_INTERVAL,
            cooldown: WatchConsts::COOLDOWN,
            reprocess: false,
            walk: WalkOpts::default(),
            on_dispatch_failure: DispatchFailurePolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// No new entries, no outstanding work, no directory still settling.
    Completed,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct MonitorReport {
    pub exit: MonitorExit,
    pub cycles: usize,
    pub triggers: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
    pub snapshot_saved: bool,
}

/// Watches one case until it is done or cancelled.
pub struct CaseMonitor {
    case: CaseContext,
    store: Arc<CoordinationStore>,
    dispatcher: TaskDispatcher,
    matcher: RuleMatcher,
    rules: Vec<ModuleRule>,
    settings: MonitorSettings,
    cancel: Arc<AtomicBool>,
    meter: Arc<dyn SizeMeter>,
}

impl CaseMonitor {
    /// Build the loop for `case`. Fails on rules that do not compile.
    pub fn new(
        case: CaseContext,
        rules: Vec<ModuleRule>,
        store: Arc<CoordinationStore>,
        broker: Arc<dyn Broker>,
        agent: &str,
        settings: MonitorSettings,
    ) -> Result<Self, ConfigError> {
        let matcher = RuleMatcher::new(case.case_path.clone(), &rules)?;
        let dispatcher = TaskDispatcher::new(Arc::clone(&store), broker, agent);
        Ok(Self {
            case,
            store,
            dispatcher,
            matcher,
            rules,
            settings,
            cancel: Arc::new(AtomicBool::new(false)),
            meter: Arc::new(DirSizeMeter),
        })
    }

    /// Share a cancellation flag (e.g. set by a Ctrl+C handler).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the size source of idle checks.
    pub fn with_size_meter(mut self, meter: Arc<dyn SizeMeter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn case(&self) -> &CaseContext {
        &self.case
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Sleep `total` in slices; returns early when cancelled.
    fn sleep_interval(&self, total: Duration) {
        let mut left = total;
        while !left.is_zero() && !self.cancelled() {
            let step = left.min(WatchConsts::CANCEL_POLL);
            std::thread::sleep(step);
            left -= step;
        }
    }

    fn outstanding(&self) -> bool {
        match self.store.has_outstanding_work(&self.case.case_id) {
            Ok(v) => v,
            Err(e) => {
                warn!("outstanding work check failed, assuming busy: {:#}", e);
                true
            }
        }
    }

    fn save_snapshot(&self, entries: &CaseSnapshot) -> bool {
        match self
            .store
            .put_snapshot(&self.case.case_id, &self.case.case_path_str(), entries)
        {
            Ok(n) => {
                info!("Snapshot saved ({} entries)", n);
                true
            }
            Err(e) => {
                warn!("Snapshot not saved: {:#}", e);
                false
            }
        }
    }

    /// Dispatch one input. On failure, returns the entry to forget under the retry policy.
    fn dispatch_one(
        &self,
        rule: &ModuleRule,
        input: TaskInput,
        report: &mut MonitorReport,
    ) -> Option<(SnapshotEntry, String)> {
        let entry = match &input {
            TaskInput::File(p) => SnapshotEntry::file(p.clone()),
            TaskInput::Dir(p) => SnapshotEntry::dir(p.clone()),
        };
        match self.dispatcher.dispatch(rule, input, &self.case) {
            Ok(id) => {
                debug!("task {} row {} on {}", id.module, id.row_id, id.queue);
                report.dispatched += 1;
                None
            }
            Err(e) => {
                report.dispatch_failures += 1;
                warn!("Dispatch failed for {}: {:#}", entry.path.display(), e);
                match self.settings.on_dispatch_failure {
                    DispatchFailurePolicy::Drop => None,
                    DispatchFailurePolicy::Retry => Some((entry, rule.name.clone())),
                }
            }
        }
    }

    /// Run until the case is done or cancelled.
    pub fn run(&mut self) -> Result<MonitorReport> {
        let case_path = self.case.case_path_str();
        for rule in &self.rules {
            self.store.ensure_module_table(&rule.name)?;
        }
        self.store
            .upsert_master_status(
                &case_path,
                CaseStatus::ProcessingCase,
                &self.case.case_id,
                &self.case.modules,
            )
            .context("mark case processing")?;
        info!(
            "Watching {} as {} ({} modules)",
            case_path,
            self.case.case_id,
            self.rules.len()
        );

        let mut previous = match self.settings.reprocess {
            true => CaseSnapshot::new(),
            false => self
                .store
                .get_snapshot(&case_path)
                .context("load previous snapshot")?,
        };
        debug!("{} entries already seen", previous.len());

        let (idle_tx, idle_rx) = unbounded();
        let detector = IdleDetector::new(self.settings.cooldown, Arc::clone(&self.meter), move |d| {
            let _ = idle_tx.send(d);
        });

        let mut report = MonitorReport {
            exit: MonitorExit::Cancelled,
            cycles: 0,
            triggers: 0,
            dispatched: 0,
            dispatch_failures: 0,
            snapshot_saved: false,
        };

        let mut scanned = false;
        let mut settling = false;
        loop {
            if self.cancelled() {
                break;
            }
            report.cycles += 1;
            let origin = match report.cycles {
                1 => EventOrigin::Existing,
                _ => EventOrigin::Created,
            };

            let current = match scan(&self.case.case_path, &self.settings.walk) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Scan failed, retrying next cycle: {:#}", e);
                    self.sleep_interval(self.settings.scan_interval);
                    continue;
                }
            };
            scanned = true;
            let mut new_entries: Vec<&SnapshotEntry> = current.difference(&previous).collect();
            new_entries.sort_by(|a, b| a.path.cmp(&b.path));
            if !new_entries.is_empty() {
                debug!("cycle {}: {} new entries", report.cycles, new_entries.len());
            }

            let mut retry: Vec<(SnapshotEntry, String)> = Vec::new();
            for entry in &new_entries {
                let event = FsEvent::new(entry.path.clone(), entry.kind, origin);
                for trigger in self.matcher.match_event(&event) {
                    report.triggers += 1;
                    match trigger.rule.input_kind {
                        InputKind::File => {
                            let input = TaskInput::File(trigger.path);
                            retry.extend(self.dispatch_one(&trigger.rule, input, &mut report));
                        }
                        InputKind::Dir => {
                            detector.on_directory_trigger(&trigger.path, Arc::clone(&trigger.rule));
                        }
                    }
                }
            }
            let saw_new = !new_entries.is_empty();
            previous = current;

            while let Ok(idle) = idle_rx.try_recv() {
                let input = TaskInput::Dir(idle.path);
                retry.extend(self.dispatch_one(&idle.rule, input, &mut report));
            }

            for (entry, module) in retry {
                self.matcher.forget(&entry.path, &module);
                previous.remove(&entry);
            }

            // Timer count first: a timer leaves the map only after its send.
            settling = detector.active_count() > 0 || !idle_rx.is_empty();
            if !saw_new && !settling && !self.outstanding() {
                report.exit = MonitorExit::Completed;
                break;
            }
            self.sleep_interval(self.settings.scan_interval);
        }
        if report.exit == MonitorExit::Cancelled {
            settling = detector.active_count() > 0 || !idle_rx.is_empty();
        }
        drop(detector);

        match report.exit {
            MonitorExit::Completed => {
                report.snapshot_saved = self.save_snapshot(&previous);
                self.store
                    .upsert_master_status(
                        &case_path,
                        CaseStatus::ProcessingDone,
                        &self.case.case_id,
                        &self.case.modules,
                    )
                    .context("mark case done")?;
                info!(
                    "Case done: {} dispatched, {} failed, {} cycles",
                    report.dispatched, report.dispatch_failures, report.cycles
                );
            }
            MonitorExit::Cancelled => {
                // Only a quiet case may persist; otherwise the next run re-observes the rest.
                if scanned && !settling && !self.outstanding() {
                    report.snapshot_saved = self.save_snapshot(&previous);
                } else {
                    info!("Cancelled with work outstanding; snapshot not saved");
                }
            }
        }
        Ok(report)
    }
}
