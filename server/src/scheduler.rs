// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.

//! Background loop that watches task deadlines.
//!
//! Each cycle marks overdue tasks, sends the due-now and 30-minute
//! reminders, spawns the next occurrence of recurring tasks, clears the
//! overdue flag of rescheduled tasks and, right after midnight, sends every
//! user a digest of the day. The loop then sleeps for one minute when
//! something was pending, ten minutes otherwise.
//!
//! Reminder deduplication lives in memory only: a restart may repeat a
//! reminder that was already sent in the current window.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{NaiveDateTime, Timelike};
use common::{NewTask, Recurrence, Task, TaskField, TaskStatus};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::notifier::Notifier;
use crate::store::TaskStore;

/// A task is "due now" while `0 <= seconds_until < DUE_NOW_WINDOW_SECS`.
pub const DUE_NOW_WINDOW_SECS: i64 = 60;

/// The advance warning fires while `ADVANCE_WARNING_FROM_SECS < seconds_until <= ADVANCE_WARNING_UNTIL_SECS`.
pub const ADVANCE_WARNING_FROM_SECS: i64 = 1740;
pub const ADVANCE_WARNING_UNTIL_SECS: i64 = 1800;

/// The digest goes out during the first minutes after midnight.
pub const MIDNIGHT_WINDOW_MINUTES: u32 = 2;

/// Recurring tasks never have more live instances than this.
pub const MAX_LIVE_INSTANCES: usize = 2;

pub const NOTHING_DUE_MESSAGE: &str = "✅ You have no tasks for today.";

/// What one cycle did. Logged after every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub marked_overdue: usize,
    pub cleared_overdue: usize,
    pub spawned: usize,
    pub due_now_sent: usize,
    pub advance_sent: usize,
    pub digests_sent: usize,
    /// Units of work skipped because a store call or a send failed.
    pub failures: usize,
    /// The candidate query failed and the cycle was abandoned.
    pub fetch_failed: bool,
    pub next_sleep: Duration,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    notified_due_now: HashSet<i64>,
    notified_advance: HashSet<i64>,
    has_active_tasks: bool,
    midnight_notified: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            config,
            notified_due_now: HashSet::new(),
            notified_advance: HashSet::new(),
            has_active_tasks: false,
            midnight_notified: false,
        }
    }

    /// Whether the last cycle found any candidate task.
    pub fn has_active_tasks(&self) -> bool {
        self.has_active_tasks
    }

    /// How long to wait before the next cycle.
    pub fn next_sleep(&self) -> Duration {
        if self.has_active_tasks {
            self.config.active_interval
        } else {
            self.config.idle_interval
        }
    }

    /// Runs cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting the task scheduler...");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_cycle().await;
            info!(
                candidates = report.candidates,
                marked_overdue = report.marked_overdue,
                cleared_overdue = report.cleared_overdue,
                spawned = report.spawned,
                due_now_sent = report.due_now_sent,
                advance_sent = report.advance_sent,
                digests_sent = report.digests_sent,
                failures = report.failures,
                "Scheduler cycle done, next check in {}s",
                report.next_sleep.as_secs()
            );

            tokio::select! {
                _ = tokio::time::sleep(report.next_sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Task scheduler stopped.");
    }

    /// Performs one full check of the store against the current time.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let now = self.clock.now();
        let today = now.date();
        let mut report = CycleReport::default();

        debug!("Checking tasks at {}", now);

        let mut candidates = match self
            .bounded("fetching due tasks", self.store.get_due_or_recurring(today))
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Skipping scheduler cycle: {:?}", e);
                report.fetch_failed = true;
                report.next_sleep = self.next_sleep();
                return report;
            }
        };

        report.candidates = candidates.len();
        self.has_active_tasks = !candidates.is_empty();

        let mut owners_with_tasks = BTreeSet::new();
        for task in candidates.iter_mut() {
            self.check_task(task, now, &mut owners_with_tasks, &mut report)
                .await;
        }

        self.forget_passed_reminders(&candidates, now);
        self.clear_rescheduled(now, &mut report).await;

        if in_midnight_window(now) {
            if !self.midnight_notified {
                self.send_midnight_digest(&candidates, &owners_with_tasks, now, &mut report)
                    .await;
                self.midnight_notified = true;
            }
        } else {
            self.midnight_notified = false;
        }

        report.next_sleep = self.next_sleep();
        report
    }

    async fn check_task(
        &mut self,
        task: &mut Task,
        now: NaiveDateTime,
        owners_with_tasks: &mut BTreeSet<i64>,
        report: &mut CycleReport,
    ) {
        let time_diff = task.seconds_until(now);

        if time_diff < 0 && !task.is_overdue() {
            match self
                .bounded(
                    "marking task overdue",
                    self.store
                        .update_field(task.id, TaskField::Status, TaskStatus::Overdue.as_str()),
                )
                .await
            {
                Ok(true) => {
                    task.status = TaskStatus::Overdue;
                    report.marked_overdue += 1;
                    info!("Task {} '{}' is now overdue", task.id, task.name);
                }
                Ok(false) => debug!("Task {} vanished before it could be marked overdue", task.id),
                Err(e) => {
                    warn!("Could not mark task {} overdue: {:?}", task.id, e);
                    report.failures += 1;
                }
            }
        }

        if task.scheduled_date == now.date() || time_diff < 0 {
            owners_with_tasks.insert(task.owner);
        }

        let in_due_now = (0..DUE_NOW_WINDOW_SECS).contains(&time_diff);
        let in_advance =
            time_diff > ADVANCE_WARNING_FROM_SECS && time_diff <= ADVANCE_WARNING_UNTIL_SECS;

        if in_due_now && !self.notified_due_now.contains(&task.id) {
            if self.notify(task.owner, &due_now_message(task), report).await {
                self.notified_due_now.insert(task.id);
                report.due_now_sent += 1;
            }
        } else if in_advance && !self.notified_advance.contains(&task.id) {
            if self.notify(task.owner, &advance_warning_message(task), report).await {
                self.notified_advance.insert(task.id);
                report.advance_sent += 1;
            }
        }

        if task.recurrence != Recurrence::Once {
            match self.spawn_next(task).await {
                Ok(Some(_)) => report.spawned += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not spawn next occurrence of task {}: {:?}", task.id, e);
                    report.failures += 1;
                }
            }
        }
    }

    /// Inserts the occurrence following `task` unless enough instances of it
    /// already exist. Returns the id of the new task when one was created.
    pub async fn spawn_next(&self, task: &Task) -> Result<Option<i64>> {
        let Some(next_date) = task.recurrence.next_date(task.scheduled_date) else {
            return Ok(None);
        };

        let existing = self
            .bounded(
                "counting similar tasks",
                self.store.count_similar(
                    task.owner,
                    &task.name,
                    task.scheduled_time,
                    task.recurrence,
                ),
            )
            .await?;
        if existing >= MAX_LIVE_INSTANCES {
            debug!(
                "Task {} already has {} live instances, not spawning",
                task.id, existing
            );
            return Ok(None);
        }

        let id = self
            .bounded(
                "inserting recurring task",
                self.store.insert(NewTask {
                    owner: task.owner,
                    name: task.name.clone(),
                    scheduled_date: next_date,
                    scheduled_time: task.scheduled_time,
                    recurrence: task.recurrence,
                }),
            )
            .await?;

        info!(
            "Added recurring task '{}' -> {} (id {})",
            task.name, next_date, id
        );
        Ok(Some(id))
    }

    /// Drops remembered reminders that can no longer fire: the task is gone
    /// from the candidates or its window has passed.
    fn forget_passed_reminders(&mut self, candidates: &[Task], now: NaiveDateTime) {
        let remaining: HashMap<i64, i64> = candidates
            .iter()
            .map(|t| (t.id, t.seconds_until(now)))
            .collect();

        self.notified_due_now
            .retain(|id| remaining.get(id).is_some_and(|diff| *diff >= 0));
        self.notified_advance
            .retain(|id| remaining.get(id).is_some_and(|diff| *diff > ADVANCE_WARNING_FROM_SECS));
    }

    /// Clears the overdue flag of tasks whose schedule moved back into the future.
    async fn clear_rescheduled(&self, now: NaiveDateTime, report: &mut CycleReport) {
        let overdue = match self
            .bounded("fetching overdue tasks", self.store.get_overdue_marked())
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Skipping overdue sweep: {:?}", e);
                report.failures += 1;
                return;
            }
        };

        for task in overdue.iter().filter(|t| t.seconds_until(now) >= 0) {
            match self
                .bounded(
                    "clearing overdue flag",
                    self.store
                        .update_field(task.id, TaskField::Status, TaskStatus::Pending.as_str()),
                )
                .await
            {
                Ok(true) => {
                    report.cleared_overdue += 1;
                    info!("Cleared overdue flag of task {} '{}' (rescheduled)", task.id, task.name);
                }
                Ok(false) => debug!("Task {} vanished before its overdue flag was cleared", task.id),
                Err(e) => {
                    warn!("Could not clear overdue flag of task {}: {:?}", task.id, e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn send_midnight_digest(
        &self,
        candidates: &[Task],
        owners_with_tasks: &BTreeSet<i64>,
        now: NaiveDateTime,
        report: &mut CycleReport,
    ) {
        let mut owners = match self
            .bounded("listing owners", self.store.list_distinct_owners())
            .await
        {
            Ok(owners) => owners,
            Err(e) => {
                warn!("Could not list owners for the digest: {:?}", e);
                report.failures += 1;
                BTreeSet::new()
            }
        };
        owners.extend(owners_with_tasks.iter().copied());

        let mut today_by_owner: BTreeMap<i64, Vec<&Task>> = BTreeMap::new();
        let mut missed_by_owner: BTreeMap<i64, Vec<&Task>> = BTreeMap::new();
        for task in candidates.iter().filter(|t| owners_with_tasks.contains(&t.owner)) {
            if task.seconds_until(now) < 0 {
                missed_by_owner.entry(task.owner).or_default().push(task);
            } else if task.scheduled_date == now.date() {
                today_by_owner.entry(task.owner).or_default().push(task);
            }
        }

        for owner in owners {
            let today = today_by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[]);
            let missed = missed_by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[]);
            let message = compose_digest(today, missed);

            debug!("Sending digest to {}: {}", owner, message);
            if self.notify(owner, &message, report).await {
                report.digests_sent += 1;
            }
        }
    }

    /// Sends one message; failures are logged and counted, never propagated.
    async fn notify(&self, owner: i64, text: &str, report: &mut CycleReport) -> bool {
        match self
            .bounded("sending notification", self.notifier.send(owner, text))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to notify {}: {:?}", owner, e);
                report.failures += 1;
                false
            }
        }
    }

    /// Runs `fut` under the configured I/O timeout.
    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{what} timed out after {}ms",
                self.config.io_timeout.as_millis()
            )),
        }
    }
}

pub fn in_midnight_window(now: NaiveDateTime) -> bool {
    now.hour() == 0 && now.minute() < MIDNIGHT_WINDOW_MINUTES
}

pub fn due_now_message(task: &Task) -> String {
    format!(
        "⏰ Task '{}' scheduled for {} {} is due now.",
        task.display_name(),
        task.scheduled_date,
        task.time_label()
    )
}

pub fn advance_warning_message(task: &Task) -> String {
    format!(
        "⏳ In 30 minutes: task '{}' at {}.",
        task.display_name(),
        task.time_label()
    )
}

/// Builds the midnight message for one owner.
pub fn compose_digest(today: &[&Task], missed: &[&Task]) -> String {
    let mut parts = Vec::new();

    if !today.is_empty() {
        let lines: Vec<String> = today
            .iter()
            .map(|t| format!("✅ {} at {}", t.display_name(), t.time_label()))
            .collect();
        parts.push(format!("📅 Today's tasks:\n{}", lines.join("\n")));
    }

    if !missed.is_empty() {
        let lines: Vec<String> = missed
            .iter()
            .map(|t| {
                format!(
                    "⚠️ {} ({} {})",
                    t.display_name(),
                    t.scheduled_date,
                    t.time_label()
                )
            })
            .collect();
        parts.push(format!("⚠️ Missed tasks:\n{}", lines.join("\n")));
    }

    if parts.is_empty() {
        return NOTHING_DUE_MESSAGE.to_string();
    }
    parts.join("\n\n")
}
