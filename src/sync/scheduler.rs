use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PollingConfig;

/// Independent polling tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    ActiveJobs,
    FullSync,
    Health,
}

impl PollKind {
    pub const ALL: [PollKind; 3] = [PollKind::ActiveJobs, PollKind::FullSync, PollKind::Health];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveJobs => "active_jobs",
            Self::FullSync => "full_sync",
            Self::Health => "health",
        }
    }
}

impl fmt::Display for PollKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Stopped,
}

/// What a polling task executes on each tick
#[async_trait]
pub trait PollRunner: Send + Sync + 'static {
    async fn run_poll(&self, kind: PollKind);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub active_jobs: Duration,
    pub full_sync: Duration,
    pub health: Duration,
    pub background_multiplier: u32,
}

impl PollIntervals {
    pub fn interval(&self, kind: PollKind, foreground: bool) -> Duration {
        let base = match kind {
            PollKind::ActiveJobs => self.active_jobs,
            PollKind::FullSync => self.full_sync,
            PollKind::Health => self.health,
        };
        if foreground {
            base
        } else {
            base.saturating_mul(self.background_multiplier.max(1))
        }
    }
}

impl From<&PollingConfig> for PollIntervals {
    fn from(config: &PollingConfig) -> Self {
        Self {
            active_jobs: config.active_jobs.as_duration(),
            full_sync: config.full_sync.as_duration(),
            health: config.health.as_duration(),
            background_multiplier: config.background_multiplier,
        }
    }
}

struct ScheduledTask {
    handle: JoinHandle<()>,
    state: Arc<Mutex<TaskState>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: BTreeMap<PollKind, ScheduledTask>,
}

/// Owns every polling task.
///
/// One map tracks all tiers; `stop()` signals, aborts and joins them, so no
/// poll is still running once it returns.
pub struct PollScheduler {
    intervals: PollIntervals,
    runner: Arc<dyn PollRunner>,
    foreground: watch::Sender<bool>,
    triggers: BTreeMap<PollKind, Arc<Notify>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl PollScheduler {
    pub fn new(intervals: PollIntervals, runner: Arc<dyn PollRunner>) -> Self {
        let (foreground, _) = watch::channel(true);
        let triggers = PollKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Notify::new())))
            .collect();

        Self {
            intervals,
            runner,
            foreground,
            triggers,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn intervals(&self) -> PollIntervals {
        self.intervals
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn one task per tier; no-op if already running
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Scheduler already running");
            return;
        }

        let (shutdown, _) = watch::channel(false);
        let mut tasks = BTreeMap::new();
        for kind in PollKind::ALL {
            let state = Arc::new(Mutex::new(TaskState::Idle));
            let handle = tokio::spawn(poll_loop(
                kind,
                self.intervals,
                Arc::clone(&self.runner),
                Arc::clone(&self.triggers[&kind]),
                self.foreground.subscribe(),
                shutdown.subscribe(),
                Arc::clone(&state),
            ));
            tasks.insert(kind, ScheduledTask { handle, state });
        }

        info!(
            foreground = *self.foreground.borrow(),
            active_jobs_ms = self.intervals.active_jobs.as_millis() as u64,
            full_sync_ms = self.intervals.full_sync.as_millis() as u64,
            "Polling started"
        );
        *running = Some(Running { shutdown, tasks });
    }

    /// Stop every tier and wait for the tasks to exit. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        for (kind, task) in running.tasks {
            task.handle.abort();
            let _ = task.handle.await;
            set_state(&task.state, TaskState::Stopped);
            debug!(kind = %kind, "Polling task stopped");
        }
        info!("Polling stopped");
    }

    /// Run a tier now instead of waiting for its next tick
    pub fn trigger(&self, kind: PollKind) {
        self.triggers[&kind].notify_one();
    }

    pub fn trigger_all(&self) {
        for kind in PollKind::ALL {
            self.trigger(kind);
        }
    }

    pub fn is_foreground(&self) -> bool {
        *self.foreground.borrow()
    }

    /// Rescale intervals; returning to the foreground triggers every tier
    pub fn set_foreground(&self, foreground: bool) {
        let previous = self.foreground.send_replace(foreground);
        if previous == foreground {
            return;
        }
        info!(foreground, "Visibility changed");
        if foreground {
            self.trigger_all();
        }
    }

    pub async fn states(&self) -> BTreeMap<PollKind, TaskState> {
        match self.running.lock().await.as_ref() {
            Some(running) => running
                .tasks
                .iter()
                .map(|(kind, task)| (*kind, read_state(&task.state)))
                .collect(),
            None => PollKind::ALL.iter().map(|kind| (*kind, TaskState::Stopped)).collect(),
        }
    }
}

fn set_state(state: &Mutex<TaskState>, value: TaskState) {
    match state.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn read_state(state: &Mutex<TaskState>) -> TaskState {
    match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

async fn poll_loop(
    kind: PollKind,
    intervals: PollIntervals,
    runner: Arc<dyn PollRunner>,
    trigger: Arc<Notify>,
    mut foreground: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<Mutex<TaskState>>,
) {
    loop {
        let interval = intervals.interval(kind, *foreground.borrow_and_update());

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = foreground.changed() => continue,
            _ = trigger.notified() => debug!(kind = %kind, "Poll triggered"),
            _ = tokio::time::sleep(interval) => {}
        }

        if *shutdown.borrow() {
            break;
        }

        set_state(&state, TaskState::Running);
        runner.run_poll(kind).await;
        set_state(&state, TaskState::Idle);
    }

    set_state(&state, TaskState::Stopped);
}
