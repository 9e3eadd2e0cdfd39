//! Concurrency-safe registry of download tasks.
//!
//! The registry owns the canonical state of every in-flight and finished
//! task. The orchestrator and the segment download progress callback feed
//! it through [`Registry::update`]; any number of pollers read it
//! concurrently. Reads hand out independent [`TaskSnapshot`] copies, never
//! live references, so a poller can never observe a mutation mid-iteration.
//!
//! A single mutex guards the map and every per-entry mutation. The lock is
//! held only for the duration of a lookup or field assignment, never across
//! network or disk I/O.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Mutex,
    time::Instant,
};

use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::util::{format_seconds, format_speed};

/// Number of `(Δbytes / Δtime)` samples in the speed moving average.
const SPEED_SAMPLES: usize = 10;

/// Progress is capped below this until a task explicitly completes.
const PROGRESS_CAP: f64 = 99.9;

/// Lifecycle status of a task.
///
/// `pending → downloading → merging → completed`, with `error` and
/// `cancelled` reachable from any non-terminal state. Terminal states are
/// never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Merging,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Coarse sub-phase tag for human-readable status display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Waiting,
    FetchingInfo,
    FetchingLinks,
    Downloading,
    Merging,
    DownloadingCover,
    DownloadingSubtitle,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::FetchingInfo => "fetching_info",
            Self::FetchingLinks => "fetching_links",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::DownloadingCover => "downloading_cover",
            Self::DownloadingSubtitle => "downloading_subtitle",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Partial update applied to a task.
///
/// Only fields that are `Some` are applied; everything else is left
/// untouched. The speed and ETA are recomputed whenever `current_bytes`
/// changes.
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub title: Option<String>,
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub current_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub stage: Option<Stage>,
    pub stage_message: Option<String>,
    pub merge_progress: Option<f64>,
    pub total_duration: Option<f64>,
    pub download_path: Option<String>,
    pub cover_path: Option<String>,
    pub subtitle_path: Option<String>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    /// Update that only advances the stage and its display message.
    #[must_use]
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            stage_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Update that moves the task to `error` with a message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Error),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Update that only reports a new cumulative byte count.
    #[must_use]
    pub fn bytes(current_bytes: u64) -> Self {
        Self {
            current_bytes: Some(current_bytes),
            ..Self::default()
        }
    }
}

/// Read-only copy of a task's state, with derived and formatted fields
/// filled in at snapshot time.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub source_id: String,
    pub title: String,
    pub status: TaskStatus,

    pub current_page: u32,
    pub total_pages: u32,
    pub current_bytes: u64,
    pub total_bytes: u64,

    /// Moving average download speed in bytes per second.
    pub speed: f64,
    pub speed_formatted: String,

    /// Estimated seconds remaining; `0` when unknown.
    pub eta: i64,
    pub eta_formatted: String,

    pub progress_percent: f64,

    pub stage: Stage,
    pub stage_message: String,

    pub merge_progress: f64,
    pub total_duration: f64,
    pub total_duration_formatted: String,

    pub started_at: Option<String>,
    pub completed_at: Option<String>,

    pub download_path: Option<String>,
    pub cover_path: Option<String>,
    pub subtitle_path: Option<String>,
    pub error_message: Option<String>,
}

/// Internal task record, including the speed sampler state that never
/// leaves the registry.
#[derive(Debug)]
struct Task {
    task_id: String,
    source_id: String,
    title: String,
    status: TaskStatus,

    current_page: u32,
    total_pages: u32,
    current_bytes: u64,
    total_bytes: u64,

    speed: f64,
    eta: i64,

    stage: Stage,
    stage_message: String,

    merge_progress: f64,
    total_duration: f64,

    started_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,

    download_path: Option<String>,
    cover_path: Option<String>,
    subtitle_path: Option<String>,
    error_message: Option<String>,

    /// Creation order, for `latest_by_source`.
    seq: u64,

    last_bytes: u64,
    last_time: Option<Instant>,
    speed_samples: VecDeque<f64>,
}

impl Task {
    fn new(task_id: String, source_id: String, title: String, seq: u64) -> Self {
        Self {
            task_id,
            source_id,
            title,
            status: TaskStatus::Pending,
            current_page: 0,
            total_pages: 0,
            current_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            eta: 0,
            stage: Stage::Waiting,
            stage_message: String::new(),
            merge_progress: 0.0,
            total_duration: 0.0,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            download_path: None,
            cover_path: None,
            subtitle_path: None,
            error_message: None,
            seq,
            last_bytes: 0,
            last_time: None,
            speed_samples: VecDeque::with_capacity(SPEED_SAMPLES),
        }
    }

    /// Folds a new byte count observation into the moving average.
    fn update_speed(&mut self) {
        let now = Instant::now();
        if let Some(last_time) = self.last_time {
            let time_diff = now.duration_since(last_time).as_secs_f64();
            if time_diff > 0.0 {
                #[allow(clippy::cast_precision_loss)]
                let bytes_diff = self.current_bytes.saturating_sub(self.last_bytes) as f64;
                let instant_speed = bytes_diff / time_diff;

                if self.speed_samples.len() >= SPEED_SAMPLES {
                    self.speed_samples.pop_front();
                }
                self.speed_samples.push_back(instant_speed);

                #[allow(clippy::cast_precision_loss)]
                let count = self.speed_samples.len() as f64;
                self.speed = self.speed_samples.iter().sum::<f64>() / count;

                if self.speed > 0.0 && self.total_bytes > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let remaining = self.total_bytes.saturating_sub(self.current_bytes) as f64;
                    #[allow(clippy::cast_possible_truncation)]
                    let eta = (remaining / self.speed) as i64;
                    self.eta = eta;
                }
            }
        }

        self.last_bytes = self.current_bytes;
        self.last_time = Some(now);
    }

    /// Blended page/byte progress percentage.
    ///
    /// Only an explicit `completed` status ever reports 100; counters alone
    /// are capped at 99.9 to keep rounding from declaring early victory.
    fn progress_percent(&self) -> f64 {
        if self.status == TaskStatus::Completed {
            return 100.0;
        }
        if self.total_pages == 0 {
            return 0.0;
        }

        let total_pages = f64::from(self.total_pages);
        let page_progress = f64::from(self.current_page) / total_pages * 100.0;

        if self.total_bytes > 0 && self.current_bytes > 0 {
            #[allow(clippy::cast_precision_loss)]
            let byte_progress = self.current_bytes as f64 / self.total_bytes as f64 * 100.0;
            let within_page = byte_progress / total_pages;
            let done_pages = f64::from(self.current_page.saturating_sub(1)) / total_pages * 100.0;
            return (done_pages + within_page).min(PROGRESS_CAP);
        }

        page_progress.min(PROGRESS_CAP)
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            source_id: self.source_id.clone(),
            title: self.title.clone(),
            status: self.status,
            current_page: self.current_page,
            total_pages: self.total_pages,
            current_bytes: self.current_bytes,
            total_bytes: self.total_bytes,
            speed: self.speed,
            speed_formatted: format_speed(self.speed),
            eta: self.eta,
            eta_formatted: format_seconds(self.eta),
            progress_percent: self.progress_percent(),
            stage: self.stage,
            stage_message: self.stage_message.clone(),
            merge_progress: self.merge_progress,
            total_duration: self.total_duration,
            #[allow(clippy::cast_possible_truncation)]
            total_duration_formatted: format_seconds(self.total_duration as i64),
            started_at: self.started_at.format(&Rfc3339).ok(),
            completed_at: self
                .completed_at
                .and_then(|t| t.format(&Rfc3339).ok()),
            download_path: self.download_path.clone(),
            cover_path: self.cover_path.clone(),
            subtitle_path: self.subtitle_path.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// The task registry.
///
/// Explicitly constructed and passed by reference (usually inside an
/// `Arc`) to the orchestrator and the status surface; multiple independent
/// registries can coexist under test.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    next_seq: u64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a holder panicked; propagate.
        self.inner.lock().expect("task registry lock poisoned")
    }

    /// Creates a new task in `pending` status and returns its snapshot.
    ///
    /// An existing entry under the same id is replaced.
    pub fn create(
        &self,
        task_id: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
    ) -> TaskSnapshot {
        let task_id = task_id.into();
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let task = Task::new(task_id.clone(), source_id.into(), title.into(), seq);
        let snapshot = task.snapshot();
        if inner.tasks.insert(task_id.clone(), task).is_some() {
            warn!("task {task_id} replaced an existing entry");
        } else {
            info!("created task {task_id}");
        }
        snapshot
    }

    /// Returns a snapshot of the task, if present.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.lock().tasks.get(task_id).map(Task::snapshot)
    }

    /// Returns the most recently created task for a source id.
    #[must_use]
    pub fn latest_by_source(&self, source_id: &str) -> Option<TaskSnapshot> {
        self.lock()
            .tasks
            .values()
            .filter(|task| task.source_id == source_id)
            .max_by_key(|task| task.seq)
            .map(Task::snapshot)
    }

    /// Returns snapshots of all tasks in creation order.
    #[must_use]
    pub fn list_all(&self) -> Vec<TaskSnapshot> {
        let inner = self.lock();
        let mut tasks: Vec<&Task> = inner.tasks.values().collect();
        tasks.sort_by_key(|task| task.seq);
        tasks.into_iter().map(Task::snapshot).collect()
    }

    /// Returns snapshots of all non-terminal tasks in creation order.
    #[must_use]
    pub fn list_active(&self) -> Vec<TaskSnapshot> {
        let inner = self.lock();
        let mut tasks: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|task| task.status.is_active())
            .collect();
        tasks.sort_by_key(|task| task.seq);
        tasks.into_iter().map(Task::snapshot).collect()
    }

    /// Applies a partial update to a task.
    ///
    /// Unknown task ids are ignored. Status changes are ignored once the
    /// task is in a terminal state. A `current_bytes` change recomputes the
    /// speed moving average and the ETA.
    pub fn update(&self, task_id: &str, update: TaskUpdate) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(task_id) else {
            debug!("update for unknown task {task_id} dropped");
            return;
        };

        if let Some(status) = update.status {
            if task.status.is_terminal() {
                debug!(
                    "task {task_id} is {}; status change to {status} dropped",
                    task.status
                );
            } else {
                task.status = status;
                if status.is_terminal() {
                    task.completed_at = Some(OffsetDateTime::now_utc());
                }
            }
        }
        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(current_page) = update.current_page {
            task.current_page = current_page;
        }
        if let Some(total_pages) = update.total_pages {
            task.total_pages = total_pages;
        }
        if let Some(current_bytes) = update.current_bytes {
            task.current_bytes = current_bytes;
            task.update_speed();
        }
        if let Some(total_bytes) = update.total_bytes {
            task.total_bytes = total_bytes;
        }
        if let Some(stage) = update.stage {
            task.stage = stage;
        }
        if let Some(stage_message) = update.stage_message {
            task.stage_message = stage_message;
        }
        if let Some(merge_progress) = update.merge_progress {
            task.merge_progress = merge_progress;
        }
        if let Some(total_duration) = update.total_duration {
            task.total_duration = total_duration;
        }
        if let Some(download_path) = update.download_path {
            task.download_path = Some(download_path);
        }
        if let Some(cover_path) = update.cover_path {
            task.cover_path = Some(cover_path);
        }
        if let Some(subtitle_path) = update.subtitle_path {
            task.subtitle_path = Some(subtitle_path);
        }
        if let Some(error_message) = update.error_message {
            task.error_message = Some(error_message);
        }
    }

    /// Requests cancellation of a task.
    ///
    /// Sets the status to `cancelled` when the task exists and is not
    /// terminal yet; the orchestrator observes the flag at its next step
    /// boundary. Returns whether the request took effect.
    pub fn request_cancel(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(task_id) {
            Some(task) if task.status.is_active() => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(OffsetDateTime::now_utc());
                info!("cancellation requested for task {task_id}");
                true
            }
            _ => false,
        }
    }

    /// Whether a task has been cancelled (or no longer exists).
    #[must_use]
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.lock()
            .tasks
            .get(task_id)
            .is_none_or(|task| task.status == TaskStatus::Cancelled)
    }

    /// Removes a task entry.
    pub fn remove(&self, task_id: &str) {
        self.lock().tasks.remove(task_id);
    }

    /// Removes every entry in a terminal state; active entries are
    /// untouched.
    pub fn clear_terminal(&self) {
        self.lock()
            .tasks
            .retain(|_, task| task.status.is_active());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_pending() {
        let registry = Registry::new();
        let task = registry.create("t1", "BV1xx411c7mD", "a title");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress_percent, 0.0);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn update_leaves_omitted_fields_alone() {
        let registry = Registry::new();
        registry.create("t1", "src", "title");
        registry.update(
            "t1",
            TaskUpdate {
                stage: Some(Stage::Downloading),
                stage_message: Some("downloading page 1".to_owned()),
                total_pages: Some(4),
                ..TaskUpdate::default()
            },
        );

        registry.update("t1", TaskUpdate::bytes(1024));

        let task = registry.get("t1").expect("task");
        assert_eq!(task.stage, Stage::Downloading);
        assert_eq!(task.stage_message, "downloading page 1");
        assert_eq!(task.title, "title");
        assert_eq!(task.total_pages, 4);
        assert_eq!(task.current_bytes, 1024);
    }

    #[test]
    fn progress_never_reports_100_without_completion() {
        let registry = Registry::new();
        registry.create("t1", "src", "title");
        registry.update(
            "t1",
            TaskUpdate {
                status: Some(TaskStatus::Downloading),
                total_pages: Some(2),
                current_page: Some(2),
                total_bytes: Some(1000),
                current_bytes: Some(1000),
                ..TaskUpdate::default()
            },
        );
        let task = registry.get("t1").expect("task");
        assert!(task.progress_percent <= 99.9);

        registry.update(
            "t1",
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                ..TaskUpdate::default()
            },
        );
        let task = registry.get("t1").expect("task");
        assert_eq!(task.progress_percent, 100.0);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn progress_is_zero_without_pages() {
        let registry = Registry::new();
        registry.create("t1", "src", "title");
        registry.update("t1", TaskUpdate::bytes(5000));
        let task = registry.get("t1").expect("task");
        assert_eq!(task.progress_percent, 0.0);
    }

    #[test]
    fn progress_blends_pages_and_bytes() {
        let registry = Registry::new();
        registry.create("t1", "src", "title");
        registry.update(
            "t1",
            TaskUpdate {
                total_pages: Some(4),
                current_page: Some(2),
                total_bytes: Some(4000),
                current_bytes: Some(1500),
                ..TaskUpdate::default()
            },
        );
        let task = registry.get("t1").expect("task");
        // (2-1)/4*100 + (1500/4000*100)/4 = 25 + 9.375
        assert!((task.progress_percent - 34.375).abs() < 1e-9);
    }

    #[test]
    fn no_transition_out_of_terminal() {
        let registry = Registry::new();
        registry.create("t1", "src", "title");
        registry.update("t1", TaskUpdate::error("it broke"));
        registry.update(
            "t1",
            TaskUpdate {
                status: Some(TaskStatus::Downloading),
                ..TaskUpdate::default()
            },
        );
        let task = registry.get("t1").expect("task");
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_message.as_deref(), Some("it broke"));
    }

    #[test]
    fn clear_terminal_spares_active_tasks() {
        let registry = Registry::new();
        registry.create("done", "a", "");
        registry.create("failed", "b", "");
        registry.create("running", "c", "");
        registry.update(
            "done",
            TaskUpdate {
                status: Some(TaskStatus::Completed),
                ..TaskUpdate::default()
            },
        );
        registry.update("failed", TaskUpdate::error("boom"));
        registry.update(
            "running",
            TaskUpdate {
                status: Some(TaskStatus::Downloading),
                ..TaskUpdate::default()
            },
        );

        registry.clear_terminal();

        assert!(registry.get("done").is_none());
        assert!(registry.get("failed").is_none());
        assert!(registry.get("running").is_some());
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn latest_by_source_prefers_newest() {
        let registry = Registry::new();
        registry.create("t1", "BV1", "first");
        registry.create("t2", "BV2", "other");
        registry.create("t3", "BV1", "second");
        let latest = registry.latest_by_source("BV1").expect("task");
        assert_eq!(latest.task_id, "t3");
        assert!(registry.latest_by_source("BV9").is_none());
    }

    #[test]
    fn list_active_filters_terminal() {
        let registry = Registry::new();
        registry.create("t1", "a", "");
        registry.create("t2", "b", "");
        registry.update("t2", TaskUpdate::error("boom"));
        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "t1");
    }

    #[test]
    fn speed_updates_on_byte_progress() {
        let registry = Registry::new();
        registry.create("t1", "src", "");
        registry.update("t1", TaskUpdate::bytes(0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        registry.update("t1", TaskUpdate::bytes(100_000));
        let task = registry.get("t1").expect("task");
        assert!(task.speed > 0.0);
    }

    #[test]
    fn eta_unknown_without_totals() {
        let registry = Registry::new();
        registry.create("t1", "src", "");
        registry.update("t1", TaskUpdate::bytes(0));
        std::thread::sleep(std::time::Duration::from_millis(10));
        registry.update("t1", TaskUpdate::bytes(50_000));
        let task = registry.get("t1").expect("task");
        assert_eq!(task.eta, 0);
        assert_eq!(task.eta_formatted, "--");
    }

    #[test]
    fn cancel_request_is_observable() {
        let registry = Registry::new();
        registry.create("t1", "src", "");
        assert!(!registry.is_cancelled("t1"));
        assert!(registry.request_cancel("t1"));
        assert!(registry.is_cancelled("t1"));
        // A second request is a no-op on the terminal state.
        assert!(!registry.request_cancel("t1"));
    }
}
