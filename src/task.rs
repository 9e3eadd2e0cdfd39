//! Download orchestration.
//!
//! One [`Orchestrator`] drives a task end to end: resolve metadata,
//! resolve a link per segment, stream the segments, merge, fetch the cover
//! and transcript, move the artifact into place. Every transition is
//! reported into the [`Registry`]; the orchestrator itself keeps no state
//! of its own.
//!
//! Each spawned task runs on its own background tokio task and coordinates
//! with the rest of the process only through the registry. Cancellation is
//! cooperative: a `cancelled` status written into the registry is observed
//! at step boundaries, never mid-call.

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    config::Config,
    error::{Error, Result},
    gateway::Gateway,
    merge,
    protocol::View,
    registry::{Registry, Stage, TaskSnapshot, TaskStatus, TaskUpdate},
};

/// Pacing delay between link-resolution calls, to stay under upstream
/// throttling.
const LINK_PACING: Duration = Duration::from_millis(300);

/// Pacing delay between segment downloads.
const SEGMENT_PACING: Duration = Duration::from_millis(200);

/// The upstream operations the orchestrator needs.
///
/// [`Gateway`] is the production implementation; tests drive the state
/// machine with an in-memory source.
pub trait MediaSource: Send + Sync {
    /// Resolves an item id to its metadata and ordered segment list.
    fn media_info(&self, source_id: &str) -> impl Future<Output = Result<View>> + Send;

    /// Resolves the short-lived direct download URL for one segment.
    fn audio_link(
        &self,
        source_id: &str,
        page: u32,
        segment_id: u64,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Streams one segment to `path`, reporting `(downloaded, total)` per
    /// chunk.
    fn download_segment(
        &self,
        url: &str,
        path: &Path,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Downloads a cover image to `path`.
    fn download_cover(&self, url: &str, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Fetches and renders the transcript for one segment, `None` when the
    /// item has none.
    fn transcript(
        &self,
        source_id: &str,
        segment_id: u64,
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

impl MediaSource for Gateway {
    async fn media_info(&self, source_id: &str) -> Result<View> {
        Gateway::media_info(self, source_id).await
    }

    async fn audio_link(&self, source_id: &str, page: u32, segment_id: u64) -> Result<String> {
        Gateway::audio_link(self, source_id, page, segment_id).await
    }

    async fn download_segment(
        &self,
        url: &str,
        path: &Path,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<u64> {
        Gateway::download_segment(self, url, path, on_progress).await
    }

    async fn download_cover(&self, url: &str, path: &Path) -> Result<()> {
        Gateway::download_cover(self, url, path).await
    }

    async fn transcript(&self, source_id: &str, segment_id: u64) -> Result<Option<String>> {
        Gateway::transcript(self, source_id, segment_id).await
    }
}

/// A request to download one item.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    /// The opaque item id.
    pub source_id: String,

    /// First page of the window, 1-based.
    pub start_page: u32,

    /// Last page of the window; `None` means through the last page.
    pub end_page: Option<u32>,

    /// Caller-supplied task id; generated when absent.
    pub task_id: Option<String>,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            start_page: 1,
            end_page: None,
            task_id: None,
        }
    }
}

/// Drives download tasks and reports their progress into the registry.
pub struct Orchestrator<S> {
    source: Arc<S>,
    registry: Arc<Registry>,
    config: Config,
}

impl<S: MediaSource + 'static> Orchestrator<S> {
    #[must_use]
    pub fn new(source: Arc<S>, registry: Arc<Registry>, config: Config) -> Self {
        Self {
            source,
            registry,
            config,
        }
    }

    /// Registers a new task and runs it on a background tokio task.
    ///
    /// The returned snapshot carries the task id to poll.
    pub fn spawn(&self, request: DownloadRequest) -> TaskSnapshot {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let snapshot = self
            .registry
            .create(task_id.clone(), request.source_id.clone(), "");

        let source = Arc::clone(&self.source);
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        tokio::spawn(async move {
            run_task(source, registry, config, task_id, request).await;
        });

        snapshot
    }

    /// Runs a task to completion on the current tokio task.
    ///
    /// The task must already exist in the registry; [`Self::spawn`] is the
    /// usual entry point.
    pub async fn run(&self, task_id: String, request: DownloadRequest) {
        run_task(
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            self.config.clone(),
            task_id,
            request,
        )
        .await;
    }
}

/// Whether the task has been cancelled; logs the observation once.
fn cancelled(registry: &Registry, task_id: &str) -> bool {
    if registry.is_cancelled(task_id) {
        info!("task {task_id} cancelled; stopping");
        return true;
    }
    false
}

/// The task pipeline.
///
/// Every failure path posts an `error` status with a readable message and
/// returns; nothing escapes as a fault.
#[allow(clippy::too_many_lines)]
async fn run_task<S: MediaSource>(
    source: Arc<S>,
    registry: Arc<Registry>,
    config: Config,
    task_id: String,
    request: DownloadRequest,
) {
    let source_id = request.source_id.as_str();
    info!(
        "task {task_id}: downloading {source_id} pages {}..{}",
        request.start_page,
        request
            .end_page
            .map_or_else(|| "end".to_owned(), |p| p.to_string())
    );

    if cancelled(&registry, &task_id) {
        return;
    }

    // Step 1: metadata.
    registry.update(
        &task_id,
        TaskUpdate {
            status: Some(TaskStatus::Downloading),
            stage: Some(Stage::FetchingInfo),
            stage_message: Some("fetching item metadata".to_owned()),
            ..TaskUpdate::default()
        },
    );

    let view = match source.media_info(source_id).await {
        Ok(view) => view,
        Err(e) => {
            error!("task {task_id}: {e}");
            registry.update(&task_id, TaskUpdate::error("metadata unavailable"));
            return;
        }
    };
    registry.update(
        &task_id,
        TaskUpdate {
            title: Some(view.title.clone()),
            ..TaskUpdate::default()
        },
    );

    // Step 2: page window and link resolution.
    let start_page = request.start_page.max(1);
    let end_page = request.end_page.unwrap_or(view.videos);
    let file_prefix = format!("{source_id}_{start_page}_{end_page}");

    if cancelled(&registry, &task_id) {
        return;
    }
    registry.update(
        &task_id,
        TaskUpdate::stage(Stage::FetchingLinks, "resolving download links"),
    );

    let window: Vec<_> = view
        .pages
        .iter()
        .filter(|p| p.page >= start_page && p.page <= end_page)
        .collect();
    if window.is_empty() {
        registry.update(
            &task_id,
            TaskUpdate::error(format!(
                "no pages in requested window {start_page}..{end_page}"
            )),
        );
        return;
    }

    let mut links: Vec<(u32, u64, String)> = Vec::with_capacity(window.len());
    for (idx, page) in window.iter().enumerate() {
        match source.audio_link(source_id, page.page, page.cid).await {
            Ok(url) => links.push((page.page, page.cid, url)),
            Err(e) => {
                error!("task {task_id}: {e}");
                registry.update(
                    &task_id,
                    TaskUpdate::error(format!("no download link for page {}", page.page)),
                );
                return;
            }
        }
        // Pace between calls; nothing follows the last one.
        if idx + 1 < window.len() {
            tokio::time::sleep(LINK_PACING).await;
        }
    }

    let total_pages = u32::try_from(links.len()).unwrap_or(u32::MAX);
    registry.update(
        &task_id,
        TaskUpdate {
            total_pages: Some(total_pages),
            stage: Some(Stage::Downloading),
            stage_message: Some(format!("downloading {total_pages} segments")),
            ..TaskUpdate::default()
        },
    );

    // Step 3: segment downloads, strictly in page order.
    let temp_dir = config.temp_dir();
    let mut survivors: Vec<(u32, u64, std::path::PathBuf)> = Vec::new();
    let mut total_downloaded: u64 = 0;
    // Revised only once, at the first non-zero total-size observation.
    let mut estimated_total: u64 = 0;

    for (idx, (page, cid, url)) in links.iter().enumerate() {
        if cancelled(&registry, &task_id) {
            return;
        }

        let segment_path = temp_dir.join(format!("{file_prefix}_{page}.m4s"));
        #[allow(clippy::cast_possible_truncation)]
        let current_page = (idx + 1) as u32;
        registry.update(
            &task_id,
            TaskUpdate {
                current_page: Some(current_page),
                stage: Some(Stage::Downloading),
                stage_message: Some(format!(
                    "downloading page {page} ({current_page}/{total_pages})"
                )),
                ..TaskUpdate::default()
            },
        );

        let base = total_downloaded;
        let mut on_progress = |downloaded: u64, total: u64| {
            if estimated_total == 0 && total > 0 {
                estimated_total = total * u64::from(total_pages);
                registry.update(
                    &task_id,
                    TaskUpdate {
                        total_bytes: Some(estimated_total),
                        ..TaskUpdate::default()
                    },
                );
            }
            registry.update(&task_id, TaskUpdate::bytes(base + downloaded));
        };

        match source
            .download_segment(url, &segment_path, &mut on_progress)
            .await
        {
            Ok(size) => {
                total_downloaded += size;
                survivors.push((*page, *cid, segment_path));
            }
            Err(e) => {
                // A truncated or failed segment is skipped, not fatal;
                // the task aborts only when nothing survives. Whatever the
                // attempt left on disk is dropped with it.
                let _ = tokio::fs::remove_file(&segment_path).await;
                warn!("task {task_id}: skipping page {page}: {e}");
            }
        }
        tokio::time::sleep(SEGMENT_PACING).await;
    }

    if survivors.is_empty() {
        error!("task {task_id}: {}", Error::NoViableSegments);
        registry.update(&task_id, TaskUpdate::error("no viable segments downloaded"));
        return;
    }

    // Step 4: merge.
    if cancelled(&registry, &task_id) {
        return;
    }
    registry.update(
        &task_id,
        TaskUpdate {
            status: Some(TaskStatus::Merging),
            stage: Some(Stage::Merging),
            stage_message: Some(format!("merging {} segments", survivors.len())),
            merge_progress: Some(0.0),
            ..TaskUpdate::default()
        },
    );

    let segment_paths: Vec<_> = survivors.iter().map(|(_, _, path)| path.clone()).collect();
    let merged_path = temp_dir.join(format!("{file_prefix}_merged.m4a"));
    let merge_result = merge::merge_segments(&segment_paths, &merged_path, |percent, message| {
        registry.update(
            &task_id,
            TaskUpdate {
                merge_progress: Some(percent),
                stage_message: Some(message),
                ..TaskUpdate::default()
            },
        );
    })
    .await;

    let outcome = match merge_result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("task {task_id}: {e}");
            // The segments and any partial merge output are of no further
            // use; drop them best effort before reporting the failure.
            for path in &segment_paths {
                let _ = tokio::fs::remove_file(path).await;
            }
            let _ = tokio::fs::remove_file(&merged_path).await;
            registry.update(&task_id, TaskUpdate::error(format!("{e}")));
            return;
        }
    };
    if let Some(duration) = outcome.duration_seconds {
        registry.update(
            &task_id,
            TaskUpdate {
                total_duration: Some(duration),
                ..TaskUpdate::default()
            },
        );
    }

    // Step 5: cover, best effort.
    if cancelled(&registry, &task_id) {
        return;
    }
    registry.update(
        &task_id,
        TaskUpdate::stage(Stage::DownloadingCover, "downloading cover"),
    );
    let cover_path = config.cover_dir().join(format!("{file_prefix}.jpg"));
    match source.download_cover(&view.pic, &cover_path).await {
        Ok(()) => {
            registry.update(
                &task_id,
                TaskUpdate {
                    cover_path: Some(cover_path.display().to_string()),
                    ..TaskUpdate::default()
                },
            );
        }
        Err(e) => warn!("task {task_id}: cover left unset: {e}"),
    }

    // Step 6: transcript for the first surviving segment, best effort.
    if cancelled(&registry, &task_id) {
        return;
    }
    registry.update(
        &task_id,
        TaskUpdate::stage(Stage::DownloadingSubtitle, "fetching transcript"),
    );
    let first_cid = survivors[0].1;
    match source.transcript(source_id, first_cid).await {
        Ok(Some(text)) if !text.is_empty() => {
            let subtitle_path = config.subtitle_dir().join(format!("{file_prefix}.txt"));
            match tokio::fs::write(&subtitle_path, &text).await {
                Ok(()) => {
                    registry.update(
                        &task_id,
                        TaskUpdate {
                            subtitle_path: Some(subtitle_path.display().to_string()),
                            ..TaskUpdate::default()
                        },
                    );
                }
                Err(e) => warn!("task {task_id}: transcript left unset: {e}"),
            }
        }
        Ok(_) => info!("task {task_id}: no transcript available"),
        Err(e) => warn!("task {task_id}: transcript left unset: {e}"),
    }

    // Step 7: move the artifact into place and drop the temp segments.
    let final_path = config.audio_dir().join(format!("{file_prefix}.m4a"));
    let download_path = match tokio::fs::rename(&outcome.path, &final_path).await {
        Ok(()) => final_path,
        Err(e) => {
            // The merged artifact is intact in the temp dir; serve it from
            // there rather than failing the task.
            warn!(
                "task {task_id}: could not move artifact to {}: {e}",
                final_path.display()
            );
            outcome.path.clone()
        }
    };
    for (_, _, path) in &survivors {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("task {task_id}: temp file {} not removed: {e}", path.display());
        }
    }

    registry.update(
        &task_id,
        TaskUpdate {
            status: Some(TaskStatus::Completed),
            stage: Some(Stage::Completed),
            stage_message: Some("download complete".to_owned()),
            download_path: Some(download_path.display().to_string()),
            ..TaskUpdate::default()
        },
    );
    info!(
        "task {task_id}: completed, artifact at {}",
        download_path.display()
    );
}
