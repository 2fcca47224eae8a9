//! One run of the walk → decide → generate pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EntryOutcome, GenerationContext, GenerationEngine, apply_outcome};
use super::naming::FileKind;
use crate::Error;
use crate::database::models::{FileType, RunCounters};
use crate::remote::{RemoteEntry, RemoteWalker, WalkItem};

/// Progress is reported every this many scanned files.
const PROGRESS_INTERVAL: u64 = 200;

/// Failure messages kept for the run summary.
const MAX_RECORDED_FAILURES: usize = 20;

/// Receives intermediate counters while a run is in progress.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, counters: &RunCounters);
}

/// Sink that drops progress updates.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _counters: &RunCounters) {}
}

/// How a pipeline run ended.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub counters: RunCounters,
    pub cancelled: bool,
    /// Error that stopped the pipeline early.
    pub fatal: Option<Error>,
    /// First few per-file failures, as `path: reason`.
    pub failures: Vec<String>,
}

impl PipelineReport {
    fn record_failure(&mut self, path: &str, reason: &str) {
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(format!("{path}: {reason}"));
        }
    }

    fn apply(&mut self, path: &str, file_type: FileType, outcome: &EntryOutcome) {
        apply_outcome(&mut self.counters, file_type, outcome);
        if let EntryOutcome::Failed(reason) = outcome {
            self.record_failure(path, reason);
        }
    }
}

/// Runs a task's pipeline against the remote index.
pub struct SyncPipeline {
    engine: Arc<GenerationEngine>,
}

impl SyncPipeline {
    pub fn new(engine: Arc<GenerationEngine>) -> Self {
        Self { engine }
    }

    /// Walk the task's source root and process every file.
    ///
    /// Cancellation is checked between entries. Sidecars are buffered and
    /// fetched in batches; a batch still buffered when the run is cancelled
    /// is dropped.
    pub async fn run(
        &self,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> PipelineReport {
        let walker = RemoteWalker::new(
            Arc::clone(self.engine.index()),
            Arc::clone(self.engine.retry()),
            ctx.per_page,
        );
        debug!(
            task_id = ctx.task_id,
            root = %ctx.source_root,
            per_page = walker.per_page(),
            "Walking source root"
        );
        let mut entries = walker.walk(&ctx.source_root);
        let mut report = PipelineReport::default();
        let mut sidecars: Vec<(RemoteEntry, FileType)> = Vec::new();
        let batch_size = ctx.strm.sidecar_batch_size.max(1);

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                item = entries.next() => item,
            };
            let Some(item) = item else {
                break;
            };

            match item {
                WalkItem::Failed {
                    path,
                    root: true,
                    error,
                } => {
                    warn!(task_id = ctx.task_id, path = %path, "Source root listing failed");
                    report.fatal = Some(error);
                    break;
                }
                WalkItem::Failed { path, error, .. } => {
                    report.counters.failed += 1;
                    report.record_failure(&path, &error.to_string());
                }
                WalkItem::File(entry) => {
                    report.counters.total += 1;
                    match ctx.rules.classify(&entry.name) {
                        FileKind::Media => {
                            match self.engine.generate_pointer(ctx, &entry).await {
                                Ok(outcome) => report.apply(&entry.path, FileType::Strm, &outcome),
                                Err(error) => {
                                    report.fatal = Some(error);
                                    break;
                                }
                            }
                        }
                        FileKind::Sidecar(file_type) => {
                            sidecars.push((entry, file_type));
                            if sidecars.len() >= batch_size
                                && let Err(error) =
                                    self.flush_sidecars(ctx, &mut sidecars, &mut report).await
                            {
                                report.fatal = Some(error);
                                break;
                            }
                        }
                        FileKind::Ignored => {}
                    }

                    if report.counters.total % PROGRESS_INTERVAL == 0 {
                        progress.report(&report.counters).await;
                    }
                }
            }
        }

        if !report.cancelled
            && report.fatal.is_none()
            && let Err(error) = self.flush_sidecars(ctx, &mut sidecars, &mut report).await
        {
            report.fatal = Some(error);
        }

        info!(
            task_id = ctx.task_id,
            cancelled = report.cancelled,
            fatal = report.fatal.is_some(),
            "Pipeline finished: {}",
            report.counters.summary()
        );
        report
    }

    async fn flush_sidecars(
        &self,
        ctx: &GenerationContext,
        sidecars: &mut Vec<(RemoteEntry, FileType)>,
        report: &mut PipelineReport,
    ) -> crate::Result<()> {
        if sidecars.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(sidecars);
        debug!(task_id = ctx.task_id, count = batch.len(), "Fetching sidecar batch");
        for processed in self.engine.fetch_sidecars(ctx, batch).await? {
            report.apply(&processed.path, processed.file_type, &processed.outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrmSettings;
    use crate::database::models::TaskDbModel;
    use crate::database::repositories::{FileHistoryRepository, SqlxFileHistoryRepository};
    use crate::database::test_pool;
    use crate::generator::naming::SuffixRules;
    use crate::remote::walker::tests::{FakeIndex, no_delay_retry};
    use parking_lot::Mutex;

    struct RecordingSink(Mutex<Vec<u64>>);

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, counters: &RunCounters) {
            self.0.lock().push(counters.total);
        }
    }

    fn tree() -> Arc<FakeIndex> {
        let index = Arc::new(FakeIndex::new());
        index.add_dir("/media");
        index.add_file("/media/a.mp4", b"a");
        index.add_file("/media/a.nfo", b"nfo");
        index.add_file("/media/a.srt", b"srt");
        index.add_file("/media/notes.txt", b"txt");
        index.add_dir("/media/show");
        index.add_file("/media/show/e1.mkv", b"1");
        index.add_dir("/media/broken");
        index.break_dir("/media/broken");
        index
    }

    fn context(root: &std::path::Path) -> GenerationContext {
        let mut task = TaskDbModel::new("t", "/media", root.to_string_lossy());
        task.id = 1;
        task.download_metadata = true;
        task.download_subtitle = true;
        GenerationContext {
            task_id: 1,
            source_root: "/media".to_string(),
            target_root: root.to_path_buf(),
            overwrite: false,
            rules: SuffixRules::from_task(&task),
            strm: StrmSettings {
                replace_suffix: true,
                sidecar_batch_size: 2,
                ..StrmSettings::default()
            },
            playback_host: "http://alist".to_string(),
            per_page: 100,
        }
    }

    async fn pipeline(index: Arc<FakeIndex>) -> (SyncPipeline, Arc<SqlxFileHistoryRepository>) {
        let history = Arc::new(SqlxFileHistoryRepository::new(test_pool().await));
        let engine = Arc::new(GenerationEngine::new(
            index,
            no_delay_retry(),
            history.clone(),
        ));
        (SyncPipeline::new(engine), history)
    }

    #[tokio::test]
    async fn test_full_run_counts_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (pipeline, history) = pipeline(tree()).await;

        let report = pipeline
            .run(&ctx, &CancellationToken::new(), &NoProgress)
            .await;
        assert!(report.fatal.is_none());
        assert!(!report.cancelled);
        assert_eq!(report.counters.total, 5);
        assert_eq!(report.counters.generated, 2);
        assert_eq!(report.counters.metadata, 1);
        assert_eq!(report.counters.subtitle, 1);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(dir.path().join("show/e1.strm").exists());
        assert!(dir.path().join("a.srt").exists());
        let rows = history.count().await.unwrap();
        assert_eq!(rows, 4);

        let second = pipeline
            .run(&ctx, &CancellationToken::new(), &NoProgress)
            .await;
        assert_eq!(second.counters.generated, 0);
        assert_eq!(second.counters.skipped, 4);
        assert_eq!(history.count().await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_root_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.source_root = "/nope".to_string();
        let (pipeline, _) = pipeline(tree()).await;

        let report = pipeline
            .run(&ctx, &CancellationToken::new(), &NoProgress)
            .await;
        assert!(report.fatal.is_some());
        assert_eq!(report.counters.total, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (pipeline, history) = pipeline(tree()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline.run(&ctx, &cancel, &NoProgress).await;
        assert!(report.cancelled);
        assert_eq!(report.counters.total, 0);
        assert_eq!(history.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_reports() {
        let index = Arc::new(FakeIndex::new());
        index.add_dir("/media");
        for i in 0..(PROGRESS_INTERVAL * 2) {
            index.add_file(&format!("/media/f{i}.txt"), b"");
        }
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.per_page = 500;
        let (pipeline, _) = pipeline(index).await;

        let sink = RecordingSink(Mutex::new(Vec::new()));
        let report = pipeline.run(&ctx, &CancellationToken::new(), &sink).await;
        assert_eq!(report.counters.total, PROGRESS_INTERVAL * 2);
        assert_eq!(
            *sink.0.lock(),
            vec![PROGRESS_INTERVAL, PROGRESS_INTERVAL * 2]
        );
    }
}
