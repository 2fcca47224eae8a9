//! Generate/skip/overwrite decisions and their side effects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, stream};
use tracing::{debug, warn};

use super::naming::{SuffixRules, build_pointer_url, file_suffix, pointer_file_name, target_dir};
use crate::config::{AppSettings, StrmSettings};
use crate::database::models::{FileHistoryDbModel, FileType, RunCounters, TaskDbModel};
use crate::database::repositories::FileHistoryRepository;
use crate::remote::{RemoteEntry, RemoteIndex, RetryExecutor};
use crate::utils::fs;
use crate::{Error, Result};

/// Everything a run needs to turn remote entries into local files.
///
/// Built once at run start from the task and the settings snapshot, so a
/// settings change never affects a run in progress.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub task_id: i64,
    pub source_root: String,
    pub target_root: PathBuf,
    pub overwrite: bool,
    pub rules: SuffixRules,
    pub strm: StrmSettings,
    pub playback_host: String,
    pub per_page: u32,
}

impl GenerationContext {
    pub fn new(task: &TaskDbModel, settings: &AppSettings) -> Self {
        Self {
            task_id: task.id,
            source_root: task.source_path.trim().to_string(),
            target_root: PathBuf::from(task.target_path.trim()),
            overwrite: task.overwrite,
            rules: SuffixRules::from_task(task),
            strm: settings.strm.clone(),
            playback_host: settings.remote.playback_host().to_string(),
            per_page: settings.remote.effective_per_page(),
        }
    }
}

/// Result of processing one remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Generated,
    Overwritten,
    Skipped,
    Failed(String),
}

/// Outcome of one file together with the kind of file produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEntry {
    pub path: String,
    pub file_type: FileType,
    pub outcome: EntryOutcome,
}

/// Add one processed file to the run counters.
pub fn apply_outcome(counters: &mut RunCounters, file_type: FileType, outcome: &EntryOutcome) {
    match (file_type, outcome) {
        (_, EntryOutcome::Skipped) => counters.skipped += 1,
        (_, EntryOutcome::Failed(_)) => counters.failed += 1,
        (FileType::Strm, EntryOutcome::Generated) => counters.generated += 1,
        (FileType::Strm, EntryOutcome::Overwritten) => counters.overwritten += 1,
        (FileType::Metadata, _) => counters.metadata += 1,
        (FileType::Subtitle, _) => counters.subtitle += 1,
    }
}

/// Errors that end the run instead of failing a single file.
fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::DatabaseSqlx(_) | Error::Migration(_))
}

/// Writes pointer files and sidecars, consulting the history ledger.
pub struct GenerationEngine {
    index: Arc<dyn RemoteIndex>,
    retry: Arc<RetryExecutor>,
    history: Arc<dyn FileHistoryRepository>,
}

impl GenerationEngine {
    pub fn new(
        index: Arc<dyn RemoteIndex>,
        retry: Arc<RetryExecutor>,
        history: Arc<dyn FileHistoryRepository>,
    ) -> Self {
        Self {
            index,
            retry,
            history,
        }
    }

    pub fn index(&self) -> &Arc<dyn RemoteIndex> {
        &self.index
    }

    pub fn retry(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    /// Write the pointer file for a media entry.
    ///
    /// Per-file problems come back as [`EntryOutcome::Failed`]; only
    /// database errors are returned as `Err`.
    pub async fn generate_pointer(
        &self,
        ctx: &GenerationContext,
        entry: &RemoteEntry,
    ) -> Result<EntryOutcome> {
        per_file(entry, self.try_generate_pointer(ctx, entry).await)
    }

    async fn try_generate_pointer(
        &self,
        ctx: &GenerationContext,
        entry: &RemoteEntry,
    ) -> Result<EntryOutcome> {
        let dir = target_dir(&ctx.source_root, &ctx.target_root, &entry.path)?;
        let name = pointer_file_name(
            &entry.name,
            ctx.strm.replace_suffix,
            &ctx.strm.pointer_extension,
        );
        let target = dir.join(&name);

        let existed = fs::file_exists(&target).await?;
        if existed && !ctx.overwrite {
            debug!(path = %target.display(), "Pointer file exists, skipping");
            return Ok(EntryOutcome::Skipped);
        }

        let url = build_pointer_url(
            &ctx.playback_host,
            &entry.path,
            &entry.sign,
            ctx.strm.url_encode,
        );
        fs::write_file(&target, url.as_bytes()).await?;
        self.record_history(ctx, entry, &name, &target, FileType::Strm, entry.size)
            .await?;

        Ok(if existed {
            EntryOutcome::Overwritten
        } else {
            EntryOutcome::Generated
        })
    }

    /// Copy a metadata or subtitle file verbatim.
    pub async fn fetch_sidecar(
        &self,
        ctx: &GenerationContext,
        entry: &RemoteEntry,
        file_type: FileType,
    ) -> Result<EntryOutcome> {
        per_file(entry, self.try_fetch_sidecar(ctx, entry, file_type).await)
    }

    async fn try_fetch_sidecar(
        &self,
        ctx: &GenerationContext,
        entry: &RemoteEntry,
        file_type: FileType,
    ) -> Result<EntryOutcome> {
        let dir = target_dir(&ctx.source_root, &ctx.target_root, &entry.path)?;
        let target = dir.join(&entry.name);

        let existed = fs::file_exists(&target).await?;
        if existed && !ctx.overwrite {
            debug!(path = %target.display(), "Sidecar exists, skipping");
            return Ok(EntryOutcome::Skipped);
        }

        let index = &self.index;
        let info = self
            .retry
            .execute(&format!("resolving {}", entry.path), move || {
                index.get_info(&entry.path)
            })
            .await?;
        let source = RemoteEntry {
            raw_url: info.raw_url,
            sign: if info.sign.is_empty() {
                entry.sign.clone()
            } else {
                info.sign
            },
            ..entry.clone()
        };
        let source = &source;
        let bytes = self
            .retry
            .execute(&format!("downloading {}", entry.path), move || {
                index.fetch_bytes(source)
            })
            .await?;

        fs::write_file(&target, &bytes).await?;
        self.record_history(
            ctx,
            entry,
            &entry.name,
            &target,
            file_type,
            bytes.len() as u64,
        )
        .await?;

        Ok(if existed {
            EntryOutcome::Overwritten
        } else {
            EntryOutcome::Generated
        })
    }

    /// Fetch a batch of sidecars with bounded concurrency.
    pub async fn fetch_sidecars(
        &self,
        ctx: &GenerationContext,
        batch: Vec<(RemoteEntry, FileType)>,
    ) -> Result<Vec<ProcessedEntry>> {
        let concurrency = ctx.strm.sidecar_batch_size.max(1);
        let results: Vec<Result<ProcessedEntry>> = stream::iter(batch)
            .map(|(entry, file_type)| async move {
                let outcome = self.fetch_sidecar(ctx, &entry, file_type).await?;
                Ok(ProcessedEntry {
                    path: entry.path,
                    file_type,
                    outcome,
                })
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn record_history(
        &self,
        ctx: &GenerationContext,
        entry: &RemoteEntry,
        file_name: &str,
        target: &Path,
        file_type: FileType,
        size: u64,
    ) -> Result<()> {
        let target_path = target.to_string_lossy();
        if self.history.exists(&entry.path, &target_path).await? {
            return Ok(());
        }
        let row = FileHistoryDbModel::new(
            ctx.task_id,
            file_name,
            entry.path.as_str(),
            target_path.as_ref(),
            size as i64,
            file_type,
            file_suffix(&entry.name).unwrap_or_default(),
        );
        self.history.record(&row).await?;
        Ok(())
    }
}

fn per_file(entry: &RemoteEntry, result: Result<EntryOutcome>) -> Result<EntryOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if is_fatal(&err) => Err(err),
        Err(err) => {
            warn!(path = %entry.path, error = %err, "Failed to process remote file");
            Ok(EntryOutcome::Failed(err.to_string()))
        }
    }
}
