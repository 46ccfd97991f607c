use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use db::{
    DBService, DbErr,
    models::{
        image_generation::ImageGeneration,
        project::Project,
        transform_run::{CreateTransformRun, TransformRun},
    },
    types::{EditMode, GenerationStatus, RunStatus, TaskKind},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use utils::msg_store::MsgStore;
use utils_jwt::TokenService;
use uuid::Uuid;

use crate::services::{
    config::TransformConfig,
    eligibility::{EligibilityError, ProcessingGate},
    inference::{FetchedImage, GeneratedImage, InferenceClient, InferenceError},
    lineage::{self, LineageError},
    mask::{self, MaskError},
    progress::{self, ProgressRegistry, TaskStep},
    storage::{self, ObjectStore, StorageError, StorageKind, StoredObject},
};

/// Why a submission or run failed. `TransientExternal` is the only class the
/// retry loop re-attempts; everything else is terminal on first occurrence.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Validation(String),
    #[error("Image {0} not found")]
    ImageNotFound(Uuid),
    #[error("Processing not allowed: {0}")]
    Denied(String),
    #[error("Transient upstream failure: {0}")]
    TransientExternal(String),
    #[error("Upstream rejected the request: {0}")]
    PermanentExternal(String),
    #[error("Failed to process image data: {0}")]
    Decode(String),
    #[error("Edit lost a concurrent-version race and gave up")]
    Conflict,
    #[error("Run exceeded its {0}s deadline")]
    TimedOut(u64),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Token(#[from] utils_jwt::TokenError),
}

impl TransformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransformError::TransientExternal(_))
    }
}

impl From<InferenceError> for TransformError {
    fn from(err: InferenceError) -> Self {
        if err.is_transient() {
            TransformError::TransientExternal(err.to_string())
        } else {
            TransformError::PermanentExternal(err.to_string())
        }
    }
}

impl From<StorageError> for TransformError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(_) => TransformError::TransientExternal(err.to_string()),
            StorageError::InvalidPath(_) | StorageError::NotFound(_) => {
                TransformError::PermanentExternal(err.to_string())
            }
        }
    }
}

impl From<MaskError> for TransformError {
    fn from(err: MaskError) -> Self {
        TransformError::Decode(err.to_string())
    }
}

impl From<LineageError> for TransformError {
    fn from(err: LineageError) -> Self {
        match err {
            LineageError::Database(err) => TransformError::Database(err),
            LineageError::Contention { .. } => TransformError::Conflict,
        }
    }
}

impl From<EligibilityError> for TransformError {
    fn from(err: EligibilityError) -> Self {
        match err {
            EligibilityError::Denied(reason) => TransformError::Denied(reason),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EditRequest {
    pub image_id: Uuid,
    pub mode: EditMode,
    pub prompt: String,
    pub mask_url: Option<String>,
    /// Deletes every version newer than the base before recording the edit.
    pub replace_newer_versions: bool,
}

#[derive(Clone, Debug)]
pub enum TransformRequest {
    /// Re-runs the stored prompt and fills the record in place.
    Regenerate { image_id: Uuid },
    /// Produces a new version in the image's lineage.
    Edit(EditRequest),
}

impl TransformRequest {
    pub fn image_id(&self) -> Uuid {
        match self {
            TransformRequest::Regenerate { image_id } => *image_id,
            TransformRequest::Edit(edit) => edit.image_id,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TransformRequest::Regenerate { .. } => TaskKind::Regenerate,
            TransformRequest::Edit(_) => TaskKind::Edit,
        }
    }
}

/// Accepted submission: the run to watch and the credential scoped to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmittedRun {
    pub run_id: Uuid,
    pub status_token: String,
}

#[derive(Clone, Copy, Debug)]
struct RunOutcome {
    result_id: Uuid,
}

/// Dispatches transformation runs: validates, schedules, executes with
/// retries, and settles every terminal outcome back into the database.
#[derive(Clone)]
pub struct TransformService {
    db: DBService,
    store: Arc<dyn ObjectStore>,
    inference: Arc<dyn InferenceClient>,
    pub progress: ProgressRegistry,
    gate: Arc<dyn ProcessingGate>,
    tokens: Arc<TokenService>,
    config: TransformConfig,
}

impl TransformService {
    pub fn new(
        db: DBService,
        store: Arc<dyn ObjectStore>,
        inference: Arc<dyn InferenceClient>,
        gate: Arc<dyn ProcessingGate>,
        tokens: Arc<TokenService>,
        config: TransformConfig,
    ) -> Self {
        Self {
            db,
            store,
            inference,
            progress: ProgressRegistry::new(),
            gate,
            tokens,
            config,
        }
    }

    /// Validates the request, records the run, and schedules it. Validation
    /// and eligibility failures reject the submission before any run row or
    /// side effect exists.
    pub async fn submit(&self, request: TransformRequest) -> Result<SubmittedRun, TransformError> {
        let db = &self.db.connection;
        let image_id = request.image_id();
        let generation = ImageGeneration::find_by_id(db, image_id)
            .await?
            .ok_or(TransformError::ImageNotFound(image_id))?;

        match &request {
            TransformRequest::Regenerate { .. } => {
                if generation.prompt.trim().is_empty() {
                    return Err(TransformError::Validation(format!(
                        "Image {image_id} has no stored prompt to regenerate with"
                    )));
                }
            }
            TransformRequest::Edit(edit) => {
                if edit.prompt.trim().is_empty() {
                    return Err(TransformError::Validation(
                        "Edit prompt must not be empty".to_string(),
                    ));
                }
                if edit.mode == EditMode::Remove && edit.mask_url.is_none() {
                    return Err(TransformError::Validation(
                        "Remove edits require a mask".to_string(),
                    ));
                }
            }
        }

        self.gate.check(&generation).await?;

        let run = TransformRun::create(
            db,
            &CreateTransformRun {
                generation_id: generation.id,
                kind: request.kind(),
            },
        )
        .await?;
        let status_token = self.tokens.issue_run_status(run.id)?;
        self.progress.store_for(run.id);

        tracing::info!(
            "Scheduled {} run {} for image {}",
            run.kind,
            run.id,
            generation.id
        );
        let service = self.clone();
        let spawned_run = run.clone();
        tokio::spawn(async move {
            service.run(spawned_run, generation, request).await;
        });

        Ok(SubmittedRun {
            run_id: run.id,
            status_token,
        })
    }

    /// Status channel for a run: the live channel while the registry still
    /// tracks it, else a closed replay derived from the terminal run row.
    /// A queued or running row without a channel belongs to a previous
    /// process and has nothing to replay.
    pub fn status_channel(&self, run: &TransformRun) -> Option<Arc<MsgStore>> {
        if let Some(store) = self.progress.get(run.id) {
            return Some(store);
        }
        match run.status {
            RunStatus::Completed => Some(progress::replay_channel(
                TaskStep::Completed,
                TaskStep::Completed.label(),
            )),
            RunStatus::Failed => Some(progress::replay_channel(
                TaskStep::Failed,
                failure_label(run.kind),
            )),
            RunStatus::Queued | RunStatus::Running => None,
        }
    }

    /// Folded status document for a run, live or terminal.
    pub fn status_snapshot(&self, run: &TransformRun) -> Option<Value> {
        self.status_channel(run).map(|store| store.current_status())
    }

    /// Drives one run to a terminal status. Transient failures are retried
    /// with exponential backoff up to the per-kind attempt budget; the whole
    /// run races a hard deadline.
    async fn run(&self, run: TransformRun, generation: ImageGeneration, request: TransformRequest) {
        let max_attempts = match run.kind {
            TaskKind::Regenerate => self.config.regenerate_max_attempts,
            TaskKind::Edit => self.config.edit_max_attempts,
        };
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(self.config.retry_base_delay_secs))
            .with_max_delay(Duration::from_secs(self.config.retry_max_delay_secs))
            .with_max_times(max_attempts.saturating_sub(1) as usize);

        let attempts = || self.execute_once(&run, &generation, &request);
        let retried = attempts
            .retry(backoff)
            .when(TransformError::is_transient)
            .notify(|err: &TransformError, delay: Duration| {
                tracing::warn!("Transformation attempt failed ({err}), retrying in {delay:?}");
            });

        let deadline = Duration::from_secs(self.config.task_timeout_secs);
        let outcome = match tokio::time::timeout(deadline, retried).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransformError::TimedOut(self.config.task_timeout_secs)),
        };

        self.finalize(&run, &generation, outcome).await;
    }

    async fn execute_once(
        &self,
        run: &TransformRun,
        generation: &ImageGeneration,
        request: &TransformRequest,
    ) -> Result<RunOutcome, TransformError> {
        let attempt = TransformRun::record_attempt(&self.db.connection, run.id).await?;
        match request {
            TransformRequest::Regenerate { .. } => {
                self.execute_regenerate(run, generation, attempt).await
            }
            TransformRequest::Edit(edit) => self.execute_edit(run, generation, edit).await,
        }
    }

    /// Fills an unfilled record in place. Already-completed records are left
    /// alone without touching storage or the model.
    async fn execute_regenerate(
        &self,
        run: &TransformRun,
        generation: &ImageGeneration,
        attempt: i32,
    ) -> Result<RunOutcome, TransformError> {
        let db = &self.db.connection;
        let record = ImageGeneration::find_by_id(db, generation.id)
            .await?
            .ok_or(TransformError::ImageNotFound(generation.id))?;
        if record.status == GenerationStatus::Completed {
            tracing::info!("Image {} is already completed, skipping regeneration", record.id);
            return Ok(RunOutcome { result_id: record.id });
        }

        self.progress.report(run.id, TaskStep::Fetching);
        let source = self.fetch_bytes(&record.original_image_url).await?;

        self.progress.report(run.id, TaskStep::Preparing);
        ImageGeneration::mark_processing(db, record.id).await?;
        let staged = storage::write_image(
            self.store.as_ref(),
            record.workspace_id,
            record.project_id,
            StorageKind::Original,
            record.id,
            &source.content_type,
            &source.bytes,
        )
        .await?;

        self.progress.report(run.id, TaskStep::Processing);
        let produced = self.inference.enhance(&staged.url, &record.prompt).await?;

        self.progress.report(run.id, TaskStep::Saving);
        let fetched = self.fetch_bytes(&produced.url).await?;
        let stored = storage::write_image(
            self.store.as_ref(),
            record.workspace_id,
            record.project_id,
            StorageKind::Result,
            record.id,
            picked_content_type(&produced, &fetched),
            &fetched.bytes,
        )
        .await?;

        let metadata = json!({
            "run_id": run.id,
            "attempts": attempt,
        });
        ImageGeneration::mark_completed(db, record.id, &stored.url, Some(metadata)).await?;
        self.discard_objects(&[staged.path]).await;

        Ok(RunOutcome {
            result_id: record.id,
        })
    }

    /// Produces a new version from the base image. The base record is never
    /// written; a failure anywhere leaves the lineage exactly as it was.
    async fn execute_edit(
        &self,
        run: &TransformRun,
        generation: &ImageGeneration,
        edit: &EditRequest,
    ) -> Result<RunOutcome, TransformError> {
        let base = ImageGeneration::find_by_id(&self.db.connection, generation.id)
            .await?
            .ok_or(TransformError::ImageNotFound(generation.id))?;

        self.progress.report(run.id, TaskStep::Fetching);
        let source_url = base
            .result_image_url
            .as_deref()
            .unwrap_or(&base.original_image_url);
        let source = self.fetch_bytes(source_url).await?;

        self.progress.report(run.id, TaskStep::Preparing);
        let new_id = Uuid::new_v4();
        let staged_source = storage::write_image(
            self.store.as_ref(),
            base.workspace_id,
            base.project_id,
            StorageKind::Original,
            new_id,
            &source.content_type,
            &source.bytes,
        )
        .await?;

        // Staged inputs are attempt-scoped scratch. They must outlive the
        // model call but not the attempt itself, however it settles.
        let mut staged_paths = vec![staged_source.path.clone()];
        let outcome = self
            .edit_from_staged(run, &base, edit, new_id, &staged_source, &source, &mut staged_paths)
            .await;
        self.discard_objects(&staged_paths).await;
        outcome
    }

    async fn edit_from_staged(
        &self,
        run: &TransformRun,
        base: &ImageGeneration,
        edit: &EditRequest,
        new_id: Uuid,
        staged_source: &StoredObject,
        source: &FetchedImage,
        staged_paths: &mut Vec<String>,
    ) -> Result<RunOutcome, TransformError> {
        let staged_mask = match (edit.mode, edit.mask_url.as_deref()) {
            (EditMode::Remove, Some(mask_url)) => {
                let mask = self.fetch_bytes(mask_url).await?;
                let source_bytes = source.bytes.clone();
                let aligned = tokio::task::spawn_blocking(move || {
                    let (width, height) = mask::dimensions_of(&source_bytes)?;
                    mask::align_mask(&mask.bytes, width, height)
                })
                .await
                .map_err(|err| TransformError::Decode(format!("Mask alignment failed: {err}")))??;
                let staged = storage::write_image(
                    self.store.as_ref(),
                    base.workspace_id,
                    base.project_id,
                    StorageKind::Mask,
                    run.id,
                    "image/png",
                    &aligned,
                )
                .await?;
                staged_paths.push(staged.path.clone());
                Some(staged)
            }
            (EditMode::Remove, None) => {
                return Err(TransformError::Validation(
                    "Remove edits require a mask".to_string(),
                ));
            }
            (EditMode::Add, _) => None,
        };

        self.progress.report(run.id, TaskStep::Processing);
        let produced = self
            .inference
            .edit(
                &staged_source.url,
                staged_mask.as_ref().map(|m| m.url.as_str()),
                &edit.prompt,
            )
            .await?;

        self.progress.report(run.id, TaskStep::Saving);
        let fetched = self.fetch_bytes(&produced.url).await?;
        let stored = storage::write_image(
            self.store.as_ref(),
            base.workspace_id,
            base.project_id,
            StorageKind::Result,
            new_id,
            picked_content_type(&produced, &fetched),
            &fetched.bytes,
        )
        .await?;

        let recorded = lineage::record_edit(
            &self.db.connection,
            base,
            new_id,
            &stored.url,
            &edit.prompt,
            edit.mode,
            edit.replace_newer_versions,
        )
        .await;
        match recorded {
            Ok(recorded) => {
                // Pruned rows are gone; their stored results go with them.
                let orphaned: Vec<String> = recorded
                    .pruned_result_urls
                    .iter()
                    .filter_map(|url| storage::path_from_url(url))
                    .map(str::to_string)
                    .collect();
                self.discard_objects(&orphaned).await;
                Ok(RunOutcome {
                    result_id: recorded.generation.id,
                })
            }
            Err(err) => {
                // The version row never landed, so drop the orphaned object.
                if let Err(cleanup) = self.store.delete(&stored.path).await {
                    tracing::warn!(
                        "Failed to clean up orphaned result {}: {cleanup}",
                        stored.path
                    );
                }
                Err(err.into())
            }
        }
    }

    /// Best-effort removal of scratch objects. A failed delete is logged and
    /// never fails the run.
    async fn discard_objects(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        if let Err(err) = self.store.delete_many(paths).await {
            tracing::warn!("Failed to remove staged objects: {err}");
        }
    }

    /// Resolves an image URL to raw bytes. Own `/files/...` URLs are read
    /// straight from the object store; anything http(s) is downloaded.
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedImage, TransformError> {
        if let Some(path) = url.strip_prefix("/files/") {
            let bytes = self.store.get(path).await?;
            let content_type = storage::content_type_for_path(path).to_string();
            return Ok(FetchedImage {
                bytes,
                content_type,
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(self.inference.fetch(url).await?);
        }
        Err(TransformError::PermanentExternal(format!(
            "Unsupported image URL: {url}"
        )))
    }

    /// Settles the run's terminal state: row updates, project counters, and
    /// the final progress event, in that order, so a client seeing the
    /// terminal event observes fully consistent state.
    async fn finalize(
        &self,
        run: &TransformRun,
        generation: &ImageGeneration,
        outcome: Result<RunOutcome, TransformError>,
    ) {
        let db = &self.db.connection;
        let terminal_step = match &outcome {
            Ok(RunOutcome { result_id }) => {
                if let Err(err) = TransformRun::mark_completed(db, run.id, *result_id).await {
                    tracing::error!("Failed to mark run {} completed: {err}", run.id);
                }
                tracing::info!("Run {} completed with result {result_id}", run.id);
                Ok(())
            }
            Err(err) => {
                tracing::error!("Run {} failed: {err}", run.id);
                let message = err.to_string();
                if let Err(db_err) = TransformRun::mark_failed(db, run.id, &message).await {
                    tracing::error!("Failed to mark run {} failed: {db_err}", run.id);
                }
                if run.kind == TaskKind::Regenerate {
                    self.fail_generation_if_unfinished(generation.id, &message)
                        .await;
                }
                Err(failure_label(run.kind))
            }
        };

        if let Err(err) = Project::recount(db, generation.project_id).await {
            tracing::error!(
                "Failed to refresh counters for project {}: {err}",
                generation.project_id
            );
        }

        match terminal_step {
            Ok(()) => self.progress.report(run.id, TaskStep::Completed),
            Err(label) => self.progress.report_failed(run.id, label),
        }
        self.progress.finish(run.id);
    }

    /// Regeneration failures land on the record itself, but never clobber a
    /// record another run completed in the meantime.
    async fn fail_generation_if_unfinished(&self, id: Uuid, message: &str) {
        let db = &self.db.connection;
        match ImageGeneration::find_by_id(db, id).await {
            Ok(Some(record)) if record.status != GenerationStatus::Completed => {
                if let Err(err) = ImageGeneration::mark_failed(db, id, message).await {
                    tracing::error!("Failed to mark image {id} failed: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::error!("Failed to load image {id}: {err}"),
        }
    }

    /// Boot-time sweep: runs left unfinished by a previous process are
    /// failed and their projects recounted.
    pub async fn recover_interrupted(&self) -> Result<(), DbErr> {
        let db = &self.db.connection;
        let unfinished = TransformRun::find_unfinished(db).await?;
        if unfinished.is_empty() {
            return Ok(());
        }
        tracing::warn!("Failing {} run(s) interrupted by restart", unfinished.len());

        let mut project_ids: Vec<Uuid> = Vec::new();
        for run in unfinished {
            TransformRun::mark_failed(db, run.id, "Interrupted by restart").await?;
            let Some(generation) = ImageGeneration::find_by_id(db, run.generation_id).await? else {
                continue;
            };
            if run.kind == TaskKind::Regenerate
                && !matches!(
                    generation.status,
                    GenerationStatus::Completed | GenerationStatus::Failed
                )
            {
                ImageGeneration::mark_failed(db, generation.id, "Interrupted by restart").await?;
            }
            if !project_ids.contains(&generation.project_id) {
                project_ids.push(generation.project_id);
            }
        }
        for project_id in project_ids {
            Project::recount(db, project_id).await?;
        }
        Ok(())
    }
}

/// Short failure label shown to status subscribers.
fn failure_label(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Regenerate => "Regeneration failed",
        TaskKind::Edit => "Edit failed",
    }
}

/// The model's declared content type wins; the transport header is the
/// fallback.
fn picked_content_type<'a>(produced: &'a GeneratedImage, fetched: &'a FetchedImage) -> &'a str {
    if produced.content_type.is_empty() {
        &fetched.content_type
    } else {
        &produced.content_type
    }
}
