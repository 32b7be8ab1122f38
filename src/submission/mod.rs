//! TAG file submission: validate, archive, buffer, then process.
//!
//! ```text
//!  submit ──► validate ──► archive ──► TagFileBufferQueue ──► QueueProcessor
//!    │            │            │               │                    │
//!    └── failure response on empty content, rejection, archive      │
//!        error or a file already queued                             ▼
//!                                           convert ──► register machine ──► integrate
//! ```
//!
//! Submission only buffers. A single [`QueueProcessor`] drains the queue a
//! project batch at a time, so files of one project are integrated in the
//! order they were accepted.

pub mod processor;
pub mod queue;

pub use processor::{ProcessedTagFile, QueueProcessor, TagFileOutcome};
pub use queue::{QueueKey, QueuedTagFile, TagFileBufferQueue};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct SubmitTagFileRequest {
    /// Project to ingest into, when the caller already knows it
    pub project_override: Option<Uuid>,
    pub asset_override: Option<Uuid>,
    pub file_name: String,
    pub content: Vec<u8>,
    pub origin_org: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTagFileResponse {
    pub success: bool,
    pub file_name: String,
    pub message: String,
}

impl SubmitTagFileResponse {
    fn accepted(file_name: &str) -> Self {
        Self {
            success: true,
            file_name: file_name.to_string(),
            message: String::new(),
        }
    }

    fn rejected(file_name: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            file_name: file_name.to_string(),
            message: message.into(),
        }
    }
}

/// Where an accepted file is ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagFileTarget {
    pub project: Uuid,
    pub asset: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid(TagFileTarget),
    Unauthorized,
    NoLicense,
    UnknownProject,
    InvalidFile,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationResult::Valid(_) => "valid",
            ValidationResult::Unauthorized => "submitter is not authorized for the project",
            ValidationResult::NoLicense => "no license for the asset",
            ValidationResult::UnknownProject => "project could not be determined",
            ValidationResult::InvalidFile => "file is not a TAG file",
        };
        f.write_str(text)
    }
}

/// Decides whether and where a submitted file is ingested.
#[async_trait]
pub trait TagFileValidator: Send + Sync {
    async fn validate(&self, request: &SubmitTagFileRequest) -> ValidationResult;
}

/// Keeps a copy of every accepted file.
#[async_trait]
pub trait TagFileArchiver: Send + Sync {
    async fn archive(&self, target: TagFileTarget, file_name: &str, content: &[u8]) -> Result<()>;
}

/// Accepts any file that names its project. Files without an asset
/// override are attributed to the nil asset.
#[derive(Debug, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl TagFileValidator for AcceptAllValidator {
    async fn validate(&self, request: &SubmitTagFileRequest) -> ValidationResult {
        match request.project_override {
            Some(project) => ValidationResult::Valid(TagFileTarget {
                project,
                asset: request.asset_override.unwrap_or_else(Uuid::nil),
            }),
            None => ValidationResult::UnknownProject,
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopArchiver;

#[async_trait]
impl TagFileArchiver for NoopArchiver {
    async fn archive(&self, _: TagFileTarget, _: &str, _: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Front door of the pipeline.
pub struct TagFileSubmitter {
    validator: Arc<dyn TagFileValidator>,
    archiver: Arc<dyn TagFileArchiver>,
    queue: Arc<TagFileBufferQueue>,
}

impl TagFileSubmitter {
    pub fn new(queue: Arc<TagFileBufferQueue>) -> Self {
        Self {
            validator: Arc::new(AcceptAllValidator),
            archiver: Arc::new(NoopArchiver),
            queue,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TagFileValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn TagFileArchiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub async fn submit(&self, request: SubmitTagFileRequest) -> SubmitTagFileResponse {
        let file_name = request.file_name.clone();
        if request.content.is_empty() {
            return SubmitTagFileResponse::rejected(&file_name, "TAG file has no content");
        }

        let target = match self.validator.validate(&request).await {
            ValidationResult::Valid(target) => target,
            rejection => {
                tracing::info!(file = %file_name, reason = %rejection, "TAG file rejected");
                return SubmitTagFileResponse::rejected(&file_name, rejection.to_string());
            }
        };

        if let Err(e) = self
            .archiver
            .archive(target, &file_name, &request.content)
            .await
        {
            tracing::warn!(file = %file_name, project = %target.project, error = %e, "Failed to archive TAG file");
            return SubmitTagFileResponse::rejected(&file_name, format!("archive failed: {}", e));
        }

        let queued = QueuedTagFile {
            key: QueueKey {
                file_name: file_name.clone(),
                project: target.project,
                asset: target.asset,
            },
            content: Arc::new(request.content),
            submitted_utc: Utc::now(),
        };
        match self.queue.add(queued) {
            Ok(true) => {
                tracing::debug!(file = %file_name, project = %target.project, "Queued TAG file");
                SubmitTagFileResponse::accepted(&file_name)
            }
            Ok(false) => {
                SubmitTagFileResponse::rejected(&file_name, "TAG file is already queued")
            }
            Err(e) => SubmitTagFileResponse::rejected(&file_name, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    fn request(name: &str, project: Option<Uuid>) -> SubmitTagFileRequest {
        SubmitTagFileRequest {
            project_override: project,
            file_name: name.to_string(),
            content: vec![1, 2, 3],
            ..Default::default()
        }
    }

    struct Refuse(ValidationResult);

    #[async_trait]
    impl TagFileValidator for Refuse {
        async fn validate(&self, _: &SubmitTagFileRequest) -> ValidationResult {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        names: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TagFileArchiver for Recorder {
        async fn archive(&self, _: TagFileTarget, file_name: &str, _: &[u8]) -> Result<()> {
            if self.fail {
                return Err(Error::InvalidState("archive offline".to_string()));
            }
            self.names.lock()?.push(file_name.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_accepted_file_is_archived_and_queued() -> Result<()> {
        let queue = Arc::new(TagFileBufferQueue::new());
        let archiver = Arc::new(Recorder::default());
        let submitter = TagFileSubmitter::new(queue.clone()).with_archiver(archiver.clone());
        let project = Uuid::new_v4();

        let response = submitter.submit(request("0001.tag", Some(project))).await;
        assert!(response.success, "{}", response.message);
        assert_eq!(response.file_name, "0001.tag");
        assert_eq!(*archiver.names.lock()?, vec!["0001.tag".to_string()]);
        assert!(queue.contains(&QueueKey {
            file_name: "0001.tag".to_string(),
            project,
            asset: Uuid::nil(),
        })?);

        let again = submitter.submit(request("0001.tag", Some(project))).await;
        assert!(!again.success);
        assert_eq!(queue.len()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejections_do_not_queue() -> Result<()> {
        let queue = Arc::new(TagFileBufferQueue::new());
        let submitter = TagFileSubmitter::new(queue.clone());

        let mut empty = request("empty.tag", Some(Uuid::new_v4()));
        empty.content.clear();
        assert!(!submitter.submit(empty).await.success);

        let unknown = submitter.submit(request("lost.tag", None)).await;
        assert!(!unknown.success);
        assert_eq!(unknown.message, ValidationResult::UnknownProject.to_string());

        let unlicensed = TagFileSubmitter::new(queue.clone())
            .with_validator(Arc::new(Refuse(ValidationResult::NoLicense)));
        assert!(!unlicensed.submit(request("x.tag", Some(Uuid::new_v4()))).await.success);

        let offline = TagFileSubmitter::new(queue.clone()).with_archiver(Arc::new(Recorder {
            fail: true,
            ..Default::default()
        }));
        let response = offline.submit(request("y.tag", Some(Uuid::new_v4()))).await;
        assert!(!response.success);
        assert!(response.message.contains("archive"));

        assert!(queue.is_empty()?);
        Ok(())
    }
}
