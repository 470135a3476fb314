use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::core::time::{format_optional, format_primitive};
use crate::db::models::{Assignment, AssignmentListItem, Essay};
use crate::db::types::{AssignmentStatus, EssayStatus, FailureKind};
use crate::services::assignments::{AssignmentDraft, AssignmentPatch};
use crate::services::ingestion::{IngestReport, SkippedEntry};
use crate::tasks::grading::{BatchHandle, BatchProgress, FailedEssay};

/// Distinguishes an absent field from an explicit `null`.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct AssignmentCreate {
    #[serde(alias = "rubricId")]
    pub(crate) rubric_id: Uuid,
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: String,
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub(crate) prompt: String,
    #[serde(default, alias = "sourceText")]
    pub(crate) source_text: Option<String>,
}

impl AssignmentCreate {
    pub(crate) fn into_draft(self) -> AssignmentDraft {
        AssignmentDraft {
            rubric_id: self.rubric_id,
            title: self.title,
            prompt: self.prompt,
            source_text: self.source_text,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct AssignmentUpdate {
    #[serde(default)]
    #[validate(length(min = 1, message = "title must not be empty"))]
    pub(crate) title: Option<String>,
    #[serde(default)]
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub(crate) prompt: Option<String>,
    #[serde(default, alias = "sourceText", deserialize_with = "deserialize_present")]
    pub(crate) source_text: Option<Option<String>>,
    #[serde(default, alias = "rubricId")]
    pub(crate) rubric_id: Option<Uuid>,
}

impl AssignmentUpdate {
    pub(crate) fn into_patch(self) -> AssignmentPatch {
        AssignmentPatch {
            title: self.title,
            prompt: self.prompt,
            source_text: self.source_text,
            rubric_id: self.rubric_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AssignmentResponse {
    pub(crate) id: Uuid,
    pub(crate) rubric_id: Uuid,
    pub(crate) title: String,
    pub(crate) prompt: String,
    pub(crate) source_text: Option<String>,
    pub(crate) status: AssignmentStatus,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<Assignment> for AssignmentResponse {
    fn from(assignment: Assignment) -> Self {
        Self {
            id: assignment.id,
            rubric_id: assignment.rubric_id,
            title: assignment.title,
            prompt: assignment.prompt,
            source_text: assignment.source_text,
            status: assignment.status,
            created_at: format_primitive(assignment.created_at),
            updated_at: format_primitive(assignment.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AssignmentListEntry {
    #[serde(flatten)]
    pub(crate) assignment: AssignmentResponse,
    pub(crate) essay_count: i64,
}

impl From<AssignmentListItem> for AssignmentListEntry {
    fn from(item: AssignmentListItem) -> Self {
        Self { assignment: AssignmentResponse::from(item.assignment), essay_count: item.essay_count }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EssayResponse {
    pub(crate) id: Uuid,
    pub(crate) assignment_id: Uuid,
    pub(crate) file_name: String,
    pub(crate) student_name: String,
    pub(crate) status: EssayStatus,
    pub(crate) attempt_count: i32,
    pub(crate) failure_kind: Option<FailureKind>,
    pub(crate) last_error: Option<String>,
    pub(crate) retryable: bool,
    pub(crate) content_purged: bool,
    pub(crate) graded_at: Option<String>,
    pub(crate) reviewed_at: Option<String>,
    pub(crate) delete_after: Option<String>,
    pub(crate) created_at: String,
}

impl From<Essay> for EssayResponse {
    fn from(essay: Essay) -> Self {
        Self {
            id: essay.id,
            assignment_id: essay.assignment_id,
            retryable: essay.status == EssayStatus::Failed,
            content_purged: essay.content_purged_at.is_some(),
            file_name: essay.file_name,
            student_name: essay.student_name,
            status: essay.status,
            attempt_count: essay.attempt_count,
            failure_kind: essay.failure_kind,
            last_error: essay.last_error,
            graded_at: format_optional(essay.graded_at),
            reviewed_at: format_optional(essay.reviewed_at),
            delete_after: format_optional(essay.delete_after),
            created_at: format_primitive(essay.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadResponse {
    pub(crate) created: Vec<EssayResponse>,
    pub(crate) skipped: Vec<SkippedEntry>,
}

impl From<IngestReport> for UploadResponse {
    fn from(report: IngestReport) -> Self {
        Self {
            created: report.created.into_iter().map(EssayResponse::from).collect(),
            skipped: report.skipped,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchResponse {
    pub(crate) assignment_id: Uuid,
    pub(crate) status: AssignmentStatus,
    pub(crate) pending: i64,
    pub(crate) resumed: bool,
}

impl From<BatchHandle> for BatchResponse {
    fn from(handle: BatchHandle) -> Self {
        Self {
            assignment_id: handle.assignment_id,
            status: handle.status,
            pending: handle.pending,
            resumed: handle.resumed,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusCountsResponse {
    pub(crate) total: i64,
    pub(crate) pending: i64,
    pub(crate) processing: i64,
    pub(crate) graded: i64,
    pub(crate) reviewed: i64,
    pub(crate) failed: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FailedEssayResponse {
    pub(crate) essay_id: Uuid,
    pub(crate) file_name: String,
    pub(crate) attempt_count: i32,
    pub(crate) failure_kind: Option<FailureKind>,
    pub(crate) last_error: Option<String>,
}

impl From<FailedEssay> for FailedEssayResponse {
    fn from(failed: FailedEssay) -> Self {
        Self {
            essay_id: failed.essay_id,
            file_name: failed.file_name,
            attempt_count: failed.attempt_count,
            failure_kind: failed.failure_kind,
            last_error: failed.last_error,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ProgressResponse {
    pub(crate) assignment_id: Uuid,
    pub(crate) status: AssignmentStatus,
    pub(crate) counts: StatusCountsResponse,
    pub(crate) failed: Vec<FailedEssayResponse>,
}

impl From<BatchProgress> for ProgressResponse {
    fn from(progress: BatchProgress) -> Self {
        let counts = progress.counts;
        Self {
            assignment_id: progress.assignment.id,
            status: progress.assignment.status,
            counts: StatusCountsResponse {
                total: counts.total(),
                pending: counts.pending,
                processing: counts.processing,
                graded: counts.graded,
                reviewed: counts.reviewed,
                failed: counts.failed,
            },
            failed: progress.failed.into_iter().map(FailedEssayResponse::from).collect(),
        }
    }
}
