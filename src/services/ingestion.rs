use std::collections::HashSet;
use std::io::{Cursor, Read};

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::state::AppState;
use crate::db::models::Essay;
use crate::db::types::EssayStatus;
use crate::services::assignments;
use crate::services::errors::ServiceError;

const ARTIFACT_FILE_NAMES: [&str; 2] = ["thumbs.db", "desktop.ini"];

#[derive(Debug, Clone)]
pub(crate) struct UploadedFile {
    pub(crate) name: String,
    pub(crate) content_type: Option<String>,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SkipReason {
    SystemArtifact,
    UnsupportedFileType,
    EmptyFile,
    FileTooLarge,
    DuplicateContent,
    CorruptArchive,
}

impl SkipReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::SystemArtifact => "system_artifact",
            Self::UnsupportedFileType => "unsupported_file_type",
            Self::EmptyFile => "empty_file",
            Self::FileTooLarge => "file_too_large",
            Self::DuplicateContent => "duplicate_content",
            Self::CorruptArchive => "corrupt_archive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SkippedEntry {
    pub(crate) name: String,
    pub(crate) reason: SkipReason,
}

#[derive(Debug, Clone)]
pub(crate) struct IngestReport {
    pub(crate) created: Vec<Essay>,
    pub(crate) skipped: Vec<SkippedEntry>,
}

/// One file that survived archive expansion, before content checks.
#[derive(Debug)]
struct Candidate {
    path: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct UploadLimits {
    max_file_bytes: u64,
    max_files: usize,
    max_total_bytes: u64,
}

/// Running totals for one upload, charged before an archive entry is inflated.
#[derive(Debug)]
struct Budget {
    limits: UploadLimits,
    files: usize,
    bytes: u64,
}

impl Budget {
    fn new(limits: UploadLimits) -> Self {
        Self { limits, files: 0, bytes: 0 }
    }

    fn charge_file(&mut self) -> Result<(), ServiceError> {
        self.files += 1;
        if self.files > self.limits.max_files {
            return Err(ServiceError::validation(format!(
                "too many files in one upload (limit {})",
                self.limits.max_files
            )));
        }
        Ok(())
    }

    fn charge_bytes(&mut self, len: usize) -> Result<(), ServiceError> {
        self.bytes = self.bytes.saturating_add(len as u64);
        if self.bytes > self.limits.max_total_bytes {
            return Err(ServiceError::validation(format!(
                "upload expands beyond {} bytes",
                self.limits.max_total_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Admitted {
    path: String,
    file_name: String,
    extension: String,
    hash: String,
    bytes: Vec<u8>,
}

/// True for OS and archiver metadata that never holds an essay.
pub(crate) fn is_system_artifact(path: &str) -> bool {
    let components: Vec<&str> =
        path.split(['/', '\\']).filter(|component| !component.is_empty()).collect();

    if components.is_empty() {
        return true;
    }

    if components.iter().any(|component| component.starts_with('.') || *component == "__MACOSX") {
        return true;
    }

    components
        .last()
        .is_some_and(|name| ARTIFACT_FILE_NAMES.contains(&name.to_ascii_lowercase().as_str()))
}

pub(crate) fn sanitized_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-')
        .collect();

    if sanitized.is_empty() {
        "upload".to_string()
    } else {
        sanitized
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).find(|part| !part.is_empty()).unwrap_or(path)
}

fn extension_of(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// `alice_essay.pdf` becomes `alice_essay`.
pub(crate) fn student_name_from(file_name: &str) -> String {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    stem.trim().to_string()
}

pub(crate) fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_archive(file: &UploadedFile) -> bool {
    extension_of(base_name(&file.name)).as_deref() == Some("zip")
        || matches!(
            file.content_type.as_deref(),
            Some("application/zip" | "application/x-zip-compressed")
        )
}

fn expand_archive(
    file: UploadedFile,
    budget: &mut Budget,
    candidates: &mut Vec<Candidate>,
    skipped: &mut Vec<SkippedEntry>,
) -> Result<(), ServiceError> {
    let max_bytes = budget.limits.max_file_bytes;
    let mut archive = match zip::ZipArchive::new(Cursor::new(file.bytes)) {
        Ok(archive) => archive,
        Err(err) => {
            tracing::warn!(error = %err, archive = %file.name, "Unreadable zip upload");
            skipped.push(SkippedEntry { name: file.name, reason: SkipReason::CorruptArchive });
            return Ok(());
        }
    };

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, archive = %file.name, index, "Unreadable zip entry");
                skipped.push(SkippedEntry {
                    name: format!("{}#{index}", file.name),
                    reason: SkipReason::CorruptArchive,
                });
                continue;
            }
        };

        let path = entry.name().to_string();
        if entry.is_dir() || is_system_artifact(&path) {
            skipped.push(SkippedEntry { name: path, reason: SkipReason::SystemArtifact });
            continue;
        }
        budget.charge_file()?;
        if entry.size() > max_bytes {
            skipped.push(SkippedEntry { name: path, reason: SkipReason::FileTooLarge });
            continue;
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        let read = (&mut entry).take(max_bytes + 1).read_to_end(&mut bytes);
        match read {
            Ok(_) if bytes.len() as u64 > max_bytes => {
                skipped.push(SkippedEntry { name: path, reason: SkipReason::FileTooLarge });
            }
            Ok(_) => {
                budget.charge_bytes(bytes.len())?;
                candidates.push(Candidate { path, bytes });
            }
            Err(err) => {
                tracing::warn!(error = %err, archive = %file.name, entry = %path, "Failed to inflate zip entry");
                skipped.push(SkippedEntry { name: path, reason: SkipReason::CorruptArchive });
            }
        }
    }

    Ok(())
}

/// Splits uploads into admissible files and skipped entries. Pure, so it runs before any
/// state changes. Fails as a whole once the upload exceeds its file count or byte budget.
fn screen(
    files: Vec<UploadedFile>,
    allowed_extensions: &[String],
    limits: UploadLimits,
    existing_hashes: &HashSet<String>,
) -> Result<(Vec<Admitted>, Vec<SkippedEntry>), ServiceError> {
    let max_bytes = limits.max_file_bytes;
    let mut budget = Budget::new(limits);
    let mut candidates = Vec::new();
    let mut skipped = Vec::new();

    for file in files {
        if is_system_artifact(&file.name) {
            skipped.push(SkippedEntry { name: file.name, reason: SkipReason::SystemArtifact });
        } else if is_archive(&file) {
            expand_archive(file, &mut budget, &mut candidates, &mut skipped)?;
        } else {
            budget.charge_file()?;
            budget.charge_bytes(file.bytes.len())?;
            candidates.push(Candidate { path: file.name, bytes: file.bytes });
        }
    }

    let mut seen = existing_hashes.clone();
    let mut admitted = Vec::new();
    for candidate in candidates {
        let file_name = base_name(&candidate.path).to_string();
        let Some(extension) = extension_of(&file_name)
            .filter(|extension| allowed_extensions.iter().any(|allowed| allowed == extension))
        else {
            skipped.push(SkippedEntry {
                name: candidate.path,
                reason: SkipReason::UnsupportedFileType,
            });
            continue;
        };

        if candidate.bytes.is_empty() {
            skipped.push(SkippedEntry { name: candidate.path, reason: SkipReason::EmptyFile });
            continue;
        }
        if candidate.bytes.len() as u64 > max_bytes {
            skipped.push(SkippedEntry { name: candidate.path, reason: SkipReason::FileTooLarge });
            continue;
        }

        let hash = hex::encode(Sha256::digest(&candidate.bytes));
        if !seen.insert(hash.clone()) {
            skipped
                .push(SkippedEntry { name: candidate.path, reason: SkipReason::DuplicateContent });
            continue;
        }

        admitted.push(Admitted {
            path: candidate.path,
            file_name,
            extension,
            hash,
            bytes: candidate.bytes,
        });
    }

    Ok((admitted, skipped))
}

/// Turns uploaded files (and the contents of zip archives) into pending essays.
///
/// Nothing is persisted unless at least one entry is admitted. Stored files are removed
/// again when the essay insert fails.
pub(crate) async fn ingest(
    state: &AppState,
    owner_id: Uuid,
    assignment_id: Uuid,
    files: Vec<UploadedFile>,
) -> Result<IngestReport, ServiceError> {
    let assignment = assignments::get_assignment(state, owner_id, assignment_id).await?;
    if !assignment.status.accepts_uploads() {
        return Err(ServiceError::Conflict(format!(
            "assignment in status {} no longer accepts essays",
            assignment.status.as_str()
        )));
    }

    if files.is_empty() {
        return Err(ServiceError::validation("no files uploaded"));
    }

    let single_plain_file = files.len() == 1 && !is_archive(&files[0]);
    let storage_settings = state.settings().storage();
    let existing: HashSet<String> =
        state.store().content_hashes(assignment_id).await?.into_iter().collect();

    let limits = UploadLimits {
        max_file_bytes: storage_settings.max_upload_bytes(),
        max_files: storage_settings.max_files_per_upload,
        max_total_bytes: storage_settings.max_total_upload_bytes(),
    };
    let (admitted, skipped) =
        screen(files, &storage_settings.allowed_extensions, limits, &existing)?;

    for entry in &skipped {
        metrics::counter!("essays_skipped_total", "reason" => entry.reason.as_str()).increment(1);
    }

    if admitted.is_empty() {
        if single_plain_file {
            if let Some(entry) =
                skipped.iter().find(|entry| entry.reason == SkipReason::UnsupportedFileType)
            {
                return Err(ServiceError::UnsupportedFileType(entry.name.clone()));
            }
        }
        return Err(ServiceError::Validation {
            message: "no essay files could be admitted".to_string(),
            skipped,
        });
    }

    let storage =
        state.storage().ok_or(ServiceError::Unavailable("object storage is not configured"))?;

    let now = state.now();
    let mut essays = Vec::with_capacity(admitted.len());
    for file in admitted {
        let essay_id = Uuid::new_v4();
        let key = format!(
            "essays/{}/{}_{}",
            assignment_id,
            essay_id,
            sanitized_filename(&file.file_name)
        );
        let content_type = content_type_for(&file.extension);

        if let Err(err) = storage.put(&key, content_type, file.bytes).await {
            remove_blobs(state, &essays).await;
            tracing::error!(error = %err, %assignment_id, entry = %file.path, "Failed to store essay file");
            return Err(ServiceError::Store(err));
        }

        essays.push(Essay {
            id: essay_id,
            assignment_id,
            owner_id,
            student_name: student_name_from(&file.file_name),
            file_name: file.file_name,
            content_type: content_type.to_string(),
            storage_key: Some(key),
            content_hash: file.hash,
            extracted_text: None,
            status: EssayStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            lease_id: None,
            claimed_at: None,
            last_error: None,
            failure_kind: None,
            graded_at: None,
            reviewed_at: None,
            delete_after: None,
            content_purged_at: None,
            created_at: now,
            updated_at: now,
        });
    }

    if let Err(err) = state.store().insert_essays(&essays).await {
        remove_blobs(state, &essays).await;
        return Err(err.into());
    }

    metrics::counter!("essays_ingested_total").increment(essays.len() as u64);
    tracing::info!(
        %owner_id,
        %assignment_id,
        created = essays.len(),
        skipped = skipped.len(),
        "Essays ingested"
    );

    Ok(IngestReport { created: essays, skipped })
}

async fn remove_blobs(state: &AppState, essays: &[Essay]) {
    let Some(storage) = state.storage() else {
        return;
    };
    for key in essays.iter().filter_map(|essay| essay.storage_key.as_deref()) {
        if let Err(err) = storage.delete(key).await {
            tracing::warn!(error = %err, storage_key = key, "Failed to remove orphaned essay file");
        }
    }
}
