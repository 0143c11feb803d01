use std::io::{Cursor, Read};

use serde::Serialize;
use tracing::info_span;

use super::{UploadWorkflow, CLAIM_ATTEMPTS};
use crate::error::{StorageError, ValidationError, WorkflowError};
use crate::identity::Submitter;
use crate::ledger::{record, PendingRecord};
use crate::resolver::join_relative;
use crate::sanitize;
use crate::sequence::Namespace;
use crate::validation::{self, SIGNATURE_WINDOW};

/// Above this many failures the report carries a grouped summary.
const SUMMARY_THRESHOLD: usize = 5;

/// One file of a submission request.
pub struct Submission<R> {
    /// Name as sent by the client; may include folder structure.
    pub desired_name: String,
    pub content: R,
}

impl<R: Read> Submission<R> {
    pub fn new(desired_name: impl Into<String>, content: R) -> Self {
        Self {
            desired_name: desired_name.into(),
            content,
        }
    }
}

impl Submission<Cursor<Vec<u8>>> {
    pub fn from_bytes(desired_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(desired_name, Cursor::new(bytes.into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredUpload {
    pub upload_id: u64,
    pub original_name: String,
    pub stored_name: String,
    pub logical_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DisallowedType,
    Malicious,
    InvalidPath,
    Upload,
}

impl FailureKind {
    fn of(error: &WorkflowError) -> Self {
        match error {
            WorkflowError::Validation(ValidationError::DisallowedExtension { .. }) => {
                FailureKind::DisallowedType
            }
            WorkflowError::Validation(ValidationError::ExecutableContent { .. }) => {
                FailureKind::Malicious
            }
            WorkflowError::Validation(ValidationError::PathTraversal { .. }) => {
                FailureKind::InvalidPath
            }
            _ => FailureKind::Upload,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FailureKind::DisallowedType => "file type not allowed",
            FailureKind::Malicious => "malicious file detected",
            FailureKind::InvalidPath => "invalid path",
            FailureKind::Upload => "upload failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitFailure {
    pub file_name: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Per-file outcome of a batch submission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitReport {
    pub stored: Vec<StoredUpload>,
    pub errors: Vec<SubmitFailure>,
}

impl SubmitReport {
    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Failures grouped by kind and extension, once there are too many to
    /// list individually.
    pub fn summary(&self) -> Option<String> {
        if self.errors.len() <= SUMMARY_THRESHOLD {
            return None;
        }

        let mut groups: Vec<(FailureKind, String, usize)> = Vec::new();
        for failure in &self.errors {
            let ext = validation::extension_of(&failure.file_name)
                .map(|ext| ext.to_ascii_lowercase())
                .unwrap_or_default();
            match groups
                .iter_mut()
                .find(|(kind, e, _)| *kind == failure.kind && *e == ext)
            {
                Some((_, _, count)) => *count += 1,
                None => groups.push((failure.kind, ext, 1)),
            }
        }

        let lines: Vec<String> = groups
            .into_iter()
            .map(|(kind, ext, count)| {
                if ext.is_empty() {
                    format!("{} file(s) without extension ({})", count, kind.describe())
                } else {
                    format!("{} file(s) with .{} extension ({})", count, ext, kind.describe())
                }
            })
            .collect();
        Some(format!("Failed file types:\n{}", lines.join("\n")))
    }
}

/// Reads up to `SIGNATURE_WINDOW` bytes without assuming a single read fills
/// the buffer.
fn read_head<R: Read>(content: &mut R, name: &str) -> Result<Vec<u8>, ValidationError> {
    let mut head = Vec::with_capacity(SIGNATURE_WINDOW);
    content
        .by_ref()
        .take(SIGNATURE_WINDOW as u64)
        .read_to_end(&mut head)
        .map_err(|e| ValidationError::UnreadableStream {
            name: name.to_string(),
            source: e,
        })?;
    Ok(head)
}

impl UploadWorkflow {
    /// Submits every file independently; one file failing does not stop the
    /// others.
    ///
    /// Fails as a whole only when there is nothing to submit or the target
    /// subpath itself is invalid.
    pub fn submit_batch<R: Read>(
        &self,
        submitter: &Submitter,
        target_subpath: &str,
        files: Vec<Submission<R>>,
    ) -> Result<SubmitReport, WorkflowError> {
        if files.iter().all(|file| file.desired_name.trim().is_empty()) {
            return Err(ValidationError::EmptySubmission.into());
        }
        let subpath = validation::clean_relative_path(target_subpath).ok_or_else(|| {
            ValidationError::PathTraversal {
                name: target_subpath.to_string(),
            }
        })?;

        log::info!(
            "Upload request: {} file(s) from {}",
            files.len(),
            sanitize::mask_identity(&submitter.identity)
        );

        let mut report = SubmitReport::default();
        for file in files {
            if file.desired_name.trim().is_empty() {
                continue;
            }
            let name = file.desired_name.clone();
            match self.submit(submitter, &subpath, file) {
                Ok(stored) => report.stored.push(stored),
                Err(e) => {
                    log::warn!("Rejected upload {}: {}", name, e);
                    report.errors.push(SubmitFailure {
                        kind: FailureKind::of(&e),
                        message: e.to_string(),
                        file_name: name,
                    });
                }
            }
        }

        log::info!(
            "Upload completed: {} stored, {} failed",
            report.stored.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Validates, stores and records a single file as pending.
    pub fn submit<R: Read>(
        &self,
        submitter: &Submitter,
        target_subpath: &str,
        submission: Submission<R>,
    ) -> Result<StoredUpload, WorkflowError> {
        let Submission {
            desired_name,
            mut content,
        } = submission;
        let _span = info_span!("submit",
            file = %sanitize::redact_path(std::path::Path::new(&desired_name)),
            submitter = %sanitize::mask_identity(&submitter.identity),
        )
        .entered();

        self.policy.check_extension(&desired_name)?;
        let head = read_head(&mut content, &desired_name)?;
        if validation::looks_executable(&head) {
            return Err(ValidationError::ExecutableContent {
                name: desired_name,
            }
            .into());
        }
        validation::check_traversal(&desired_name)?;
        let target_subpath = validation::clean_relative_path(target_subpath).ok_or_else(|| {
            ValidationError::PathTraversal {
                name: target_subpath.to_string(),
            }
        })?;
        let target_subpath = target_subpath.as_str();

        let mut stream = Cursor::new(head).chain(content);
        let (resolved, size) = self.claim_staging_name(&desired_name, target_subpath, &mut stream)?;

        let upload_id = match self.sequences.next_id(Namespace::Uploads) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.storage.remove(&resolved.stored_path);
                return Err(e.into());
            }
        };

        let row = PendingRecord {
            upload_id,
            submitted_at: record::now(),
            submitter: submitter.identity.clone(),
            user_id: submitter.user_id,
            stored_name: resolved.stored_name.clone(),
            logical_path: join_relative(&[target_subpath, &resolved.logical_path]),
        };
        let logical_path = row.logical_path.clone();
        if let Err(e) = self.ledger.append(row) {
            let _ = self.storage.remove(&resolved.stored_path);
            return Err(e.into());
        }

        log::info!(
            "Stored upload {} as {} ({} bytes)",
            upload_id,
            resolved.stored_name,
            size
        );
        Ok(StoredUpload {
            upload_id,
            original_name: desired_name,
            stored_name: resolved.stored_name,
            logical_path,
            size,
        })
    }

    /// Resolves a free staging name and creates the file exclusively,
    /// resolving again when a concurrent request took the name first.
    fn claim_staging_name<R: Read>(
        &self,
        desired_name: &str,
        target_subpath: &str,
        stream: &mut R,
    ) -> Result<(crate::resolver::ResolvedName, u64), WorkflowError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let resolved = self.resolver.for_submission(desired_name, target_subpath)?;
            if let Some(size) = self.storage.store_new(&resolved.stored_path, stream)? {
                return Ok((resolved, size));
            }
            log::debug!("{} was claimed concurrently, resolving again", resolved.stored_name);
        }
        Err(StorageError::NameExhausted(self.storage.staging_path(desired_name)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{fixture, member};

    #[test]
    fn test_submit_records_pending_row() {
        let (dir, workflow) = fixture();

        let stored = workflow
            .submit(&member(), "", Submission::from_bytes("report.pdf", b"%PDF-1.7".to_vec()))
            .unwrap();

        assert_eq!(stored.upload_id, 1);
        assert_eq!(stored.stored_name, "report.pdf");
        assert_eq!(stored.size, 8);
        assert_eq!(
            std::fs::read(dir.path().join("staging/report.pdf")).unwrap(),
            b"%PDF-1.7"
        );

        let rows = workflow.ledger().scan::<PendingRecord>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].upload_id, 1);
        assert_eq!(rows[0].submitter, "member@example.com");
        assert_eq!(rows[0].user_id, Some(7));
        assert_eq!(rows[0].logical_path, "report.pdf");
    }

    #[test]
    fn test_large_stream_is_stored_whole() {
        let (dir, workflow) = fixture();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8 + 1).collect();
        // Ensure the content does not start with a signature.
        let mut content = content;
        content[0] = b'x';

        let stored = workflow
            .submit(&member(), "", Submission::from_bytes("big.zip", content.clone()))
            .unwrap();

        assert_eq!(stored.size, 10_000);
        assert_eq!(std::fs::read(dir.path().join("staging/big.zip")).unwrap(), content);
    }

    #[test]
    fn test_logical_path_includes_subpath_and_folders() {
        let (_dir, workflow) = fixture();

        let stored = workflow
            .submit(
                &member(),
                "/courses/",
                Submission::from_bytes("week1/notes.txt", b"notes".to_vec()),
            )
            .unwrap();

        assert_eq!(stored.stored_name, "notes.txt");
        assert_eq!(stored.logical_path, "courses/week1/notes.txt");
    }

    #[test]
    fn test_rejections_leave_no_trace() {
        let (dir, workflow) = fixture();

        let exe = workflow.submit(&member(), "", Submission::from_bytes("tool.exe", b"MZ".to_vec()));
        assert!(matches!(
            exe,
            Err(WorkflowError::Validation(ValidationError::DisallowedExtension { .. }))
        ));

        let disguised = workflow.submit(
            &member(),
            "",
            Submission::from_bytes("invoice.pdf", b"MZ\x90\x00".to_vec()),
        );
        assert!(matches!(
            disguised,
            Err(WorkflowError::Validation(ValidationError::ExecutableContent { .. }))
        ));

        let escape = workflow.submit(
            &member(),
            "",
            Submission::from_bytes("../../etc/passwd.txt", b"x".to_vec()),
        );
        assert!(matches!(
            escape,
            Err(WorkflowError::Validation(ValidationError::PathTraversal { .. }))
        ));

        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);
    }

    #[test]
    fn test_batch_partial_success() {
        let (_dir, workflow) = fixture();
        let files = vec![
            Submission::from_bytes("a.txt", b"a".to_vec()),
            Submission::from_bytes("b.exe", b"b".to_vec()),
            Submission::from_bytes("", b"".to_vec()),
            Submission::from_bytes("c.txt", b"c".to_vec()),
        ];

        let report = workflow.submit_batch(&member(), "", files).unwrap();

        assert_eq!(report.stored.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file_name, "b.exe");
        assert_eq!(report.errors[0].kind, FailureKind::DisallowedType);
        assert!(!report.is_complete_success());
        assert!(report.summary().is_none());

        let ids: Vec<u64> = report.stored.iter().map(|s| s.upload_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let (_dir, workflow) = fixture();

        let none: Vec<Submission<Cursor<Vec<u8>>>> = Vec::new();
        assert!(matches!(
            workflow.submit_batch(&member(), "", none),
            Err(WorkflowError::Validation(ValidationError::EmptySubmission))
        ));

        let unnamed = vec![Submission::from_bytes("", b"x".to_vec())];
        assert!(matches!(
            workflow.submit_batch(&member(), "", unnamed),
            Err(WorkflowError::Validation(ValidationError::EmptySubmission))
        ));
    }

    #[test]
    fn test_escaping_subpath_rejects_batch() {
        let (_dir, workflow) = fixture();
        let files = vec![Submission::from_bytes("a.txt", b"a".to_vec())];

        assert!(matches!(
            workflow.submit_batch(&member(), "../outside", files),
            Err(WorkflowError::Validation(ValidationError::PathTraversal { .. }))
        ));
    }

    #[test]
    fn test_single_submit_rejects_escaping_subpath() {
        let (dir, workflow) = fixture();

        let result = workflow.submit(
            &member(),
            "../../escape",
            Submission::from_bytes("a.txt", b"a".to_vec()),
        );

        assert!(matches!(
            result,
            Err(WorkflowError::Validation(ValidationError::PathTraversal { .. }))
        ));
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);
        assert!(!dir.path().join("escape").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_single_submit_normalizes_subpath() {
        let (_dir, workflow) = fixture();

        let stored = workflow
            .submit(&member(), "/courses//./week1/", Submission::from_bytes("a.txt", b"a".to_vec()))
            .unwrap();

        let row = workflow
            .ledger()
            .find_by_id::<PendingRecord>(stored.upload_id)
            .unwrap()
            .unwrap();
        assert_eq!(row.logical_path, "courses/week1/a.txt");
    }

    #[test]
    fn test_summary_groups_by_kind_and_extension() {
        let (_dir, workflow) = fixture();
        let mut files = Vec::new();
        for i in 0..3 {
            files.push(Submission::from_bytes(format!("tool{}.exe", i), b"x".to_vec()));
        }
        for i in 0..2 {
            files.push(Submission::from_bytes(format!("fake{}.pdf", i), b"\x7fELF".to_vec()));
        }
        files.push(Submission::from_bytes("script", b"#!/bin/sh".to_vec()));

        let report = workflow.submit_batch(&member(), "", files).unwrap();

        assert_eq!(report.errors.len(), 6);
        let summary = report.summary().unwrap();
        assert!(summary.starts_with("Failed file types:"));
        assert!(summary.contains("3 file(s) with .exe extension (file type not allowed)"));
        assert!(summary.contains("2 file(s) with .pdf extension (malicious file detected)"));
        assert!(summary.contains("1 file(s) without extension (file type not allowed)"));
    }
}
