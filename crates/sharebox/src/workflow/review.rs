use std::path::Path;

use tracing::info_span;

use super::{UploadRef, UploadWorkflow, CLAIM_ATTEMPTS};
use crate::error::{StorageError, ValidationError, WorkflowError};
use crate::ledger::{record, CompletedRecord, DeclinedRecord, PendingRecord};
use crate::resolver::{join_relative, split_name, ResolvedName};
use crate::validation;

/// Maps a vanished move source onto `NotFound`.
fn not_found_on_missing_source(error: StorageError, target: &str) -> WorkflowError {
    match error {
        StorageError::MoveFile { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            WorkflowError::NotFound {
                target: target.to_string(),
            }
        }
        other => other.into(),
    }
}

impl UploadWorkflow {
    /// Turns a caller-supplied destination into a path relative to the
    /// destination root, appending `file_name` when it designates a folder.
    fn destination_target(&self, raw: &str, file_name: &str) -> Result<String, WorkflowError> {
        let cleaned = validation::clean_relative_path(raw).ok_or_else(|| {
            ValidationError::PathTraversal {
                name: raw.to_string(),
            }
        })?;

        let names_folder = cleaned.is_empty()
            || raw.trim_end().ends_with(['/', '\\'])
            || self.storage.destination_path(&cleaned).is_dir();
        if names_folder {
            Ok(join_relative(&[&cleaned, file_name]))
        } else {
            Ok(cleaned)
        }
    }

    /// Moves `source` to a free variant of `relative` in the destination
    /// tree.
    ///
    /// The chosen name is reserved with an exclusive create before the move,
    /// so two placements racing for the same path end up on different names.
    fn place(&self, source: &Path, relative: &str, target: &str) -> Result<ResolvedName, WorkflowError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let resolved = self.resolver.in_destination(relative)?;
            if !self.storage.reserve(&resolved.stored_path)? {
                log::debug!("{} was claimed concurrently, resolving again", resolved.logical_path);
                continue;
            }
            if let Err(e) = self.storage.relocate(source, &resolved.stored_path) {
                let _ = self.storage.remove(&resolved.stored_path);
                return Err(not_found_on_missing_source(e, target));
            }
            return Ok(resolved);
        }
        Err(StorageError::NameExhausted(self.storage.destination_path(relative)).into())
    }

    /// Moves a pending upload into the destination tree.
    ///
    /// `destination` is the file's path relative to the destination root;
    /// `"A/B"` stores the file under the name `B`, while `"A/B/"` (or an
    /// existing folder `A/B`) places it inside that folder under its own
    /// name. `None` uses the path suggested at submission. The final path
    /// gets a numeric suffix if something already lives there.
    pub fn approve(
        &self,
        target: &UploadRef,
        destination: Option<&str>,
    ) -> Result<CompletedRecord, WorkflowError> {
        let _span = info_span!("approve", target = %target).entered();

        let pending = self
            .lookup_pending(target)?
            .ok_or_else(|| WorkflowError::NotFound {
                target: target.to_string(),
            })?;

        let source = self.storage.staging_path(&pending.stored_name);
        if std::fs::symlink_metadata(&source).is_err() {
            log::warn!("Approve failed, staged file {} is missing", pending.stored_name);
            return Err(WorkflowError::NotFound {
                target: pending.stored_name,
            });
        }

        let (_, logical_name) = split_name(&pending.logical_path);
        let file_name = if logical_name.is_empty() {
            pending.stored_name.as_str()
        } else {
            logical_name
        };
        let requested = destination.unwrap_or(&pending.logical_path);
        let relative = self.destination_target(requested, file_name)?;
        let resolved = self.place(&source, &relative, &pending.stored_name)?;

        if self.ledger.remove::<PendingRecord>(pending.upload_id)?.is_none() {
            // A concurrent decline retired the row after the move.
            log::warn!(
                "Upload {} left the pending ledger during approval",
                pending.upload_id
            );
            if let Err(e) = self.storage.relocate(&resolved.stored_path, &source) {
                log::error!(
                    "Failed to return {} to staging: {}",
                    resolved.logical_path,
                    e
                );
            }
            return Err(WorkflowError::NotFound {
                target: target.to_string(),
            });
        }

        let completed = CompletedRecord {
            upload_id: pending.upload_id,
            submitted_at: pending.submitted_at,
            approved_at: record::now(),
            submitter: pending.submitter,
            user_id: pending.user_id,
            stored_name: pending.stored_name,
            final_path: resolved.logical_path,
        };
        self.ledger.append(completed.clone())?;

        log::info!(
            "Approved upload {} to {}",
            completed.upload_id,
            completed.final_path
        );
        Ok(completed)
    }

    /// Deletes a pending upload and records it as declined.
    ///
    /// When the staged file is already gone the pending row is still retired
    /// to the declined ledger, and the call reports `AlreadyRemoved`.
    pub fn decline(&self, target: &UploadRef) -> Result<DeclinedRecord, WorkflowError> {
        let _span = info_span!("decline", target = %target).entered();

        let Some(pending) = self.lookup_pending(target)? else {
            log::warn!("Decline found no pending upload for {}", target);
            return Err(WorkflowError::AlreadyRemoved {
                target: target.to_string(),
            });
        };

        let deleted = self
            .storage
            .remove(&self.storage.staging_path(&pending.stored_name))?;

        let Some(pending) = self.ledger.remove::<PendingRecord>(pending.upload_id)? else {
            log::warn!(
                "Upload {} left the pending ledger during decline",
                pending.upload_id
            );
            return Err(WorkflowError::AlreadyRemoved {
                target: target.to_string(),
            });
        };

        let declined = DeclinedRecord {
            declined_at: record::now(),
            submitter: pending.submitter,
            user_id: pending.user_id,
            stored_name: pending.stored_name,
        };
        self.ledger.append(declined.clone())?;

        if !deleted {
            log::warn!("Declined upload {} had no staged file", pending.upload_id);
            return Err(WorkflowError::AlreadyRemoved {
                target: declined.stored_name,
            });
        }

        log::info!("Declined upload {} ({})", pending.upload_id, declined.stored_name);
        Ok(declined)
    }

    /// Moves an approved upload within the destination tree and rewrites
    /// its completed row in place. `new_path` follows the same file-or-folder
    /// rules as the approve destination.
    pub fn relocate(&self, upload_id: u64, new_path: &str) -> Result<CompletedRecord, WorkflowError> {
        let _span = info_span!("relocate", upload_id).entered();
        let target = format!("#{}", upload_id);

        let completed = self
            .ledger
            .find_by_id::<CompletedRecord>(upload_id)?
            .ok_or_else(|| WorkflowError::NotFound {
                target: target.clone(),
            })?;

        let relative = self.destination_target(new_path, completed.file_name())?;
        if relative == completed.final_path {
            return Ok(completed);
        }

        let current = self.storage.destination_path(&completed.final_path);
        let resolved = self.place(&current, &relative, &completed.final_path)?;

        let final_path = resolved.logical_path.clone();
        let Some(updated) = self
            .ledger
            .update::<CompletedRecord, _>(upload_id, |row| row.final_path = final_path)?
        else {
            if let Err(e) = self.storage.relocate(&resolved.stored_path, &current) {
                log::error!("Failed to move {} back: {}", resolved.logical_path, e);
            }
            return Err(WorkflowError::NotFound { target });
        };

        log::info!(
            "Relocated upload {} from {} to {}",
            upload_id,
            completed.final_path,
            updated.final_path
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{fixture, member};
    use crate::workflow::Submission;

    fn submit(workflow: &UploadWorkflow, name: &str) -> u64 {
        workflow
            .submit(&member(), "", Submission::from_bytes(name, b"content".to_vec()))
            .unwrap()
            .upload_id
    }

    #[test]
    fn test_approve_moves_file_and_row() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "report.pdf");

        let completed = workflow.approve(&UploadRef::Id(id), Some("A/B/")).unwrap();

        assert_eq!(completed.upload_id, id);
        assert_eq!(completed.final_path, "A/B/report.pdf");
        assert!(completed.approved_at >= completed.submitted_at);
        assert!(dir.path().join("share/A/B/report.pdf").exists());
        assert!(!dir.path().join("staging/report.pdf").exists());
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);

        let rows = workflow.ledger().scan::<CompletedRecord>().unwrap();
        assert_eq!(rows, vec![completed]);
    }

    #[test]
    fn test_approve_existing_folder_appends_name() {
        let (dir, workflow) = fixture();
        std::fs::create_dir_all(dir.path().join("share/A/B")).unwrap();
        let id = submit(&workflow, "report.pdf");

        let completed = workflow.approve(&UploadRef::Id(id), Some("/A/B")).unwrap();
        assert_eq!(completed.final_path, "A/B/report.pdf");
    }

    #[test]
    fn test_approve_defaults_to_suggested_path() {
        let (dir, workflow) = fixture();
        let stored = workflow
            .submit(
                &member(),
                "courses",
                Submission::from_bytes("week1/notes.txt", b"n".to_vec()),
            )
            .unwrap();

        let completed = workflow.approve(&UploadRef::Id(stored.upload_id), None).unwrap();

        assert_eq!(completed.final_path, "courses/week1/notes.txt");
        assert!(dir.path().join("share/courses/week1/notes.txt").exists());
    }

    #[test]
    fn test_approve_resolves_destination_collision() {
        let (dir, workflow) = fixture();
        std::fs::create_dir_all(dir.path().join("share/docs")).unwrap();
        std::fs::write(dir.path().join("share/docs/a.txt"), b"old").unwrap();
        let id = submit(&workflow, "a.txt");

        let completed = workflow.approve(&UploadRef::Id(id), Some("docs/a.txt")).unwrap();

        assert_eq!(completed.final_path, "docs/a_1.txt");
        assert_eq!(std::fs::read(dir.path().join("share/docs/a.txt")).unwrap(), b"old");
        assert_eq!(
            std::fs::read(dir.path().join("share/docs/a_1.txt")).unwrap(),
            b"content"
        );
    }

    #[test]
    fn test_approve_by_name() {
        let (_dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");

        let completed = workflow
            .approve(&UploadRef::Name("a.txt".to_string()), Some("x/"))
            .unwrap();
        assert_eq!(completed.upload_id, id);
    }

    #[test]
    fn test_approve_rejects_escaping_destination() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");

        let result = workflow.approve(&UploadRef::Id(id), Some("../../etc/a.txt"));

        assert!(matches!(
            result,
            Err(WorkflowError::Validation(ValidationError::PathTraversal { .. }))
        ));
        assert!(dir.path().join("staging/a.txt").exists());
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 1);
    }

    #[test]
    fn test_approve_missing_file_is_not_found() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");
        std::fs::remove_file(dir.path().join("staging/a.txt")).unwrap();

        let err = workflow.approve(&UploadRef::Id(id), None).unwrap_err();

        assert!(matches!(err, WorkflowError::NotFound { .. }));
        assert!(err.is_not_found());
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 1);
        assert_eq!(workflow.ledger().count::<CompletedRecord>().unwrap(), 0);
    }

    #[test]
    fn test_approve_unknown_id_is_not_found() {
        let (_dir, workflow) = fixture();
        assert!(matches!(
            workflow.approve(&UploadRef::Id(99), None),
            Err(WorkflowError::NotFound { .. })
        ));
    }

    #[test]
    fn test_decline_deletes_file_and_logs() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");

        let declined = workflow.decline(&UploadRef::Id(id)).unwrap();

        assert_eq!(declined.stored_name, "a.txt");
        assert_eq!(declined.user_id, Some(7));
        assert!(!dir.path().join("staging/a.txt").exists());
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);
        assert_eq!(workflow.ledger().count::<DeclinedRecord>().unwrap(), 1);

        let again = workflow.decline(&UploadRef::Id(id)).unwrap_err();
        assert!(matches!(again, WorkflowError::AlreadyRemoved { .. }));
        assert_eq!(workflow.ledger().count::<DeclinedRecord>().unwrap(), 1);
    }

    #[test]
    fn test_decline_vanished_file_retires_row() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");
        std::fs::remove_file(dir.path().join("staging/a.txt")).unwrap();

        let err = workflow.decline(&UploadRef::Id(id)).unwrap_err();

        assert!(matches!(err, WorkflowError::AlreadyRemoved { .. }));
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);
        assert_eq!(workflow.ledger().count::<DeclinedRecord>().unwrap(), 1);
    }

    #[test]
    fn test_declined_upload_cannot_be_approved() {
        let (_dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");
        workflow.decline(&UploadRef::Id(id)).unwrap();

        assert!(matches!(
            workflow.approve(&UploadRef::Id(id), None),
            Err(WorkflowError::NotFound { .. })
        ));
        assert_eq!(workflow.ledger().count::<CompletedRecord>().unwrap(), 0);
    }

    #[test]
    fn test_ambiguous_name_requires_id() {
        let (dir, workflow) = fixture();
        submit(&workflow, "a.txt");
        // Another pending row suggesting the same logical path.
        std::fs::write(dir.path().join("staging/b.txt"), b"b").unwrap();
        workflow
            .ledger()
            .append(PendingRecord {
                upload_id: 50,
                submitted_at: record::now(),
                submitter: "other@example.com".to_string(),
                user_id: None,
                stored_name: "b.txt".to_string(),
                logical_path: "a.txt".to_string(),
            })
            .unwrap();

        let err = workflow
            .decline(&UploadRef::Name("a.txt".to_string()))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Ambiguous { matches: 2, .. }));
        assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 2);
    }

    #[test]
    fn test_relocate_moves_and_rewrites_row() {
        let (dir, workflow) = fixture();
        let first = submit(&workflow, "a.txt");
        let second = submit(&workflow, "b.txt");
        workflow.approve(&UploadRef::Id(first), Some("old/")).unwrap();
        workflow.approve(&UploadRef::Id(second), Some("old/")).unwrap();

        let updated = workflow.relocate(first, "/new/place/").unwrap();

        assert_eq!(updated.final_path, "new/place/a.txt");
        assert!(dir.path().join("share/new/place/a.txt").exists());
        assert!(!dir.path().join("share/old/a.txt").exists());

        let rows = workflow.ledger().scan::<CompletedRecord>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].final_path, "new/place/a.txt");
        assert_eq!(rows[1].final_path, "old/b.txt");
    }

    #[test]
    fn test_relocate_unknown_id() {
        let (_dir, workflow) = fixture();
        assert!(matches!(
            workflow.relocate(3, "x/"),
            Err(WorkflowError::NotFound { .. })
        ));
    }

    #[test]
    fn test_relocate_with_missing_file() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "a.txt");
        workflow.approve(&UploadRef::Id(id), Some("old/")).unwrap();
        std::fs::remove_file(dir.path().join("share/old/a.txt")).unwrap();

        assert!(matches!(
            workflow.relocate(id, "new/"),
            Err(WorkflowError::NotFound { .. })
        ));
        let rows = workflow.ledger().scan::<CompletedRecord>().unwrap();
        assert_eq!(rows[0].final_path, "old/a.txt");
    }

    #[test]
    fn test_concurrent_approvals_to_same_path_keep_both_files() {
        for _ in 0..20 {
            let (dir, workflow) = fixture();
            let first = workflow
                .submit(&member(), "", Submission::from_bytes("a.txt", b"first".to_vec()))
                .unwrap()
                .upload_id;
            let second = workflow
                .submit(&member(), "", Submission::from_bytes("b.txt", b"second".to_vec()))
                .unwrap()
                .upload_id;

            let barrier = std::sync::Barrier::new(2);
            let (a, b) = std::thread::scope(|s| {
                let approve = |id| {
                    let barrier = &barrier;
                    let workflow = &workflow;
                    s.spawn(move || {
                        barrier.wait();
                        workflow.approve(&UploadRef::Id(id), Some("docs/same.txt"))
                    })
                };
                let a = approve(first);
                let b = approve(second);
                (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
            });

            assert_ne!(a.final_path, b.final_path);
            assert_eq!(std::fs::read(dir.path().join("share").join(&a.final_path)).unwrap(), b"first");
            assert_eq!(std::fs::read(dir.path().join("share").join(&b.final_path)).unwrap(), b"second");
            assert_eq!(workflow.ledger().count::<CompletedRecord>().unwrap(), 2);
        }
    }

    #[test]
    fn test_approve_racing_decline_settles_once() {
        for _ in 0..20 {
            let (_dir, workflow) = fixture();
            let id = submit(&workflow, "a.txt");

            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                let approving = s.spawn(|| {
                    barrier.wait();
                    workflow.approve(&UploadRef::Id(id), Some("docs/"))
                });
                let declining = s.spawn(|| {
                    barrier.wait();
                    workflow.decline(&UploadRef::Id(id))
                });
                let _ = approving.join().unwrap();
                let _ = declining.join().unwrap();
            });

            let completed = workflow.ledger().count::<CompletedRecord>().unwrap();
            let declined = workflow.ledger().count::<DeclinedRecord>().unwrap();
            assert_eq!(completed + declined, 1);
            assert_eq!(workflow.ledger().count::<PendingRecord>().unwrap(), 0);
        }
    }

    #[test]
    fn test_relocate_onto_taken_path_gets_suffix() {
        let (dir, workflow) = fixture();
        let first = submit(&workflow, "a.txt");
        let second = submit(&workflow, "b.txt");
        workflow.approve(&UploadRef::Id(first), Some("x/a.txt")).unwrap();
        workflow.approve(&UploadRef::Id(second), Some("y/a.txt")).unwrap();

        let moved = workflow.relocate(second, "x/a.txt").unwrap();

        assert_eq!(moved.final_path, "x/a_1.txt");
        assert!(dir.path().join("share/x/a.txt").exists());
        assert!(!dir.path().join("share/y/a.txt").exists());
    }

    #[test]
    fn test_file_form_destination_stores_under_given_name() {
        let (dir, workflow) = fixture();
        let id = submit(&workflow, "report.pdf");

        let completed = workflow.approve(&UploadRef::Id(id), Some("A/B")).unwrap();

        assert_eq!(completed.final_path, "A/B");
        assert!(dir.path().join("share/A/B").is_file());
    }
}
