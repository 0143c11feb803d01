//! Read-only views over the ledgers for submitters and reviewers.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::UploadWorkflow;
use crate::error::WorkflowError;
use crate::identity::Submitter;
use crate::ledger::{CompletedRecord, DeclinedRecord, PendingRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Staged and waiting for a reviewer.
    PendingReview,
    /// Pending row exists but the staged file is not there (yet).
    Processing,
    Declined,
    Approved,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub upload_id: u64,
    pub submitted_at: NaiveDateTime,
    pub submitter: String,
    pub user_id: Option<u64>,
    pub display_name: String,
    pub path: String,
    pub stored_name: String,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<NaiveDateTime>,
}

impl UploadSummary {
    fn pending(row: PendingRecord, display_name: String, status: UploadStatus) -> Self {
        Self {
            upload_id: row.upload_id,
            submitted_at: row.submitted_at,
            submitter: row.submitter,
            user_id: row.user_id,
            display_name,
            path: row.logical_path,
            stored_name: row.stored_name,
            status,
            approved_at: None,
        }
    }

    fn approved(row: CompletedRecord) -> Self {
        Self {
            upload_id: row.upload_id,
            submitted_at: row.submitted_at,
            submitter: row.submitter,
            user_id: row.user_id,
            display_name: row.final_path.clone(),
            path: row.final_path,
            stored_name: row.stored_name,
            status: UploadStatus::Approved,
            approved_at: Some(row.approved_at),
        }
    }
}

/// Newest first; rows with equal timestamps keep later ledger rows first.
fn newest_first(items: &mut [UploadSummary]) {
    items.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
}

impl UploadWorkflow {
    /// Everything `submitter` has uploaded, pending or approved.
    pub fn my_uploads(&self, submitter: &Submitter) -> Result<Vec<UploadSummary>, WorkflowError> {
        let declined: HashSet<String> = self
            .ledger
            .scan::<DeclinedRecord>()?
            .into_iter()
            .filter(|row| submitter.owns(&row.submitter, row.user_id))
            .map(|row| row.stored_name)
            .collect();

        let mut uploads = Vec::new();
        for row in self.ledger.scan::<PendingRecord>()?.into_iter().rev() {
            if !submitter.owns(&row.submitter, row.user_id) {
                continue;
            }
            let display_name = if row.logical_path.is_empty() {
                row.stored_name.clone()
            } else {
                row.logical_path.clone()
            };
            let status = if declined.contains(&row.stored_name) || declined.contains(&display_name) {
                UploadStatus::Declined
            } else if self.storage.staging_path(&row.stored_name).exists() {
                UploadStatus::PendingReview
            } else {
                UploadStatus::Processing
            };
            uploads.push(UploadSummary::pending(row, display_name, status));
        }

        for row in self.ledger.scan::<CompletedRecord>()?.into_iter().rev() {
            if submitter.owns(&row.submitter, row.user_id) {
                uploads.push(UploadSummary::approved(row));
            }
        }

        newest_first(&mut uploads);
        log::debug!("Listed {} upload(s) for one submitter", uploads.len());
        Ok(uploads)
    }

    /// Pending uploads whose staged file is present, newest first.
    pub fn pending_queue(&self) -> Result<Vec<UploadSummary>, WorkflowError> {
        let mut queue: Vec<UploadSummary> = self
            .ledger
            .scan::<PendingRecord>()?
            .into_iter()
            .rev()
            .filter(|row| self.storage.staging_path(&row.stored_name).exists())
            .map(|row| {
                let display_name = if row.logical_path.contains('/') {
                    row.logical_path.clone()
                } else {
                    row.stored_name.clone()
                };
                UploadSummary::pending(row, display_name, UploadStatus::PendingReview)
            })
            .collect();

        newest_first(&mut queue);
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Submitter;
    use crate::ledger::record;
    use crate::workflow::testing::{fixture, member};
    use crate::workflow::{Submission, UploadRef};

    fn submit_as(workflow: &UploadWorkflow, who: &Submitter, name: &str) -> u64 {
        workflow
            .submit(who, "", Submission::from_bytes(name, b"x".to_vec()))
            .unwrap()
            .upload_id
    }

    #[test]
    fn test_my_uploads_covers_pending_and_approved() {
        let (_dir, workflow) = fixture();
        let me = member();
        let other = Submitter::new("other@example.com", Some(8));

        let approved = submit_as(&workflow, &me, "a.txt");
        let pending = submit_as(&workflow, &me, "b.txt");
        submit_as(&workflow, &other, "c.txt");
        workflow.approve(&UploadRef::Id(approved), Some("docs/")).unwrap();

        let uploads = workflow.my_uploads(&me).unwrap();

        assert_eq!(uploads.len(), 2);
        let a = uploads.iter().find(|u| u.upload_id == approved).unwrap();
        assert_eq!(a.status, UploadStatus::Approved);
        assert_eq!(a.display_name, "docs/a.txt");
        assert!(a.approved_at.is_some());

        let b = uploads.iter().find(|u| u.upload_id == pending).unwrap();
        assert_eq!(b.status, UploadStatus::PendingReview);
    }

    #[test]
    fn test_my_uploads_statuses_for_missing_and_declined() {
        let (dir, workflow) = fixture();
        let me = member();
        submit_as(&workflow, &me, "gone.txt");
        std::fs::remove_file(dir.path().join("staging/gone.txt")).unwrap();

        // A declined row for a name that is also still pending.
        workflow
            .ledger()
            .append(PendingRecord {
                upload_id: 90,
                submitted_at: record::now(),
                submitter: me.identity.clone(),
                user_id: me.user_id,
                stored_name: "dup.txt".to_string(),
                logical_path: "dup.txt".to_string(),
            })
            .unwrap();
        workflow
            .ledger()
            .append(DeclinedRecord {
                declined_at: record::now(),
                submitter: me.identity.clone(),
                user_id: me.user_id,
                stored_name: "dup.txt".to_string(),
            })
            .unwrap();

        let uploads = workflow.my_uploads(&me).unwrap();
        let status_of = |name: &str| {
            uploads
                .iter()
                .find(|u| u.stored_name == name)
                .map(|u| u.status)
                .unwrap()
        };
        assert_eq!(status_of("gone.txt"), UploadStatus::Processing);
        assert_eq!(status_of("dup.txt"), UploadStatus::Declined);
    }

    #[test]
    fn test_my_uploads_matches_identity_without_user_id() {
        let (_dir, workflow) = fixture();
        let anonymous = Submitter::new("member@example.com", None);
        submit_as(&workflow, &member(), "a.txt");

        assert_eq!(workflow.my_uploads(&anonymous).unwrap().len(), 1);
        assert_eq!(
            workflow
                .my_uploads(&Submitter::new("renamed@example.com", Some(7)))
                .unwrap()
                .len(),
            1
        );
        assert!(workflow
            .my_uploads(&Submitter::new("member@example.com", Some(99)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pending_queue_skips_missing_files() {
        let (dir, workflow) = fixture();
        let me = member();
        submit_as(&workflow, &me, "a.txt");
        workflow
            .submit(&me, "course", Submission::from_bytes("week1/b.txt", b"b".to_vec()))
            .unwrap();
        submit_as(&workflow, &me, "c.txt");
        std::fs::remove_file(dir.path().join("staging/c.txt")).unwrap();

        let queue = workflow.pending_queue().unwrap();

        let names: Vec<&str> = queue.iter().map(|u| u.display_name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"course/week1/b.txt"));
        assert!(queue.iter().all(|u| u.status == UploadStatus::PendingReview));
    }

    #[test]
    fn test_pending_queue_is_newest_first() {
        let (_dir, workflow) = fixture();
        let ts = |raw: &str| NaiveDateTime::parse_from_str(raw, record::TIMESTAMP_FORMAT).unwrap();
        for (id, name, at) in [
            (1, "old.txt", "2026-01-01 08:00:00"),
            (2, "new.txt", "2026-02-01 08:00:00"),
        ] {
            std::fs::write(workflow.storage().staging_path(name), b"x").unwrap();
            workflow
                .ledger()
                .append(PendingRecord {
                    upload_id: id,
                    submitted_at: ts(at),
                    submitter: "m@example.com".to_string(),
                    user_id: None,
                    stored_name: name.to_string(),
                    logical_path: name.to_string(),
                })
                .unwrap();
        }

        let queue = workflow.pending_queue().unwrap();
        assert_eq!(queue[0].stored_name, "new.txt");
        assert_eq!(queue[1].stored_name, "old.txt");
    }
}
