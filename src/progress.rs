//! Progress Bus (C10): writes the tagged `ProgressDetail` record durably
//! alongside any companion counter on the same row, so a poller never reads
//! one without the other. Reads are unordered; pollers are expected to poll
//! every few seconds (spec §4.10).

use crate::db::audits as audits_db;
use crate::error::Result;
use crate::models::{FileProgress, FileProgressStatus, ProgressDetail};
use sqlx::PgPool;
use uuid::Uuid;

pub struct ProgressBus<'a> {
    pool: &'a PgPool,
}

impl<'a> ProgressBus<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Write a progress record as-is.
    pub async fn write(&self, audit_id: Uuid, detail: &ProgressDetail) -> Result<()> {
        audits_db::update_progress(self.pool, audit_id, detail).await
    }

    /// Write a progress record and `files_analyzed` atomically, as used by
    /// Phase 4 (batch & analyze) after each batch completes.
    pub async fn write_with_files_analyzed(
        &self,
        audit_id: Uuid,
        detail: &ProgressDetail,
        files_analyzed: i64,
    ) -> Result<()> {
        audits_db::update_progress_and_files_analyzed(self.pool, audit_id, detail, files_analyzed)
            .await
    }

    /// Append a non-fatal warning to a progress record and persist it.
    pub async fn warn(&self, audit_id: Uuid, mut detail: ProgressDetail, message: impl Into<String>) -> Result<ProgressDetail> {
        detail.warnings_mut().push(message.into());
        self.write(audit_id, &detail).await?;
        Ok(detail)
    }
}

/// Build the initial `ProgressAnalyzing` record: every selected file starts
/// `pending` (spec §4.8 Phase 3).
pub fn init_analyzing(files: &[String]) -> ProgressDetail {
    ProgressDetail::Analyzing {
        files: files
            .iter()
            .map(|f| FileProgress {
                file: f.clone(),
                status: FileProgressStatus::Pending,
                findings_count: 0,
            })
            .collect(),
        warnings: Vec::new(),
    }
}

/// Mark a single file's progress entry `done`/`error` with its findings
/// count, leaving every other entry untouched.
pub fn mark_file(files: &mut [FileProgress], file: &str, status: FileProgressStatus, findings_count: i64) {
    if let Some(entry) = files.iter_mut().find(|f| f.file == file) {
        entry.status = status;
        entry.findings_count = findings_count;
    }
}

/// Convert an `Analyzing` record into the terminal `Done` record, carrying
/// over its files and warnings (spec §4.8 Phase 5).
pub fn to_done(detail: ProgressDetail) -> ProgressDetail {
    match detail {
        ProgressDetail::Analyzing { files, warnings } => ProgressDetail::Done { files, warnings },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_analyzing_marks_every_file_pending() {
        let detail = init_analyzing(&["a.rs".to_string(), "b.rs".to_string()]);
        match detail {
            ProgressDetail::Analyzing { files, .. } => {
                assert_eq!(files.len(), 2);
                assert!(files.iter().all(|f| matches!(f.status, FileProgressStatus::Pending)));
            }
            _ => panic!("expected Analyzing"),
        }
    }

    #[test]
    fn mark_file_updates_only_the_named_entry() {
        let mut detail = init_analyzing(&["a.rs".to_string(), "b.rs".to_string()]);
        if let ProgressDetail::Analyzing { files, .. } = &mut detail {
            mark_file(files, "a.rs", FileProgressStatus::Done, 3);
            assert_eq!(files[0].status, FileProgressStatus::Done);
            assert_eq!(files[0].findings_count, 3);
            assert!(matches!(files[1].status, FileProgressStatus::Pending));
        }
    }

    #[test]
    fn to_done_preserves_files_and_warnings() {
        let mut detail = init_analyzing(&["a.rs".to_string()]);
        detail.warnings_mut().push("fallback used".to_string());
        let done = to_done(detail);
        match done {
            ProgressDetail::Done { files, warnings } => {
                assert_eq!(files.len(), 1);
                assert_eq!(warnings, vec!["fallback used".to_string()]);
            }
            _ => panic!("expected Done"),
        }
    }
}
