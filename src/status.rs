use serde::Serialize;

use crate::{
    index::AssembledIndex,
    progress::{BatchProgress, BuildState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    NotStarted,
    Building,
    Complete,
    Failed,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not_started",
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failed => "failed",
        })
    }
}

/// Snapshot of build progress for polling consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatus {
    pub status: BuildPhase,
    pub percentage: u8,
    pub batches_completed: u64,
    pub total_batches: u64,
    pub chunks_processed: u64,
    pub embeddings_created: u64,
    /// Human-readable progress line.
    pub progress: String,
    pub error: Option<String>,
    /// First completed batch that could not be loaded into the index.
    pub unreadable_batch: Option<u64>,
    /// Whether a build is running right now.
    pub building: bool,
    /// Whether queries can be answered.
    pub ready: bool,
}

/// Derive a status snapshot.
///
/// Counts for a complete build come from the assembled index when one is
/// loaded, otherwise from the progress record. A complete build whose
/// index stopped at `stopped_at` reports as failed.
pub fn report(
    progress: Option<&BatchProgress>,
    index: Option<&AssembledIndex>,
    stopped_at: Option<&(u64, String)>,
    building: bool,
) -> BuildStatus {
    let ready = index.is_some_and(|i| !i.is_empty());
    let Some(p) = progress else {
        return BuildStatus {
            status: if building {
                BuildPhase::Building
            } else {
                BuildPhase::NotStarted
            },
            percentage: 0,
            batches_completed: 0,
            total_batches: 0,
            chunks_processed: 0,
            embeddings_created: 0,
            progress: if building {
                "Starting build".to_string()
            } else {
                "No build has run".to_string()
            },
            error: None,
            unreadable_batch: None,
            building,
            ready,
        };
    };

    let total_batches = p.total_batches.unwrap_or(0);
    let mut status = BuildStatus {
        status: BuildPhase::Building,
        percentage: p.percentage(),
        batches_completed: p.completed_batches,
        total_batches,
        chunks_processed: p.total_chunks_processed,
        embeddings_created: p.total_embeddings_created,
        progress: String::new(),
        error: None,
        unreadable_batch: None,
        building,
        ready,
    };

    match &p.state {
        BuildState::Failed { batch, error } if !building => {
            status.status = BuildPhase::Failed;
            status.error = Some(error.clone());
            status.progress = match batch {
                Some(b) => format!("Build failed at batch {}", b + 1),
                None => "Build failed before batching".to_string(),
            };
        }
        _ if p.is_complete() => {
            status.status = BuildPhase::Complete;
            status.percentage = 100;
            if let Some(index) = index {
                status.chunks_processed = index.len() as u64;
                status.embeddings_created = index.entries() as u64;
            }
            status.progress =
                format!("Index ready with {} chunks", status.chunks_processed);
            if let Some((batch, reason)) = stopped_at
                && !building
            {
                status.status = BuildPhase::Failed;
                status.unreadable_batch = Some(*batch);
                status.error = Some(format!(
                    "batch {} could not be loaded: {reason}",
                    batch + 1
                ));
                status.progress = format!(
                    "Index holds {} chunks; batch {} could not be loaded",
                    status.chunks_processed,
                    batch + 1
                );
            }
        }
        _ if p.total_batches.is_none() && !building => {
            status.status = BuildPhase::NotStarted;
            status.percentage = 0;
            status.progress = "No batches counted yet".to_string();
        }
        BuildState::Counting => {
            status.progress = "Counting corpus lines".to_string();
        }
        _ => {
            status.progress = format!(
                "Completed {}/{} batches, {} chunks",
                p.completed_batches, total_batches, p.total_chunks_processed
            );
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CorpusFingerprint;

    fn progress(total_lines: u64, batch_size: u64) -> BatchProgress {
        let mut p = BatchProgress::new(
            "c.jsonl",
            CorpusFingerprint { size: 1, mtime: 1 },
            batch_size,
        );
        p.begin_counting().unwrap();
        p.set_total_lines(total_lines).unwrap();
        p
    }

    #[test]
    fn nothing_recorded_is_not_started() {
        let s = report(None, None, None, false);
        assert_eq!(s.status, BuildPhase::NotStarted);
        assert_eq!(s.percentage, 0);
        assert!(!s.ready);
    }

    #[test]
    fn uncounted_progress_is_not_started() {
        let p = BatchProgress::new(
            "c.jsonl",
            CorpusFingerprint { size: 1, mtime: 1 },
            10,
        );
        assert_eq!(
            report(Some(&p), None, None, false).status,
            BuildPhase::NotStarted
        );
    }

    #[test]
    fn counting_while_building_is_building() {
        let mut p = BatchProgress::new(
            "c.jsonl",
            CorpusFingerprint { size: 1, mtime: 1 },
            10,
        );
        p.begin_counting().unwrap();
        let s = report(Some(&p), None, None, true);
        assert_eq!(s.status, BuildPhase::Building);
        assert_eq!(s.progress, "Counting corpus lines");
    }

    #[test]
    fn percentage_truncates() {
        let mut p = progress(12_500, 5_000);
        p.complete_batch(40, 40).unwrap();
        let s = report(Some(&p), None, None, true);
        assert_eq!(s.status, BuildPhase::Building);
        assert_eq!(s.percentage, 33);
        assert_eq!(s.batches_completed, 1);
        assert_eq!(s.total_batches, 3);
        assert_eq!(s.chunks_processed, 40);
    }

    #[test]
    fn complete_reports_index_counts() {
        let mut p = progress(10, 10);
        p.complete_batch(5, 5).unwrap();
        let index = AssembledIndex::Dense {
            chunks: Vec::new(),
            vectors: Default::default(),
        };
        let s = report(Some(&p), Some(&index), None, false);
        assert_eq!(s.status, BuildPhase::Complete);
        assert_eq!(s.percentage, 100);
        assert_eq!(s.chunks_processed, 0);
        assert!(!s.ready);
    }

    #[test]
    fn unreadable_batch_turns_complete_into_failed() {
        let mut p = progress(30, 10);
        for _ in 0..3 {
            p.complete_batch(10, 10).unwrap();
        }
        let gap = (2, "embedding file truncated".to_string());
        let s = report(Some(&p), None, Some(&gap), false);
        assert_eq!(s.status, BuildPhase::Failed);
        assert_eq!(s.unreadable_batch, Some(2));
        assert!(s.error.unwrap().contains("truncated"));
        assert_eq!(
            s.progress,
            "Index holds 30 chunks; batch 3 could not be loaded"
        );

        let s = report(Some(&p), None, None, false);
        assert_eq!(s.status, BuildPhase::Complete);
        assert_eq!(s.unreadable_batch, None);
    }

    #[test]
    fn failure_carries_message() {
        let mut p = progress(30, 10);
        p.complete_batch(1, 1).unwrap();
        p.fail("disk full");
        let s = report(Some(&p), None, None, false);
        assert_eq!(s.status, BuildPhase::Failed);
        assert_eq!(s.error.as_deref(), Some("disk full"));
        assert_eq!(s.batches_completed, 1);
        assert_eq!(s.progress, "Build failed at batch 2");
    }

    #[test]
    fn status_serializes_snake_case() {
        let json =
            serde_json::to_value(report(None, None, None, false)).unwrap();
        assert_eq!(json["status"], "not_started");
    }
}
