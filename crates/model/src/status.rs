use crate::changefeed::AdminJobType;
use crate::errors::RunningError;

/// Identifier of a capture process hosting processors.
pub type CaptureId = String;

/// Persisted replication progress of a changefeed.
///
/// `checkpoint_ts <= resolved_ts` in normal operation: the checkpoint is the
/// point all sinks have durably written, the resolved timestamp is the point
/// up to which the upstream is known complete.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangefeedStatus {
    #[serde(default)]
    pub checkpoint_ts: u64,
    #[serde(default)]
    pub resolved_ts: u64,
    #[serde(default)]
    pub min_table_barrier_ts: u64,
    pub admin_job_type: AdminJobType,
}

/// Persisted per-processor record. The state manager absorbs and clears the
/// fault fields; everything else on the position belongs to the processor.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunningError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<RunningError>,
}

impl TaskPosition {
    /// True when there is nothing left for the state manager to absorb.
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.warning.is_none()
    }
}
