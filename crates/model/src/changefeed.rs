use crate::errors::RunningError;

/// Identifier of a changefeed: a namespace plus a name, both non-empty and
/// stable for the lifetime of the feed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ChangefeedId {
    pub namespace: String,
    pub id: String,
}

impl ChangefeedId {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> anyhow::Result<Self> {
        let (namespace, id) = (namespace.into(), id.into());
        if namespace.is_empty() {
            anyhow::bail!("changefeed namespace must not be empty");
        }
        if id.is_empty() {
            anyhow::bail!("changefeed id must not be empty");
        }
        Ok(Self { namespace, id })
    }
}

impl std::fmt::Display for ChangefeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Lifecycle state of a changefeed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Actively replicating.
    #[default]
    Normal,
    /// Transient fault; a restart is permitted once backoff allows it.
    Error,
    /// A non-fatal condition was recorded; the feed keeps running.
    Warning,
    /// Paused by an operator; never resumed automatically.
    Stopped,
    /// Terminal fault. Requires operator intervention.
    Failed,
    /// Normal logical completion.
    Finished,
    /// Marked for deletion; persisted records are about to be erased.
    Removed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FeedState::Normal => "normal",
            FeedState::Error => "error",
            FeedState::Warning => "warning",
            FeedState::Stopped => "stopped",
            FeedState::Failed => "failed",
            FeedState::Finished => "finished",
            FeedState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Kind of an operator command, also mirrored onto persisted info and status
/// so other controller components observe the transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminJobType {
    #[default]
    None,
    Stop,
    Resume,
    Remove,
    Finish,
}

impl std::fmt::Display for AdminJobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdminJobType::None => "none",
            AdminJobType::Stop => "stop",
            AdminJobType::Resume => "resume",
            AdminJobType::Remove => "remove",
            AdminJobType::Finish => "finish",
        };
        f.write_str(s)
    }
}

/// An operator command addressed to one changefeed.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdminJob {
    pub id: ChangefeedId,
    pub kind: AdminJobType,
    /// For `Resume`: rewind the replication starting offset and all status
    /// timestamps to this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_checkpoint_ts: Option<u64>,
}

/// Persisted description of a changefeed. Owned by the persistence layer;
/// the state manager mutates it only through patch closures.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChangefeedInfo {
    pub state: FeedState,
    pub admin_job_type: AdminJobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunningError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<RunningError>,
    /// Monotonic tag stamped at each terminal transition. Downstream
    /// observers compare epochs to detect restarts.
    #[serde(default)]
    pub epoch: u64,
    /// Upstream timestamp replication starts from.
    #[serde(default)]
    pub start_ts: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn changefeed_id_rejects_empty_parts() {
        assert!(ChangefeedId::new("", "feed").is_err());
        assert!(ChangefeedId::new("default", "").is_err());

        let id = ChangefeedId::new("default", "orders").unwrap();
        assert_eq!(id.to_string(), "default/orders");
    }

    #[test]
    fn info_document_shape_is_stable() {
        // The persistence layer stores this document verbatim; field names
        // are a schema contract.
        let info = ChangefeedInfo {
            state: FeedState::Error,
            admin_job_type: AdminJobType::Stop,
            error: Some(RunningError {
                source: "10.0.0.7:8300".to_string(),
                code: "CDC:ErrSinkUnavailable".to_string(),
                message: "connection refused".to_string(),
            }),
            warning: None,
            epoch: 42,
            start_ts: 7,
        };
        let doc = serde_json::to_value(&info).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({
                "state": "error",
                "admin_job_type": "stop",
                "error": {
                    "source": "10.0.0.7:8300",
                    "code": "CDC:ErrSinkUnavailable",
                    "message": "connection refused",
                },
                "epoch": 42,
                "start_ts": 7,
            })
        );
    }
}
