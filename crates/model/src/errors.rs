/// A structured fault reported by a processor, carried on task positions and
/// recorded onto changefeed info. The same shape is used for warnings.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunningError {
    /// Advertised address of the reporting processor.
    pub source: String,
    /// Stable error code, e.g. `CDC:ErrSnapshotExpired`. Classification
    /// predicates operate on this field.
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for RunningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
