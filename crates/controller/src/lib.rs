pub mod backoff;
pub mod classifier;
pub mod manager;
pub mod oracle;
pub mod queue;
pub mod state;
pub mod window;

pub use classifier::{ErrorClassifier, StandardClassifier};
pub use manager::ChangefeedStateManager;
pub use oracle::TimeOracle;
pub use queue::AdminJobQueue;
pub use state::{ChangefeedState, DataPatch};
