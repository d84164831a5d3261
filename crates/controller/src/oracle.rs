use chrono::{DateTime, Utc};
use std::time::Duration;

/// Deadline for one timestamp fetch from the upstream oracle. On expiry the
/// epoch degrades to the local clock rather than failing the tick.
pub const ORACLE_DEADLINE: Duration = Duration::from_secs(5);

/// Low bits of a composed oracle timestamp reserved for the logical counter.
const LOGICAL_BITS: u32 = 18;

/// Clock collaborator of the state manager.
///
/// `current_time` is the local wall clock; the manager never reads the
/// system clock directly, so tests drive time through their oracle. The
/// async half talks to the upstream timestamp oracle of the cluster.
#[async_trait::async_trait]
pub trait TimeOracle: Send + Sync {
    fn current_time(&self) -> DateTime<Utc>;

    /// Fetch `(physical milliseconds, logical counter)` from the upstream
    /// timestamp oracle.
    async fn get_timestamp(&self) -> anyhow::Result<(u64, u64)>;
}

/// Compose a physical/logical pair into the oracle's 64-bit timestamp
/// convention.
pub fn compose_ts(physical: u64, logical: u64) -> u64 {
    (physical << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// Obtain a fresh epoch for a terminal state transition.
///
/// The oracle call is bounded by [`ORACLE_DEADLINE`]; on error, timeout, or
/// cancellation the epoch degrades to local wall-clock nanoseconds, which
/// preserves monotonicity well enough for restart detection.
pub async fn generate_epoch(oracle: &dyn TimeOracle) -> u64 {
    match tokio::time::timeout(ORACLE_DEADLINE, oracle.get_timestamp()).await {
        Ok(Ok((physical, logical))) => compose_ts(physical, logical),
        Ok(Err(error)) => {
            tracing::warn!(%error, "time oracle unavailable, stamping epoch from the local clock");
            local_epoch(oracle)
        }
        Err(_) => {
            tracing::warn!(
                deadline = ?ORACLE_DEADLINE,
                "time oracle deadline exceeded, stamping epoch from the local clock",
            );
            local_epoch(oracle)
        }
    }
}

fn local_epoch(oracle: &dyn TimeOracle) -> u64 {
    oracle.current_time().timestamp_nanos_opt().unwrap_or_default() as u64
}
