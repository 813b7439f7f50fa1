use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use super::{Result, SubstrateError};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total number of attempts.
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 4,
            initial: Duration::from_millis(10),
            factor: 5,
        }
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or `backoff.steps` attempts have been made.  The last error is returned.
///
/// `op` is expected to refetch the object it modifies, so every attempt
/// works from the latest version.
pub async fn retry_on_conflict<T, F, Fut>(backoff: Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(SubstrateError::Conflict(msg)) if attempt < backoff.steps => {
                debug!("Conflict on attempt {}: {}. Retrying in {:?}", attempt, msg, delay);
                sleep(delay).await;
                delay *= backoff.factor;
                attempt += 1;
            }
            result => return result,
        }
    }
}
