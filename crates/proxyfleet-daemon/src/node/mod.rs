//! Remote peer-node management.

mod peer;

pub use peer::PeerNode;

#[cfg(test)]
pub(crate) use peer::tests as peer_testing;

/// Errors from peer-node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("node engine is not started")]
    NotStarted,

    #[error("node RPC failed: {0}")]
    Status(#[from] tonic::Status),
}

/// Capped immediate-retry policy for connection handshakes.
///
/// Connect attempts are retried back to back rather than with backoff:
/// reconciliation loops provide the spacing between rounds, this policy
/// only bounds one round. `attempt_timeout` bounds a single attempt, so a
/// half-open peer (TCP accepts, never completes the protocol handshake)
/// cannot hold a connect open indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    /// Total attempts per round (not retries after the first).
    pub attempts: u32,
    /// Deadline for one attempt, handshake ping included.
    pub attempt_timeout: std::time::Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// Run `op` up to `policy.attempts` times, returning the first success or
/// the last error. The closure receives the 0-indexed attempt number.
pub async fn with_retries<T, E, F, Fut>(policy: ConnectPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn succeeds_on_third_attempt_with_exactly_three_calls() {
        let calls = AtomicU32::new(0);
        let result = with_retries(ConnectPolicy::default(), |attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("attempt {attempt} refused"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retries(ConnectPolicy::default(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("refused on {attempt}")) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "refused on 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = with_retries(ConnectPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("up") }
        })
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let policy = ConnectPolicy {
            attempts: 0,
            ..ConnectPolicy::default()
        };
        let result: Result<(), &str> = with_retries(policy, |_| async { Err("down") }).await;
        assert!(result.is_err());
    }
}
