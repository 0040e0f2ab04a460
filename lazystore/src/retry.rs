use core::future::Future;

/// Scheduled re-checks a waiting request gets while another load of the same
/// key is in flight.
pub const MAX_LOAD_ATTEMPTS: u32 = 10;

/// Bounded, tick-based rescheduling of a request that found its key busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ticks: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: MAX_LOAD_ATTEMPTS, delay_ticks: 1 }
    }
}

impl RetryPolicy {
    /// Attempt number to schedule after `attempt` found the key busy, or
    /// `None` once the budget is spent.
    pub fn next_attempt(&self, attempt: u32) -> Option<u32> {
        (attempt < self.max_attempts).then_some(attempt + 1)
    }
}

/// Runs `op` up to `attempts` times (at least once), sleeping `delay` between
/// failures. Returns the first success or the last error.
pub async fn retry_with_delay<F, Fut, T, E>(
    attempts: usize,
    delay: std::time::Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut left = attempts.max(1);
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(_e) if left > 1 => {
                left -= 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
