use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff with optional jitter. Server side only: the attempt
/// edge never retries audit, lock or submit calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Used for history writes that must land exactly once.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 7,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1000),
            jitter_max: Some(Duration::from_millis(100)),
        }
    }

    fn delay(&self, backoff: Duration) -> Duration {
        match self.jitter_max {
            Some(jitter_max) => {
                let jitter_ms = jitter_max.as_millis() as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::random::<u64>() % (jitter_ms + 1)
                };
                backoff + Duration::from_millis(extra)
            }
            None => backoff,
        }
    }
}

pub async fn retry_async_with_config<F, Fut, T, E>(config: RetryConfig, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_async_if(config, f, |_| true).await
}

/// Retries while `should_retry` accepts the error; a rejected error is returned immediately.
pub async fn retry_async_if<F, Fut, T, E, P>(
    config: RetryConfig,
    mut f: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempts_left = config.max_attempts.max(1);
    let mut backoff = config.base_backoff;

    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempts_left -= 1;
                if attempts_left == 0 || !should_retry(&e) {
                    return Err(e);
                }

                tokio::time::sleep(config.delay(backoff)).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
