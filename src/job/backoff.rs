use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::definition::ClientConf;

/// Exponential backoff with jitter and a bounded number of attempts.
///
/// `steps` is the total number of attempts. Once the growing delay would
/// exceed a non-zero `cap` it is clamped and the attempt that follows is the
/// last one.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub const FACTOR: f64 = 2.0;
    pub const JITTER: f64 = 0.5;

    pub fn single_attempt() -> Self {
        BackoffPolicy {
            duration: Duration::ZERO,
            factor: 0.0,
            jitter: 0.0,
            steps: 1,
            cap: Duration::ZERO,
        }
    }

    /// Policy for optimistic-concurrency conflicts on small metadata writes.
    pub fn conflict_retry() -> Self {
        BackoffPolicy {
            duration: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
            steps: 5,
            cap: Duration::ZERO,
        }
    }

    pub fn from_client_conf(conf: Option<&ClientConf>) -> Self {
        match conf {
            None => Self::single_attempt(),
            Some(conf) => BackoffPolicy {
                duration: conf.retry_backoff,
                factor: Self::FACTOR,
                jitter: Self::JITTER,
                steps: u32::from(conf.retry_attempts),
                cap: conf.retry_max_duration,
            },
        }
    }

    /// Returns the next delay and advances the policy.
    fn step(&mut self) -> Duration {
        if self.steps == 0 {
            return jittered(self.duration, self.jitter);
        }
        self.steps -= 1;

        let current = self.duration;
        if self.factor != 0.0 {
            self.duration = Duration::try_from_secs_f64(current.as_secs_f64() * self.factor)
                .unwrap_or(Duration::MAX);
            if !self.cap.is_zero() && self.duration > self.cap {
                self.duration = self.cap;
                self.steps = 0;
            }
        }
        jittered(current, self.jitter)
    }
}

fn jittered(duration: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return duration;
    }
    let extra = rand::thread_rng().gen_range(0.0..jitter);
    duration.saturating_add(duration.mul_f64(extra))
}

/// Runs `op` until it succeeds, fails with an error `retriable` rejects, or
/// the policy runs out of attempts. The last error is returned in the latter
/// cases. At least one attempt is always made.
pub async fn retry_on_error<T, E, F, Fut>(
    policy: &BackoffPolicy,
    retriable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.clone();
    let mut attempt = 1u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !retriable(&err) || backoff.steps <= 1 {
            return Err(err);
        }
        let delay = backoff.step();
        debug!(
            "Attempt {} failed. Retrying in {} ms...",
            attempt,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
