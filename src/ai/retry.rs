use std::time::{Duration, SystemTime};

/// Upper bound on how long a server-provided retry hint may push a retry
/// out. Hints beyond this are clamped.
pub const MAX_SERVER_HINT_WINDOW: Duration = Duration::from_secs(60);

/// Extra delay information returned by the server alongside a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryHint {
    delay: Duration,
}

impl RetryHint {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub const fn delay(&self) -> Duration {
        self.delay
    }

    pub fn clamped_delay(&self) -> Duration {
        self.delay.min(MAX_SERVER_HINT_WINDOW)
    }
}

/// Exponential backoff for the given attempt number (1-based): the first
/// failed attempt waits `base`, the second `2 * base`, and so on.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier: u32 = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier)
}

/// Delay before re-queuing a failed attempt. A server hint takes precedence
/// over the computed backoff, clamped to [`MAX_SERVER_HINT_WINDOW`].
pub fn retry_delay(base: Duration, attempt: u32, hint: Option<&RetryHint>) -> Duration {
    match hint {
        Some(hint) => hint.clamped_delay(),
        None => backoff_delay(base, attempt),
    }
}

/// Parses the value of an HTTP `Retry-After` header, either delta-seconds
/// or an HTTP date. Returns `None` when parsing fails.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(instant) = httpdate::parse_http_date(trimmed) {
        if let Ok(duration) = instant.duration_since(now) {
            return Some(duration);
        }
        return Some(Duration::from_secs(0));
    }

    None
}
