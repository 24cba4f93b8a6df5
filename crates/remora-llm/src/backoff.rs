use std::time::Duration;

const INITIAL_DELAY_MS: u64 = 1600;
const MAX_ATTEMPTS: u32 = 4;

/// Exponential backoff for transient transport failures. One instance
/// per request; `wait` sleeps and reports whether another attempt is
/// allowed.
pub struct Backoff {
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            delay: Duration::from_millis(INITIAL_DELAY_MS),
        }
    }

    pub async fn wait(&mut self) -> bool {
        self.attempt += 1;
        if self.attempt >= MAX_ATTEMPTS {
            return false;
        }
        tokio::time::sleep(self.delay).await;
        self.delay *= 2;
        true
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Transient statuses worth retrying: rate limits and server errors.
pub fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// User-facing message for quota and rate-limit failures. These need
/// more than the raw status line because the fix is on the account side.
pub fn rate_limit_help(error_type: &str, message: &str) -> String {
    if error_type.contains("insufficient_quota") {
        format!(
            "The API reports your account is out of quota ({message}). \
             Check your plan and billing details, then start a new command."
        )
    } else {
        format!(
            "The API is rate-limiting requests ({message}). \
             Wait a moment and try again."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_after_attempts() {
        let mut b = Backoff::new();
        assert!(b.wait().await);
        assert!(b.wait().await);
        assert!(b.wait().await);
        assert!(!b.wait().await);
    }

    #[test]
    fn test_retryable_status() {
        use reqwest::StatusCode;
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_rate_limit_help_quota() {
        let msg = rate_limit_help("insufficient_quota", "quota exceeded");
        assert!(msg.contains("out of quota"));
    }
}
