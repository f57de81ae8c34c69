use std::time::Duration;

use super::transport::{HeaderValue, Headers};
use crate::config::BrokerConfig;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// What to do with a delivery whose handler failed
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, republish with `headers`, then ack the original
    Republish {
        attempt: u32,
        delay: Duration,
        headers: Headers,
    },
    /// Publish to the dead-letter exchange with `headers`, then ack the original
    DeadLetter { attempts: u32, headers: Headers },
}

/// Per-message retry counter with linear backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.max_retries, config.retry_backoff)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    /// Decide the fate of a failed delivery given the headers it arrived with
    pub fn on_failure(&self, headers: &Headers, error: &str) -> RetryDecision {
        let delivered = retry_count(headers);
        if delivered >= self.max_retries {
            return RetryDecision::DeadLetter {
                attempts: delivered,
                headers: stamp(headers, delivered, error),
            };
        }

        let attempt = delivered + 1;
        RetryDecision::Republish {
            attempt,
            delay: self.backoff_for(attempt),
            headers: stamp(headers, attempt, error),
        }
    }
}

fn stamp(headers: &Headers, count: u32, error: &str) -> Headers {
    let mut headers = headers.clone();
    headers.insert(
        RETRY_COUNT_HEADER.to_string(),
        HeaderValue::Int(i64::from(count)),
    );
    headers.insert(
        LAST_ERROR_HEADER.to_string(),
        HeaderValue::Text(error.to_string()),
    );
    headers
}

/// Read the retry counter, normalizing whatever numeric encoding arrived
///
/// Missing or unreadable values count as zero.
pub fn retry_count(headers: &Headers) -> u32 {
    match headers.get(RETRY_COUNT_HEADER) {
        Some(HeaderValue::Int(n)) if *n < 0 => 0,
        Some(HeaderValue::Int(n)) => u32::try_from(*n).unwrap_or(u32::MAX),
        Some(HeaderValue::UInt(n)) => u32::try_from(*n).unwrap_or(u32::MAX),
        Some(HeaderValue::Float(f)) if f.is_finite() && *f >= 0.0 => *f as u32,
        Some(HeaderValue::Text(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn last_error(headers: &Headers) -> Option<&str> {
    match headers.get(LAST_ERROR_HEADER) {
        Some(HeaderValue::Text(s)) => Some(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn headers_with(value: HeaderValue) -> Headers {
        let mut headers = Headers::new();
        headers.insert(RETRY_COUNT_HEADER.to_string(), value);
        headers
    }

    #[rstest]
    #[case(HeaderValue::Int(2), 2)]
    #[case(HeaderValue::UInt(2), 2)]
    #[case(HeaderValue::Float(2.0), 2)]
    #[case(HeaderValue::Text("2".to_string()), 2)]
    #[case(HeaderValue::Int(-4), 0)]
    #[case(HeaderValue::Float(f64::NAN), 0)]
    #[case(HeaderValue::Text("two".to_string()), 0)]
    #[case(HeaderValue::Bool(true), 0)]
    #[case(HeaderValue::UInt(u64::MAX), u32::MAX)]
    fn test_retry_count_normalizes_encodings(#[case] value: HeaderValue, #[case] expected: u32) {
        assert_eq!(retry_count(&headers_with(value)), expected);
    }

    #[test]
    fn test_missing_retry_count_is_zero() {
        assert_eq!(retry_count(&Headers::new()), 0);
    }

    #[test]
    fn test_first_failure_republishes_with_count_one() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        match policy.on_failure(&Headers::new(), "boom") {
            RetryDecision::Republish {
                attempt,
                delay,
                headers,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(retry_count(&headers), 1);
                assert_eq!(last_error(&headers), Some("boom"));
            }
            other => panic!("expected republish, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        match policy.on_failure(&headers_with(HeaderValue::UInt(2)), "boom") {
            RetryDecision::Republish { attempt, delay, .. } => {
                assert_eq!(attempt, 3);
                assert_eq!(delay, Duration::from_millis(30));
            }
            other => panic!("expected republish, got {:?}", other),
        }
    }

    #[test]
    fn test_republish_keeps_unrelated_headers() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut headers = Headers::new();
        headers.insert("trace-id".to_string(), HeaderValue::Text("abc".to_string()));

        match policy.on_failure(&headers, "boom") {
            RetryDecision::Republish { headers, .. } => {
                assert_eq!(
                    headers.get("trace-id"),
                    Some(&HeaderValue::Text("abc".to_string()))
                );
            }
            other => panic!("expected republish, got {:?}", other),
        }
    }

    #[rstest]
    #[case(3, 3)]
    #[case(3, 7)]
    #[case(0, 0)]
    fn test_exhausted_budget_dead_letters(#[case] max: u32, #[case] delivered: u32) {
        let policy = RetryPolicy::new(max, Duration::ZERO);

        let decision = policy.on_failure(&headers_with(HeaderValue::Int(delivered.into())), "x");

        match decision {
            RetryDecision::DeadLetter { attempts, headers } => {
                assert_eq!(attempts, delivered);
                assert_eq!(retry_count(&headers), delivered);
                assert_eq!(last_error(&headers), Some("x"));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[test]
    fn test_dead_letter_stamps_final_error_over_previous_one() {
        let policy = RetryPolicy::new(1, Duration::ZERO);
        let mut headers = headers_with(HeaderValue::Int(1));
        headers.insert(
            LAST_ERROR_HEADER.to_string(),
            HeaderValue::Text("first failure".to_string()),
        );

        match policy.on_failure(&headers, "second failure") {
            RetryDecision::DeadLetter { headers, .. } => {
                assert_eq!(last_error(&headers), Some("second failure"));
                assert_eq!(retry_count(&headers), 1);
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }
}
