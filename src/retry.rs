//! Support utilities for [`keen_retry`]'s retry API.
//!
//! Our rule for retries is simple: OCR backends are never retried, because the
//! fallback selector already has somewhere else to go. LLM enhancement is
//! retried a bounded number of times, and only for errors we recognise as
//! transient.

use async_openai::error::OpenAIError;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// On error, return a [`RetryResult::Transient`] value.
macro_rules! try_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if $crate::retry::IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient, try_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Convert a single [`RetryResult`] into a plain [`Result`], without retrying.
pub(crate) fn retry_result_into_result<T>(
    result: RetryResult<(), (), T, anyhow::Error>,
) -> Result<T> {
    match result {
        RetryResult::Ok { output, .. } => Ok(output),
        RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
            Err(error)
        }
    }
}

/// Run `attempt`, retrying transient failures up to `re_attempts` times with
/// jittered exponential backoff.
///
/// Returns the output, plus a description of every error we saw along the way
/// (including the final one, if we failed).
pub(crate) async fn run_with_retries<T, F, Fut>(
    re_attempts: u8,
    max_backoff_millis: u32,
    attempt: F,
) -> (Option<T>, Vec<String>)
where
    F: Fn() -> Fut,
    Fut: Future<Output = RetryResult<(), (), T, anyhow::Error>>,
{
    let first = attempt().await;
    if re_attempts == 0 {
        return match retry_result_into_result(first) {
            Ok(output) => (Some(output), vec![]),
            Err(err) => (None, vec![format!("{err:?}")]),
        };
    }

    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=max_backoff_millis.max(1),
        re_attempts,
        jitter_ratio: 0.2,
    };
    let resolved = first
        .retry_with_async(|_| attempt())
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });

    let full_err = |err: anyhow::Error| format!("{:?}", err);
    match resolved {
        ResolvedResult::Ok { output, .. } => (Some(output), vec![]),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => (Some(output), retry_errors.into_iter().map(full_err).collect()),
        ResolvedResult::Fatal { error, .. } => (None, vec![full_err(error)]),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            let mut errors = retry_errors.into_iter().map(full_err).collect::<Vec<_>>();
            errors.push(full_err(fatal_error));
            (None, errors)
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild and determined to be transient. This prevents us from spending
/// money on retries that will never succeed.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, DNS hiccups and timeouts don't carry a
            // status, and `reqwest` doesn't expose enough detail to tell
            // them apart.
            self.is_timeout() || self.is_connect() || self.is_request()
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(api_error) => {
                let r#type = api_error.r#type.as_deref().unwrap_or_default();
                let code = api_error.code.as_deref().unwrap_or_default();
                r#type == "server_error"
                    || r#type == "rate_limit_error"
                    || code == "rate_limit_exceeded"
            }
            // A truncated or garbled body is usually a flaky proxy.
            OpenAIError::JSONDeserialize(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn status_codes_are_classified() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_once() {
        let calls = AtomicUsize::new(0);
        let (output, errors) = run_with_retries(1, 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    RetryResult::Transient {
                        input: (),
                        error: anyhow!("busy"),
                    }
                } else {
                    retry_result_ok("done")
                }
            }
        })
        .await;
        assert_eq!(output, Some("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let (output, errors) = run_with_retries(1, 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { retry_result_fatal::<(), _>(anyhow!("bad key")) }
        })
        .await;
        assert!(output.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(errors[0].contains("bad key"));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let (output, errors) = run_with_retries(1, 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                RetryResult::<(), (), (), anyhow::Error>::Transient {
                    input: (),
                    error: anyhow!("still busy"),
                }
            }
        })
        .await;
        assert!(output.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!errors.is_empty());
    }
}
