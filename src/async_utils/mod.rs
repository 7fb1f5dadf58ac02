//! Asynchronous utilities for use with Tokio.
//!
//! Most of the pipeline is plain `async fn` code. The few places where we need
//! to deal with boxed futures, external processes or cancellation live here.

use std::{pin::Pin, process::Output, time::Duration};

use futures::FutureExt as _;
use tokio::time;

use crate::prelude::*;

pub mod cancel;
pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<'fut, Output> = Pin<Box<dyn Future<Output = Output> + Send + 'fut>>;

/// Error returned by [`with_timeout`].
#[derive(Debug)]
pub struct TimedOut {
    /// How long we waited.
    pub after: Duration,
}

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request timed out after {:.1}s", self.after.as_secs_f64())
    }
}

impl std::error::Error for TimedOut {}

/// Run `future` with a timeout.
///
/// If the timeout fires, the future is dropped, which releases whatever it was
/// holding (connections, semaphore permits, rate limit slots).
pub fn with_timeout<'fut, T>(
    timeout: Duration,
    future: impl Future<Output = T> + Send + 'fut,
) -> BoxedFuture<'fut, Result<T, TimedOut>>
where
    T: Send + 'fut,
{
    time::timeout(timeout, future)
        .map(move |result| result.map_err(|_| TimedOut { after: timeout }))
        .boxed()
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `trace` and `debug`
/// respectively, because OCR tools are chatty on stderr even when they
/// succeed.
pub fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %String::from_utf8_lossy(&output.stdout),
        "Standard output from command"
    );
    debug!(
        command_name = command_name,
        output = %stderr,
        "Standard error from command",
    );

    if output.status.success() {
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
