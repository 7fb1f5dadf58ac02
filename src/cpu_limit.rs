//! Tools for limiting the number of concurrent CPU-bound tasks.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Semaphore used to limit the number of concurrent `tesseract` processes.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// We do this to limit the number of external processes that are each trying
/// to use 100% of a CPU core. In-process work like image conversion goes
/// through `spawn_blocking` instead.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_cpu_count() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let tasks = (0..num_cpus::get() * 3).map(|_| {
            with_cpu_semaphore(|| async {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= num_cpus::get());
    }
}
