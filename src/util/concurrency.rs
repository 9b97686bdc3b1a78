//! Bounded-concurrency fan-out for batch operations over a set of items that
//! each do their own I/O (a reaper cycle's per-session checks, a directory
//! scan's per-entry stat). Grounded in the teacher's
//! `services::legacy::job_queue::process_concurrent`, trimmed to the one
//! shape this design needs — no queue, no chunking delay, just a permit per
//! in-flight item.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Run `processor` over every item in `items`, with at most `max_concurrent`
/// invocations in flight at once. Order of results is not preserved.
pub async fn process_concurrent<T, F, Fut, R>(
    items: impl IntoIterator<Item = T>,
    max_concurrent: usize,
    processor: F,
) -> Vec<R>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = R> + Send,
    R: Send + 'static,
{
    use futures::stream::{self, StreamExt};

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    stream::iter(items)
        .map(|item| {
            let sem = semaphore.clone();
            let proc = processor.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                proc(item).await
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await
}
