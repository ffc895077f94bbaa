use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::StoreError;

/// Caps the number of concurrently in-flight write transactions against the
/// pool. Sized at `Store::open` time, default derived from
/// `std::thread::available_parallelism()`. Reads never pass through this —
/// `sqlx` is async end-to-end, so there is no blocking-syscall-absorption
/// role for this pool to play, only admission control.
pub(crate) struct WriteWorker {
    semaphore: Arc<Semaphore>,
}

impl WriteWorker {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> WriteHandle
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("write worker semaphore never closed");
            future.await
        });
        WriteHandle(handle)
    }
}

/// Completion handle for a write scheduled via [`crate::store::Store::set_data`]
/// and friends. Detached semantics: dropping it without awaiting does not
/// cancel the underlying task — matching "no cancellation" in the
/// concurrency model.
pub struct WriteHandle(JoinHandle<Result<(), StoreError>>);

impl WriteHandle {
    pub async fn join(self) -> Result<(), StoreError> {
        match self.0.await {
            Ok(result) => result,
            Err(join_err) => Err(StoreError::consistency(format!("write task panicked or was cancelled: {join_err}"))),
        }
    }
}

impl IntoFuture for WriteHandle {
    type Output = Result<(), StoreError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.join())
    }
}
