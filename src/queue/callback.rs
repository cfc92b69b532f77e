use std::future::Future;

use futures::future::BoxFuture;

use crate::error::{QueueError, Result};

/// Adapts a queue operation to a completion callback.
///
/// The callback receives `(None, Some(value))` on success and
/// `(Some(error), None)` on failure, exactly once.
pub trait WithCallback<T>: Future<Output = Result<T>> + Sized {
    fn with_callback<'a, F>(self, callback: F) -> BoxFuture<'a, ()>
    where
        Self: Send + 'a,
        T: Send + 'a,
        F: FnOnce(Option<QueueError>, Option<T>) + Send + 'a;
}

impl<T, Fut> WithCallback<T> for Fut
where
    Fut: Future<Output = Result<T>>,
{
    fn with_callback<'a, F>(self, callback: F) -> BoxFuture<'a, ()>
    where
        Self: Send + 'a,
        T: Send + 'a,
        F: FnOnce(Option<QueueError>, Option<T>) + Send + 'a,
    {
        Box::pin(async move {
            match self.await {
                Ok(value) => callback(None, Some(value)),
                Err(e) => callback(Some(e), None),
            }
        })
    }
}
