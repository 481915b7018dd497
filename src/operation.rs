//! Cancellable handles for spawned DHT operations.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DhtError, DhtResult};

/// A spawned operation that can be awaited or cancelled.
///
/// The task receives a child of the caller's token. Sub-operations started by
/// the task take children of that token in turn, so one `cancel` reaches the
/// whole tree. Cancelling a finished operation does nothing.
#[derive(Debug)]
pub struct Operation<T> {
    token: CancellationToken,
    handle: JoinHandle<DhtResult<T>>,
}

impl<T: Send + 'static> Operation<T> {
    /// Spawn `f` on the runtime under a child of `parent`.
    pub fn spawn<F, Fut>(parent: &CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = DhtResult<T>> + Send + 'static,
    {
        let token = parent.child_token();
        let task = f(token.clone());
        let guard = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => Err(DhtError::Cancelled),
                result = task => result,
            }
        });
        Self { token, handle }
    }
}

impl<T> Operation<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Token observed by this operation and its sub-operations.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Wait for the result.
    pub async fn join(self) -> DhtResult<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(DhtError::Cancelled),
            Err(err) => Err(err.into()),
        }
    }
}

/// Run `fut` until it finishes or `token` is cancelled.
pub(crate) async fn with_cancel<T, F>(token: &CancellationToken, fut: F) -> DhtResult<T>
where
    F: Future<Output = DhtResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DhtError::Cancelled),
        result = fut => result,
    }
}
