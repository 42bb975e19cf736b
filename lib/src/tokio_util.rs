//! Helpers for bridging blocking import code with Tokio.

use std::fmt::{Debug, Display};
use std::future::Future;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Await `f`, returning an error early if `token` is cancelled.
pub async fn run_with_cancellation<F, R>(f: F, token: &CancellationToken) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    if token.is_cancelled() {
        anyhow::bail!("Operation was cancelled");
    }
    tokio::select! {
       r = f => r,
       _ = token.cancelled() => {
           Err(anyhow::anyhow!("Operation was cancelled"))
       }
    }
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Wrapper for [`tokio::task::spawn_blocking`] which hands the closure a
/// child of `parent` that is also cancelled when the returned future is
/// dropped.
///
/// Blocking code cannot be interrupted from outside; it is expected to poll
/// the token at convenient points, which bounds how long an abandoned task
/// keeps a blocking thread busy.
pub async fn spawn_blocking_cancellable<F, R>(parent: &CancellationToken, f: F) -> Result<R>
where
    F: FnOnce(&CancellationToken) -> R + Send + 'static,
    R: Send + 'static,
{
    let token = parent.child_token();
    let _dropper = CancelOnDrop(token.clone());
    let r = tokio::task::spawn_blocking(move || f(&token)).await;
    flatten_join(r)
}

fn flatten_join<R, E>(r: std::result::Result<R, E>) -> Result<R>
where
    E: Display + Debug + Send + Sync + 'static,
{
    r.map_err(|e| anyhow::anyhow!("Blocking task failed: {e}"))
}
