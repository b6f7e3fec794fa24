use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Polls `f` every `interval` until it returns `true`.
///
/// The first check happens immediately. Returns `Ok(false)` once `timeout` elapses and
/// [`Error::Cancelled`] when `token` is cancelled first. Errors from `f` are returned as they are.
pub async fn wait_until_true<F, Fut>(
    token: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    mut f: F,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = &mut deadline => return Ok(false),
            _ = ticker.tick() => {}
        }

        let done = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            done = f() => done?,
        };
        if done {
            return Ok(true);
        }
    }
}
