//! Bounded Waits on Downstream Tasks
//!
//! Asynchronous device operations publish their state on a `watch` channel.
//! A wait resolves on the first terminal state, and fails when the limit
//! expires, the engine shuts down or the publisher goes away.

use crate::domain::ports::TaskState;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Wait for `rx` to reach a terminal state within `limit`.
///
/// Returns the terminal state, which may be `Error` or `Cancelled`; the
/// caller decides how those map onto step failure.
pub async fn wait_for_terminal(
    task: &str,
    mut rx: watch::Receiver<TaskState>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<TaskState> {
    let terminal = async {
        rx.wait_for(|state| state.is_terminal())
            .await
            .map(|state| (*state).clone())
            .map_err(|_| Error::TaskFailed {
                task: task.to_string(),
                reason: "task status channel closed".into(),
            })
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(format!("wait for task {}", task))),
        res = tokio::time::timeout(limit, terminal) => match res {
            Ok(state) => state,
            Err(_) => Err(Error::TaskTimeout {
                task: task.to_string(),
                timeout: limit,
            }),
        },
    }
}

/// Map a terminal task state onto a step result
pub fn into_result(task: &str, state: TaskState) -> Result<()> {
    match state {
        TaskState::Ready => Ok(()),
        TaskState::Error(reason) => Err(Error::TaskFailed {
            task: task.to_string(),
            reason,
        }),
        TaskState::Cancelled => Err(Error::TaskFailed {
            task: task.to_string(),
            reason: "task was cancelled".into(),
        }),
        other => Err(Error::Internal(format!(
            "task {} reported non-terminal state {:?}",
            task, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_resolves_on_terminal_state() {
        let (tx, rx) = watch::channel(TaskState::Queued);
        let cancel = CancellationToken::new();

        tokio::spawn(async move {
            tx.send_replace(TaskState::Running);
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.send_replace(TaskState::Ready);
            // keep the sender alive until the receiver has seen the update
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let state = wait_for_terminal("t1", rx, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Ready);
        assert!(into_result("t1", state).is_ok());
    }

    #[tokio::test]
    async fn test_times_out() {
        let (_tx, rx) = watch::channel(TaskState::Running);
        let cancel = CancellationToken::new();
        let res = wait_for_terminal("t2", rx, Duration::from_millis(20), &cancel).await;
        assert_matches!(res, Err(Error::TaskTimeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_and_closed_channel() {
        let (tx, rx) = watch::channel(TaskState::Running);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = wait_for_terminal("t3", rx, Duration::from_secs(5), &cancel).await;
        assert_matches!(res, Err(Error::Cancelled(_)));
        drop(tx);

        let (tx, rx) = watch::channel(TaskState::Running);
        drop(tx);
        let res = wait_for_terminal("t4", rx, Duration::from_secs(5), &CancellationToken::new()).await;
        assert_matches!(res, Err(Error::TaskFailed { .. }));
    }

    #[test]
    fn test_error_state_maps_to_failure() {
        assert_matches!(
            into_result("t5", TaskState::Error("export refused".into())),
            Err(Error::TaskFailed { reason, .. }) if reason == "export refused"
        );
    }
}
