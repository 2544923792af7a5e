//! Keep-alive filler for long-running HTTP responses.
//!
//! A slow parse can outlive an idle-connection timeout. Wrapping the work in
//! this stream yields a filler byte immediately (so response headers flush),
//! then one filler per poll interval until the work finishes, then the real
//! payload. The work runs on its own spawned task, so it makes progress even
//! while the consumer is slow to poll.
//!
//! Dropping the stream cancels the *wait*, not the work: the spawned task is
//! detached and runs to its own completion. Callers that want disconnects to
//! cancel the work itself must wire that through explicitly.

use futures::stream::Stream;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The filler emitted while the wrapped work is still running.
pub const HEARTBEAT_FILLER: &str = " ";

enum Phase {
    Initial,
    Waiting,
    Done,
}

/// Wrap `task` in a stream of keep-alive filler ending in its output.
pub fn wrap<F>(task: F, interval: Duration) -> impl Stream<Item = String>
where
    F: Future<Output = String> + Send + 'static,
{
    wrap_handle(tokio::spawn(task), interval)
}

/// Like [`wrap`], for work the caller has already spawned (keeping an abort
/// handle on their side).
pub fn wrap_handle(handle: JoinHandle<String>, interval: Duration) -> impl Stream<Item = String> {
    futures::stream::unfold(
        (handle, Phase::Initial),
        move |(mut handle, phase)| async move {
            match phase {
                Phase::Initial => {
                    debug!("Sending connection heartbeat");
                    Some((HEARTBEAT_FILLER.to_string(), (handle, Phase::Waiting)))
                }
                Phase::Waiting => match tokio::time::timeout(interval, &mut handle).await {
                    Ok(Ok(payload)) => Some((payload, (handle, Phase::Done))),
                    Ok(Err(join_error)) => {
                        // The work panicked or was aborted; there is no
                        // payload to deliver.
                        error!(%join_error, "Wrapped task did not complete");
                        None
                    }
                    Err(_still_running) => {
                        debug!("Sending connection heartbeat");
                        Some((HEARTBEAT_FILLER.to_string(), (handle, Phase::Waiting)))
                    }
                },
                Phase::Done => None,
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_first_item_is_immediate_filler() {
        let stream = wrap(
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "payload".to_string()
            },
            Duration::from_millis(10),
        );
        futures::pin_mut!(stream);
        let first = stream.next().await.unwrap();
        assert_eq!(first, HEARTBEAT_FILLER);
    }

    #[tokio::test]
    async fn test_fillers_then_payload() {
        let stream = wrap(
            async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                "the result".to_string()
            },
            Duration::from_millis(20),
        );
        let items: Vec<String> = stream.collect().await;

        assert!(items.len() >= 3, "expected fillers before payload: {items:?}");
        assert_eq!(items.last().unwrap(), "the result");
        for filler in &items[..items.len() - 1] {
            assert_eq!(filler, HEARTBEAT_FILLER);
        }
    }

    #[tokio::test]
    async fn test_fast_task_yields_filler_and_payload() {
        let stream = wrap(async { "quick".to_string() }, Duration::from_secs(10));
        let items: Vec<String> = stream.collect().await;
        assert_eq!(items, vec![HEARTBEAT_FILLER.to_string(), "quick".to_string()]);
    }

    #[tokio::test]
    async fn test_aborted_task_ends_stream_without_payload() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "never".to_string()
        });
        handle.abort();
        let stream = wrap_handle(handle, Duration::from_millis(10));
        let items: Vec<String> = stream.collect().await;
        assert_eq!(items, vec![HEARTBEAT_FILLER.to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_stream_leaves_work_running() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stream = wrap(
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let _ = tx.send(());
                "done".to_string()
            },
            Duration::from_millis(5),
        );
        futures::pin_mut!(stream);
        let _ = stream.next().await;
        drop(stream);

        // The spawned work keeps going after the consumer disconnects.
        rx.await.expect("work should run to completion");
    }
}
