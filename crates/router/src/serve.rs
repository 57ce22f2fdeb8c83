//! The serve loop: read frames, answer each request on its own task, and
//! push `list_changed` notifications when the snapshot revision moves.

use std::sync::Arc;

use {
    futures::StreamExt,
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    channel::MessageChannel,
    error::Result,
    server::{McpServer, list_changed_frames},
};

/// Serve `channel` until the peer closes it or `cancel` fires.
///
/// In-flight requests are allowed to finish before this returns. Upstream
/// shutdown is left to the caller.
pub async fn serve(
    server: Arc<McpServer>,
    channel: Arc<dyn MessageChannel>,
    cancel: CancellationToken,
) -> Result<()> {
    let notifier = spawn_notifier(Arc::clone(&server), Arc::clone(&channel), cancel.child_token());
    let mut requests = JoinSet::new();
    let mut frames = channel.frames();
    let mut outcome = Ok(());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                info!("serve loop cancelled");
                break;
            },
            frame = frames.next() => frame,
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "request task panicked");
                }
                continue;
            },
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "client channel read failed");
                outcome = Err(e);
                break;
            },
            None => {
                info!("client closed the channel");
                break;
            },
        };

        let server = Arc::clone(&server);
        let channel = Arc::clone(&channel);
        requests.spawn(async move {
            let Some(response) = server.handle_frame(&frame).await else {
                return;
            };
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    if let Err(e) = channel.send(&bytes).await {
                        warn!(error = %e, "failed to send response");
                    }
                },
                Err(e) => warn!(error = %e, "failed to encode response"),
            }
        });
    }

    drop(frames);
    while let Some(joined) = requests.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "request task panicked");
        }
    }
    notifier.abort();
    debug!("serve loop finished");
    outcome
}

fn spawn_notifier(
    server: Arc<McpServer>,
    channel: Arc<dyn MessageChannel>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut revisions = server.router().subscribe_revisions();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                },
            }
            let revision = *revisions.borrow_and_update();
            if !server.is_initialized() {
                debug!(revision, "revision changed before client initialized, not notifying");
                continue;
            }
            debug!(revision, "emitting list_changed notifications");
            for frame in list_changed_frames() {
                if let Err(e) = channel.send(&frame).await {
                    warn!(error = %e, "failed to send list_changed notification");
                    return;
                }
            }
        }
    })
}
