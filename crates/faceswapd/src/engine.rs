use crate::backend::FaceBackend;
use crate::error::SwapError;
use crate::imaging::ImageFetcher;
use crate::pipeline::{Pipeline, RequestContext, SwapOutput, SwapRequest};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Messages sent from the service to the engine thread.
enum EngineRequest {
    Swap {
        request: SwapRequest,
        ctx: RequestContext,
        reply: oneshot::Sender<Result<SwapOutput, SwapError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Submit a swap and wait at most `timeout` for its result.
    ///
    /// Admission never waits: when the queue is full the request is rejected
    /// with [`SwapError::Busy`]. On timeout the request is flagged cancelled so
    /// the engine abandons it at its next checkpoint.
    pub async fn swap(&self, request: SwapRequest, timeout: Duration) -> Result<SwapOutput, SwapError> {
        let ctx = RequestContext::new(timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(EngineRequest::Swap {
                request,
                ctx: ctx.clone(),
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(request = %ctx.id, "engine queue full; rejecting");
                    SwapError::Busy
                }
                mpsc::error::TrySendError::Closed(_) => SwapError::Inference("engine thread exited".into()),
            })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SwapError::Inference("engine thread exited".into())),
            Err(_) => {
                ctx.cancel();
                tracing::warn!(request = %ctx.id, timeout_secs = timeout.as_secs(), "swap timed out");
                Err(SwapError::Timeout(timeout.as_secs()))
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and runs one request at a time; up to
/// `queue_depth` further requests wait in the channel.
pub fn spawn_engine<B, F>(mut pipeline: Pipeline<B, F>, queue_depth: usize) -> EngineHandle
where
    B: FaceBackend + 'static,
    F: ImageFetcher + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("faceswap-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Swap { request, ctx, reply } => {
                        if reply.is_closed() || ctx.is_cancelled() {
                            tracing::debug!(request = %ctx.id, "skipping abandoned request");
                            continue;
                        }
                        let result = pipeline.process(&request, &ctx);
                        if let Err(e) = &result {
                            tracing::warn!(request = %ctx.id, kind = ?e.kind(), error = %e, "swap failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}
