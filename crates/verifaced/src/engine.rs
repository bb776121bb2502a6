use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use veriface_core::{
    BackendSet, BackendStatus, DescriptorStore, EngineConfig, FailureKind, ImageInput,
    VerificationEngine, VerificationResult, VerifyRequest, VideoRequest, VideoVerificationResult,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Verify {
        request: VerifyRequest,
        reply: oneshot::Sender<VerificationResult>,
    },
    VerifyFrames {
        frames: Vec<Vec<u8>>,
        request: VideoRequest,
        reply: oneshot::Sender<VideoVerificationResult>,
    },
    Enroll {
        identity: String,
        image: ImageInput,
        request_id: Option<String>,
        deadline: Instant,
        reply: oneshot::Sender<VerificationResult>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
    statuses: Arc<Vec<BackendStatus>>,
}

impl EngineHandle {
    /// Backend availability, resolved when the engine was spawned.
    pub fn statuses(&self) -> &[BackendStatus] {
        &self.statuses
    }

    /// Verify one image, giving up after the configured timeout.
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationResult, EngineError> {
        let request_id = request.options.request_id.clone();
        let request = request.deadline(Instant::now() + self.timeout);

        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Verify { request, reply }).await?;
        self.await_reply(rx, || timed_out(request_id)).await
    }

    /// Verify a frame sequence under one overall timeout.
    pub async fn verify_frames(
        &self,
        frames: Vec<Vec<u8>>,
        mut request: VideoRequest,
    ) -> Result<VideoVerificationResult, EngineError> {
        let request_id = request.request_id.clone();
        let frame_count = frames.len();
        request.deadline = Some(Instant::now() + self.timeout);

        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::VerifyFrames { frames, request, reply }).await?;
        self.await_reply(rx, || {
            tracing::warn!(request_id = ?request_id, frame_count, "frame sequence timed out");
            VideoVerificationResult {
                success: false,
                confidence: 0.0,
                frames_processed: 0,
                success_rate: 0.0,
                face_id: None,
                message: TIMEOUT_MESSAGE.into(),
                request_id,
                error: Some(FailureKind::BackendTimeout),
                frames: Vec::new(),
            }
        })
        .await
    }

    /// Detect a face and store it for `identity`.
    pub async fn enroll(
        &self,
        identity: String,
        image: ImageInput,
        request_id: Option<String>,
    ) -> Result<VerificationResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Enroll {
            identity,
            image,
            request_id: request_id.clone(),
            deadline: Instant::now() + self.timeout,
            reply,
        })
        .await?;
        self.await_reply(rx, || timed_out(request_id)).await
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Wait for the engine's reply.
    ///
    /// The engine checks the same deadline before every store write, but a
    /// write that starts just before it can still land after the caller has
    /// been told the request timed out. The late reply is drained in the
    /// background and any record it committed is logged.
    async fn await_reply<T>(
        &self,
        mut rx: oneshot::Receiver<T>,
        on_timeout: impl FnOnce() -> T,
    ) -> Result<T, EngineError>
    where
        T: LateReply + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed),
            Err(_) => {
                drain_late_reply(rx);
                Ok(on_timeout())
            }
        }
    }
}

/// A reply that may report a record written by the engine.
trait LateReply {
    fn committed_record(&self) -> Option<Uuid>;
}

impl LateReply for VerificationResult {
    fn committed_record(&self) -> Option<Uuid> {
        if self.success && !self.matched {
            self.record_id
        } else {
            None
        }
    }
}

impl LateReply for VideoVerificationResult {
    fn committed_record(&self) -> Option<Uuid> {
        self.face_id
    }
}

fn drain_late_reply<T>(rx: oneshot::Receiver<T>) -> tokio::task::JoinHandle<Option<Uuid>>
where
    T: LateReply + Send + 'static,
{
    tokio::spawn(async move {
        let record_id = rx.await.ok()?.committed_record()?;
        tracing::warn!(%record_id, "record committed after the caller timed out");
        Some(record_id)
    })
}

const TIMEOUT_MESSAGE: &str = "Verification timed out";

fn timed_out(request_id: Option<String>) -> VerificationResult {
    tracing::warn!(request_id = ?request_id, "request timed out");
    VerificationResult::failure(FailureKind::BackendTimeout, TIMEOUT_MESSAGE, request_id)
}

/// Spawn the verification engine on a dedicated OS thread.
///
/// Backends are resolved by the caller; the thread owns them and serves
/// requests one at a time until every handle is dropped.
pub fn spawn_engine<S>(
    backends: BackendSet,
    store: Arc<S>,
    config: EngineConfig,
    timeout: Duration,
) -> Result<EngineHandle, EngineError>
where
    S: DescriptorStore + ?Sized + 'static,
{
    let mut engine = VerificationEngine::new(backends, store, config);
    let statuses = Arc::new(engine.backend_statuses());
    for status in statuses.iter() {
        tracing::info!(
            backend = %status.name,
            tier = ?status.tier,
            available = status.available,
            "backend registered"
        );
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("veriface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify { request, reply } => {
                        let _ = reply.send(engine.verify(request));
                    }
                    EngineRequest::VerifyFrames { frames, request, reply } => {
                        let _ = reply.send(engine.verify_frames(frames, &request));
                    }
                    EngineRequest::Enroll {
                        identity,
                        image,
                        request_id,
                        deadline,
                        reply,
                    } => {
                        let result =
                            engine.enroll_until(&identity, image, request_id, Some(deadline));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout, statuses })
}
