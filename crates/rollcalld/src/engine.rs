use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset};
use rand::rngs::StdRng;
use rollcall_core::session::SessionError;
use rollcall_core::{
    AttendanceSession, DescriptorRepository, FrameInput, FrameOutcome, SessionConfig,
};
use rollcall_store::SqliteStore;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the intake loop to the engine thread.
enum EngineRequest {
    Frame {
        input: FrameInput,
        reply: oneshot::Sender<Result<FrameOutcome, EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// A frame accepted by the engine; resolves once its cycle completes.
pub struct PendingFrame {
    rx: oneshot::Receiver<Result<FrameOutcome, EngineError>>,
}

impl PendingFrame {
    pub async fn outcome(self) -> Result<FrameOutcome, EngineError> {
        self.rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    busy: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Hand a frame to the engine unless a cycle is already in flight.
    ///
    /// Returns `Ok(None)` when the frame was dropped. Frames are never queued.
    pub fn try_submit(&self, input: FrameInput) -> Result<Option<PendingFrame>, EngineError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            tracing::debug!(index = input.index, "engine busy, frame skipped");
            return Ok(None);
        }
        let (reply, rx) = oneshot::channel();
        match self.tx.try_send(EngineRequest::Frame { input, reply }) {
            Ok(()) => Ok(Some(PendingFrame { rx })),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                Ok(None)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.busy.store(false, Ordering::Release);
                Err(EngineError::ChannelClosed)
            }
        }
    }

    /// Discard tracks and in-progress challenges; keeps the session running.
    pub async fn reset(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reset { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Stop the session and let the engine thread exit.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stop { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Admits at most one frame per interval of capture time.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    last: Option<DateTime<FixedOffset>>,
}

impl FramePacer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::milliseconds(interval_ms as i64),
            last: None,
        }
    }

    /// A capture time earlier than the last admitted frame means the source
    /// clock stepped back; the pacer re-baselines on it instead of waiting
    /// for the old high-water mark.
    pub fn admit(&mut self, captured_at: DateTime<FixedOffset>) -> bool {
        match self.last {
            Some(last) if captured_at >= last && captured_at - last < self.interval => false,
            Some(last) if captured_at < last => {
                tracing::warn!(%last, %captured_at, "capture clock stepped back, pacing re-baselined");
                self.last = Some(captured_at);
                true
            }
            _ => {
                self.last = Some(captured_at);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the capture session and, through its repository, the
/// store connection. Every decision is written to the attendance log before
/// the frame's reply is sent.
pub fn spawn_engine(
    repository: DescriptorRepository<SqliteStore>,
    config: SessionConfig,
    rng: StdRng,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);
    let busy = Arc::new(AtomicBool::new(false));
    let thread_busy = Arc::clone(&busy);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut session = AttendanceSession::new(repository, config, rng);
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Frame { input, reply } => {
                        let result = run_cycle(&mut session, input);
                        thread_busy.store(false, Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reset { reply } => {
                        session.reset();
                        let _ = reply.send(());
                    }
                    EngineRequest::Stop { reply } => {
                        session.stop();
                        rx.close();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, busy })
}

fn run_cycle(
    session: &mut AttendanceSession<SqliteStore, StdRng>,
    input: FrameInput,
) -> Result<FrameOutcome, EngineError> {
    let outcome = session.process(input)?;
    if let Some(err) = &outcome.repository_error {
        tracing::error!(frame = outcome.index, error = %err, "descriptor repository unavailable");
    }
    for decision in &outcome.decisions {
        if let Err(e) = session.repository().store().insert_decision(decision) {
            tracing::error!(decision_id = %decision.id, error = %e, "failed to log decision");
        }
    }
    Ok(outcome)
}
