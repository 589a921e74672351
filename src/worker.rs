//! Pattern workers
//!
//! A worker hosts exactly one [`Pattern`] in its own process and answers
//! render requests from the orchestrator in lock-step:
//!
//! ```text
//! Starting → Ready → AwaitingRequest ⇄ Rendering
//!                          │
//!            shutdown / channel closed
//!                          ↓
//!                    ShuttingDown → Terminated
//! ```
//!
//! [`WorkerHandle`] is the orchestrator's side of that conversation.

use crate::config::PatternSpec;
use crate::error::{Error, Result};
use crate::frame::FrameVector;
use crate::ipc::IpcMessage;
use crate::pattern::{Pattern, PatternKind, Rendered};
use crate::supervisor::ChildLink;
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a pattern worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    AwaitingRequest,
    Rendering,
    ShuttingDown,
    Terminated,
}

/// Worker-side loop around one pattern instance
pub struct PatternWorker {
    index: usize,
    pattern: Box<dyn Pattern>,
    state: WorkerState,
    frames_rendered: u64,
}

impl PatternWorker {
    /// Resolve the pattern by name. Failure is fatal for this worker only.
    pub fn new(index: usize, pattern_name: &str) -> Result<Self> {
        let kind = PatternKind::from_name(pattern_name)?;
        Ok(Self::with_pattern(index, kind.build()))
    }

    pub fn with_pattern(index: usize, pattern: Box<dyn Pattern>) -> Self {
        Self {
            index,
            pattern,
            state: WorkerState::Starting,
            frames_rendered: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("Worker {} {:?} -> {:?}", self.index, self.state, next);
        self.state = next;
    }

    /// Serve requests until shutdown or until the channel closes.
    ///
    /// Returns the final state, which is always [`WorkerState::Terminated`].
    pub fn run<R: Read, W: Write>(&mut self, mut reader: R, mut writer: W) -> WorkerState {
        let ready = IpcMessage::Ready {
            pattern: self.pattern.name().to_string(),
        };
        self.transition(WorkerState::Ready);
        if let Err(e) = ready.send(&mut writer) {
            error!("Worker {} could not announce readiness: {}", self.index, e);
            self.transition(WorkerState::ShuttingDown);
            self.transition(WorkerState::Terminated);
            return self.state;
        }
        info!(
            "Worker {} ready with pattern {}",
            self.index,
            self.pattern.name()
        );

        self.transition(WorkerState::AwaitingRequest);
        while self.state == WorkerState::AwaitingRequest {
            match IpcMessage::receive(&mut reader) {
                Ok(IpcMessage::StartFrame { frame, value }) => {
                    self.transition(WorkerState::Rendering);
                    let reply = self.render(frame, value);
                    match reply.send(&mut writer) {
                        Ok(()) => self.transition(WorkerState::AwaitingRequest),
                        Err(e) => {
                            warn!("Worker {} lost its channel: {}", self.index, e);
                            self.transition(WorkerState::ShuttingDown);
                        }
                    }
                }
                Ok(IpcMessage::Shutdown) => {
                    info!(
                        "Worker {} ({}) received shutdown signal",
                        self.index,
                        self.pattern.name()
                    );
                    self.transition(WorkerState::ShuttingDown);
                }
                Ok(other) => {
                    warn!("Worker {} received unknown command: {}", self.index, other.kind());
                }
                Err(Error::Codec(e)) | Err(Error::Protocol(e)) => {
                    warn!("Worker {} received invalid message: {}", self.index, e);
                }
                Err(e) => {
                    info!("Worker {} channel closed: {}", self.index, e);
                    self.transition(WorkerState::ShuttingDown);
                }
            }
        }

        drop(writer);
        self.transition(WorkerState::Terminated);
        self.state
    }

    fn render(&mut self, frame: u64, value: f64) -> IpcMessage {
        let pattern = &mut self.pattern;
        let outcome = catch_unwind(AssertUnwindSafe(|| pattern.render(value)));

        let reply = match outcome {
            Ok(Ok(rendered)) if rendered.is_finite() => match rendered {
                Rendered::Frame(values) => IpcMessage::Frame { frame, values },
                Rendered::Uniform(value) => IpcMessage::Scalar { frame, value },
            },
            Ok(Ok(_)) => {
                error!("Worker {} produced non-finite output for frame {}", self.index, frame);
                IpcMessage::Skipped { frame }
            }
            Ok(Err(e)) => {
                error!("Worker {} failed to render frame {}: {}", self.index, frame, e);
                IpcMessage::Skipped { frame }
            }
            Err(_) => {
                error!("Worker {} panicked rendering frame {}", self.index, frame);
                IpcMessage::Skipped { frame }
            }
        };

        self.frames_rendered += 1;
        if self.frames_rendered % 100 == 0 {
            info!(
                "Worker {} ({}) - Frame {}: rendered {}",
                self.index,
                self.pattern.name(),
                self.frames_rendered,
                reply.kind()
            );
        }
        reply
    }
}

/// Entry point of the `worker` subcommand.
///
/// Reports a pattern that cannot be resolved back to the orchestrator before
/// returning the error, so the caller can exit and close the channel.
pub fn serve<R: Read, W: Write>(index: usize, pattern_name: &str, reader: R, mut writer: W) -> Result<()> {
    info!("Starting pattern worker {} with pattern: {}", index, pattern_name);
    match PatternWorker::new(index, pattern_name) {
        Ok(mut worker) => {
            worker.run(reader, writer);
            Ok(())
        }
        Err(e) => {
            error!("Failed to create pattern {} (worker {}): {}", pattern_name, index, e);
            let failed = IpcMessage::StartupFailed {
                reason: e.to_string(),
            };
            let _ = failed.send(&mut writer);
            Err(e)
        }
    }
}

/// Orchestrator-side handle for one worker process
pub struct WorkerHandle {
    index: usize,
    spec: PatternSpec,
    link: ChildLink,
    disconnected: bool,
    /// Frame of the last request that has not been answered yet
    outstanding: Option<u64>,
}

impl WorkerHandle {
    pub fn new(index: usize, spec: PatternSpec, link: ChildLink) -> Self {
        Self {
            index,
            spec,
            link,
            disconnected: false,
            outstanding: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }

    pub fn link(&self) -> &ChildLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut ChildLink {
        &mut self.link
    }

    pub fn into_link(self) -> ChildLink {
        self.link
    }

    /// Wait for the worker's startup report
    pub fn handshake(&mut self, timeout: Duration) -> Result<()> {
        match self.link.recv_timeout(timeout)? {
            IpcMessage::Ready { pattern } => {
                info!("Worker {} ready ({})", self.index, pattern);
                Ok(())
            }
            IpcMessage::StartupFailed { reason } => Err(Error::Pattern(reason)),
            other => Err(Error::Protocol(format!(
                "worker {} sent {} before ready",
                self.index,
                other.kind()
            ))),
        }
    }

    /// Frame still waiting for an answer, if any
    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding
    }

    /// Send a render request for `frame`.
    ///
    /// Returns `Ok(false)` without sending anything while an earlier request
    /// is still unanswered, so a hung worker holds at most one request.
    pub fn request(&mut self, frame: u64, value: f64) -> Result<bool> {
        if self.disconnected {
            return Err(Error::Channel(format!("worker {} is disconnected", self.index)));
        }
        if let Some(pending) = self.outstanding {
            self.collect_late_replies(pending)?;
            if self.outstanding.is_some() {
                return Ok(false);
            }
        }

        match self.link.send(&IpcMessage::StartFrame { frame, value }) {
            Ok(()) => {
                self.outstanding = Some(frame);
                Ok(true)
            }
            Err(e) => {
                if self.link.is_disconnected() {
                    self.mark_disconnected(&e);
                }
                Err(e)
            }
        }
    }

    /// Drain replies that arrived after their frame timed out
    fn collect_late_replies(&mut self, pending: u64) -> Result<()> {
        loop {
            let reply = match self.link.try_recv() {
                Ok(Some(reply)) => reply,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.mark_disconnected(&e);
                    return Err(e);
                }
            };
            match reply.reply_frame() {
                Some(f) => {
                    debug!("Worker {} discarding late reply for frame {}", self.index, f);
                    if f >= pending {
                        self.outstanding = None;
                    }
                }
                None => warn!("Worker {} sent unexpected {}", self.index, reply.kind()),
            }
        }
    }

    /// Wait for this frame's reply.
    ///
    /// `Ok(None)` means the worker skipped the frame. Replies for earlier
    /// frames (late answers to requests that timed out) are discarded.
    pub fn await_response(&mut self, frame: u64, timeout: Duration) -> Result<Option<FrameVector>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = match self.link.recv_timeout(remaining) {
                Ok(reply) => reply,
                Err(e) => {
                    if self.link.is_disconnected() {
                        self.mark_disconnected(&e);
                    }
                    return Err(e);
                }
            };

            if reply.reply_frame() == Some(frame) {
                self.outstanding = None;
            }
            match reply {
                IpcMessage::Frame { frame: f, values } if f == frame => return Ok(Some(values)),
                IpcMessage::Scalar { frame: f, value } if f == frame => {
                    return Ok(Some(FrameVector::uniform(value)))
                }
                IpcMessage::Skipped { frame: f } if f == frame => return Ok(None),
                IpcMessage::Frame { frame: f, .. }
                | IpcMessage::Scalar { frame: f, .. }
                | IpcMessage::Skipped { frame: f } => {
                    debug!("Worker {} discarding stale reply for frame {}", self.index, f);
                }
                other => {
                    warn!("Worker {} sent unexpected {}", self.index, other.kind());
                }
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn mark_disconnected(&mut self, cause: &Error) {
        if !self.disconnected {
            error!(
                "Worker {} ({}) is no longer reachable: {}",
                self.index, self.spec.name, cause
            );
            self.disconnected = true;
        }
    }
}
