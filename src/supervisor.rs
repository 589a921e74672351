//! Child process supervision
//!
//! Each pattern worker and the actuation driver run as separate processes of
//! this same binary. The orchestrator talks to a child through a [`ChildLink`]:
//! requests are queued to a writer thread that owns the child's stdin, and
//! replies come back on its stdout through a reader thread. Neither direction
//! ever blocks the frame loop: a child that stops reading fills the bounded
//! request queue and further sends fail, and replies are awaited with a timeout.
//!
//! ```text
//! Orchestrator                      Child process
//!   try_send → bounded channel → writer thread
//!      |--- IpcMessage (stdin) ------->|
//!      |                               |  render / actuate
//!      |<-- IpcMessage (stdout) -------|
//!   reader thread → crossbeam channel → recv_timeout
//! ```

use crate::error::{Error, Result};
use crate::ipc::IpcMessage;
use crossbeam::channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often exit status is polled while waiting out the grace period
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Requests that may wait for a child to read them before sends start failing
pub const REQUEST_QUEUE_DEPTH: usize = 8;

/// Builds the command lines for child processes
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    verbose: bool,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            verbose: false,
        }
    }

    /// Children re-run the currently executing binary
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn base(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.verbose {
            cmd.arg("--verbose");
        }
        cmd
    }

    pub fn worker(&self, index: usize, pattern: &str) -> Command {
        let mut cmd = self.base();
        cmd.arg("worker")
            .arg("--index")
            .arg(index.to_string())
            .arg("--pattern")
            .arg(pattern);
        cmd
    }

    pub fn driver(&self, config: &Path) -> Command {
        let mut cmd = self.base();
        cmd.arg("driver").arg("--config").arg(config);
        cmd
    }
}

/// Orchestrator-side end of a private duplex channel to one child
pub struct ChildLink {
    name: String,
    requests: Option<Sender<IpcMessage>>,
    replies: Receiver<IpcMessage>,
    reader: Option<JoinHandle<()>>,
    process: Option<Child>,
    peer_gone: bool,
}

impl ChildLink {
    /// Wrap an already connected reader/writer pair.
    ///
    /// `process` is the child on the other end, if any; without one the
    /// peer is assumed to live elsewhere (another thread, a test harness).
    pub fn new(
        name: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        process: Option<Child>,
    ) -> Result<Self> {
        let name = name.into();
        let (request_tx, request_rx) = bounded::<IpcMessage>(REQUEST_QUEUE_DEPTH);
        let log_name = name.clone();

        // Detached: it ends once the queue is closed or the peer stops accepting writes
        thread::Builder::new()
            .name(format!("{}-writer", name))
            .spawn(move || {
                let mut writer = writer;
                for msg in request_rx.iter() {
                    if let Err(e) = msg.send(&mut writer) {
                        debug!("{}: request stream closed: {}", log_name, e);
                        break;
                    }
                }
            })?;

        let (tx, rx) = unbounded();
        let thread_name = format!("{}-reader", name);
        let log_name = name.clone();

        let reader = thread::Builder::new().name(thread_name).spawn(move || {
            let mut reader = reader;
            loop {
                match IpcMessage::receive(&mut reader) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(Error::Codec(e)) | Err(Error::Protocol(e)) => {
                        warn!("{}: dropping undecodable reply: {}", log_name, e);
                    }
                    Err(e) => {
                        debug!("{}: reply stream ended: {}", log_name, e);
                        break;
                    }
                }
            }
        })?;

        Ok(Self {
            name,
            requests: Some(request_tx),
            replies: rx,
            reader: Some(reader),
            process,
            peer_gone: false,
        })
    }

    /// Spawn `cmd` with piped stdin/stdout and link to it.
    ///
    /// The child gets its own process group so a terminal Ctrl-C reaches only
    /// the orchestrator, which then shuts children down in order.
    pub fn spawn(name: impl Into<String>, mut cmd: Command) -> Result<Self> {
        let name = name.into();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Channel(format!("{}: child pipes unavailable", name)));
        };

        info!("Started {} with PID: {}", name, child.id());
        Self::new(name, Box::new(stdout), Box::new(stdin), Some(child))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.id())
    }

    /// Queue one message for the child without blocking.
    ///
    /// Fails when the request queue is full (the child is not reading) or
    /// when the child's input has closed; only the latter disconnects the link.
    pub fn send(&mut self, msg: &IpcMessage) -> Result<()> {
        let Some(requests) = self.requests.as_ref() else {
            return Err(Error::Channel(format!("{}: channel already closed", self.name)));
        };
        match requests.try_send(msg.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Channel(format!(
                "{}: {} requests already waiting, peer is not reading",
                self.name, REQUEST_QUEUE_DEPTH
            ))),
            Err(TrySendError::Disconnected(_)) => {
                self.peer_gone = true;
                Err(Error::Channel(format!("{}: peer stopped reading", self.name)))
            }
        }
    }

    /// Take a reply that has already arrived, if any
    pub fn try_recv(&mut self) -> Result<Option<IpcMessage>> {
        match self.replies.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.peer_gone = true;
                Err(Error::Channel(format!("{}: peer disconnected", self.name)))
            }
        }
    }

    /// Wait for the next reply, up to `timeout`
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<IpcMessage> {
        match self.replies.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(Error::Channel(format!(
                "{}: no reply within {:?}",
                self.name, timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                self.peer_gone = true;
                Err(Error::Channel(format!("{}: peer disconnected", self.name)))
            }
        }
    }

    /// True once either stream has ended and every reply was consumed
    pub fn is_disconnected(&self) -> bool {
        self.peer_gone
    }

    /// Close the request queue; the child sees end-of-stream once the
    /// writer thread has flushed what was already queued
    pub fn close(&mut self) {
        self.requests = None;
    }

    fn has_exited(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => self.reader.as_ref().map_or(true, |r| r.is_finished()),
        }
    }

    /// Kill (if still running) and reap the child without a timeout
    fn kill_and_reap(&mut self) {
        if let Some(mut child) = self.process.take() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("Force killing {}...", self.name);
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }

    /// Join the reply reader. A reaped process always closes its stdout, so
    /// `blocking` joins unconditionally; otherwise only a finished reader is joined.
    fn join_reader(&mut self, blocking: bool) {
        if let Some(reader) = self.reader.take() {
            if blocking || reader.is_finished() {
                let _ = reader.join();
            } else {
                self.reader = Some(reader);
            }
        }
    }
}

impl Drop for ChildLink {
    fn drop(&mut self) {
        self.requests = None;
        self.kill_and_reap();
    }
}

/// Stop every linked child.
///
/// Sends the shutdown sentinel to all of them, closes every channel, then
/// gives them until `grace` has elapsed to exit on their own. Anything still
/// running afterwards is killed and waited on unconditionally, so no child
/// outlives this call.
pub fn shutdown_links<'a, I>(links: I, grace: Duration)
where
    I: IntoIterator<Item = &'a mut ChildLink>,
{
    let mut links: Vec<&mut ChildLink> = links.into_iter().collect();

    for link in links.iter_mut() {
        if let Err(e) = link.send(&IpcMessage::Shutdown) {
            debug!("{}: shutdown not delivered: {}", link.name, e);
        }
        link.close();
    }

    let deadline = Instant::now() + grace;
    loop {
        let mut pending = 0;
        for link in links.iter_mut() {
            if !link.has_exited() {
                pending += 1;
            }
        }
        if pending == 0 || Instant::now() >= deadline {
            break;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }

    for link in links.iter_mut() {
        let owns_process = link.process.is_some();
        if !owns_process && !link.has_exited() {
            error!("{}: in-process peer did not stop within {:?}", link.name, grace);
        }
        link.kill_and_reap();
        link.join_reader(owns_process);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn linked_pair(name: &str) -> (ChildLink, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let link = ChildLink::new(
            name,
            Box::new(ours.try_clone().unwrap()),
            Box::new(ours),
            None,
        )
        .unwrap();
        (link, theirs)
    }

    #[test]
    fn test_reply_arrives_through_reader_thread() {
        let (mut link, mut peer) = linked_pair("test-peer");
        IpcMessage::Skipped { frame: 3 }.send(&mut peer).unwrap();
        assert_eq!(
            link.recv_timeout(Duration::from_secs(1)).unwrap(),
            IpcMessage::Skipped { frame: 3 }
        );
    }

    #[test]
    fn test_recv_timeout_without_reply() {
        let (mut link, _peer) = linked_pair("quiet-peer");
        let started = Instant::now();
        let err = link.recv_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_peer_close_disconnects() {
        let (mut link, peer) = linked_pair("closing-peer");
        drop(peer);
        let err = link.recv_timeout(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("disconnected"));
        assert!(link.is_disconnected());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut link, _peer) = linked_pair("closed-link");
        link.close();
        assert!(link.send(&IpcMessage::Shutdown).is_err());
    }

    #[test]
    fn test_send_never_blocks_on_a_peer_that_stops_reading() {
        let (mut link, _peer) = linked_pair("stuck-peer");
        let msg = IpcMessage::FrameData {
            frame: 0,
            values: crate::frame::FrameVector::uniform(0.5),
        };

        // Far more than the socket buffer plus the queue can hold
        let started = Instant::now();
        let mut refused = 0;
        for _ in 0..20_000 {
            if let Err(e) = link.send(&msg) {
                assert!(matches!(e, Error::Channel(_)));
                refused += 1;
            }
        }
        assert!(refused > 0);
        assert!(!link.is_disconnected());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_queued_requests_arrive_in_order() {
        let (mut link, mut peer) = linked_pair("ordered-peer");
        for frame in 1..=3 {
            link.send(&IpcMessage::StartFrame { frame, value: 0.0 }).unwrap();
        }
        // Closing the queue still flushes the backlog
        link.close();
        for frame in 1..=3 {
            assert_eq!(
                IpcMessage::receive(&mut peer).unwrap(),
                IpcMessage::StartFrame { frame, value: 0.0 }
            );
        }
        assert!(link.send(&IpcMessage::Shutdown).is_err());
    }

    #[test]
    fn test_try_recv_does_not_wait() {
        let (mut link, mut peer) = linked_pair("polled-peer");
        assert_eq!(link.try_recv().unwrap(), None);

        IpcMessage::Skipped { frame: 7 }.send(&mut peer).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut reply = None;
        while reply.is_none() && Instant::now() < deadline {
            reply = link.try_recv().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reply, Some(IpcMessage::Skipped { frame: 7 }));
    }

    #[test]
    fn test_shutdown_delivers_sentinel_to_thread_peer() {
        let (mut link, mut peer) = linked_pair("thread-peer");
        let handle = thread::spawn(move || IpcMessage::receive(&mut peer).unwrap());

        shutdown_links([&mut link], Duration::from_secs(1));

        assert_eq!(handle.join().unwrap(), IpcMessage::Shutdown);
    }

    #[test]
    fn test_worker_command_line() {
        let cmd = ChildCommand::new("/usr/bin/birdbath").verbose(true).worker(2, "amplitude");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["--verbose", "worker", "--index", "2", "--pattern", "amplitude"]);
    }
}
