//! Frame loop
//!
//! Once per interval the orchestrator:
//!
//! 1. polls the sensor channels,
//! 2. sends every live worker a render request for its input channel,
//! 3. waits for each reply in worker order (bounded by the worker timeout),
//! 4. sums the replies and clamps the result,
//! 5. forwards the aggregate to the driver process,
//! 6. publishes it as the snapshot file,
//! 7. sleeps out whatever is left of the interval.
//!
//! A worker that fails, times out or skips a frame simply contributes nothing
//! to that frame. A worker still busy with an unanswered frame is not asked
//! again until that answer turns up, and requests to children are queued
//! without blocking, so a hung child can never stall the loop. Overrunning the interval starts the next frame immediately;
//! missed frames are never made up.

use crate::config::{DriverConfig, LoopConfig, TIME_CHANNEL};
use crate::error::Result;
use crate::frame::{aggregate, FrameVector};
use crate::ipc::IpcMessage;
use crate::sensor::{open_fifo, ChannelReader};
use crate::snapshot::write_snapshot;
use crate::supervisor::{shutdown_links, ChildCommand, ChildLink};
use crate::worker::WorkerHandle;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long children get to exit on their own before being killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Floor for the startup handshake, which includes process start-up time
const MIN_STARTUP_WAIT: Duration = Duration::from_secs(2);

/// The `time` channel wraps at this many seconds
const TIME_WRAP_SECS: f64 = 100.0;

const STATUS_EVERY: u64 = 100;

/// Sensor reader over any non-blocking byte source
pub type SensorReader = ChannelReader<Box<dyn Read + Send>>;

/// Outcome of one frame
#[derive(Debug, Clone)]
pub struct TickReport {
    pub frame: u64,
    /// Workers whose output went into the sum
    pub contributors: usize,
    pub aggregate: FrameVector,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    workers: Vec<WorkerHandle>,
    driver: Option<ChildLink>,
    driver_lost: bool,
    driver_dropped: u64,
    sensors: Option<SensorReader>,
    snapshot_path: PathBuf,
    interval: Duration,
    worker_timeout: Duration,
    grace: Duration,
    started: Instant,
    frame: u64,
}

impl Orchestrator {
    /// An orchestrator with no workers, driver or sensors attached
    pub fn new(snapshot_path: impl Into<PathBuf>, interval: Duration, worker_timeout: Duration) -> Self {
        Self {
            workers: Vec::new(),
            driver: None,
            driver_lost: false,
            driver_dropped: 0,
            sensors: None,
            snapshot_path: snapshot_path.into(),
            interval,
            worker_timeout,
            grace: SHUTDOWN_GRACE,
            started: Instant::now(),
            frame: 0,
        }
    }

    pub fn with_worker(mut self, worker: WorkerHandle) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_driver(mut self, driver: ChildLink) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_sensors(mut self, sensors: SensorReader) -> Self {
        self.sensors = Some(sensors);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Validate configuration, open the sensor pipe and start every child.
    ///
    /// Configuration problems are fatal. A worker that fails its startup
    /// handshake is reported, stopped and left out of the run.
    pub fn launch(config: &LoopConfig, command: &ChildCommand) -> Result<Self> {
        let driver_config = DriverConfig::load(&config.driver_config)?;
        debug!("Controllers: {:?}", driver_config.controllers);

        let mut orchestrator = Self::new(
            &config.snapshot_path,
            config.frame_interval(),
            config.worker_timeout(),
        );

        if let Some(pipe) = &config.sensor_pipe {
            let fifo: Box<dyn Read + Send> = Box::new(open_fifo(pipe)?);
            orchestrator = orchestrator.with_sensors(ChannelReader::new(fifo));
            info!("Reading sensor channels from {}", pipe.display());
        }

        let driver = ChildLink::spawn("driver", command.driver(&config.driver_config))?;
        orchestrator = orchestrator.with_driver(driver);

        let mut starting = Vec::new();
        for (index, spec) in config.patterns.iter().enumerate() {
            let name = format!("worker-{}", index);
            match ChildLink::spawn(name, command.worker(index, &spec.name)) {
                Ok(link) => starting.push(WorkerHandle::new(index, spec.clone(), link)),
                Err(e) => error!("Failed to start worker {} ({}): {}", index, spec.name, e),
            }
        }

        let startup_wait = config.worker_timeout().max(MIN_STARTUP_WAIT);
        let mut failed = Vec::new();
        for mut worker in starting {
            match worker.handshake(startup_wait) {
                Ok(()) => orchestrator.workers.push(worker),
                Err(e) => {
                    error!(
                        "Worker {} ({}) failed to start: {}",
                        worker.index(),
                        worker.spec().name,
                        e
                    );
                    failed.push(worker.into_link());
                }
            }
        }
        if !failed.is_empty() {
            shutdown_links(failed.iter_mut(), startup_wait);
        }

        info!(
            "Started {} of {} pattern workers",
            orchestrator.workers.len(),
            config.patterns.len()
        );
        Ok(orchestrator)
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_disconnected()).count()
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// PIDs of every child process, driver last
    pub fn child_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = Vec::new();
        for worker in &self.workers {
            pids.extend(worker.link().pid());
        }
        pids.extend(self.driver.as_ref().and_then(|d| d.pid()));
        pids
    }

    /// Input value for `channel`: loop time for `time`, otherwise the latest
    /// sensor reading (0.0 when nothing was received)
    pub fn input_for(&self, channel: &str) -> f64 {
        if channel == TIME_CHANNEL {
            return self.started.elapsed().as_secs_f64() % TIME_WRAP_SECS;
        }
        self.sensors.as_ref().map_or(0.0, |s| s.latest(channel))
    }

    /// Run one frame
    pub fn tick(&mut self) -> TickReport {
        let tick_start = Instant::now();
        self.frame += 1;
        let frame = self.frame;

        if let Some(sensors) = self.sensors.as_mut() {
            let samples = sensors.poll();
            if !samples.is_empty() {
                debug!("Frame {}: {} sensor samples", frame, samples.len());
            }
        }

        let mut requested = Vec::with_capacity(self.workers.len());
        for i in 0..self.workers.len() {
            if self.workers[i].is_disconnected() {
                continue;
            }
            let value = self.input_for(&self.workers[i].spec().channel);
            let worker = &mut self.workers[i];
            match worker.request(frame, value) {
                Ok(true) => requested.push(i),
                Ok(false) => debug!(
                    "Worker {} still busy with frame {:?}, skipping frame {}",
                    worker.index(),
                    worker.outstanding(),
                    frame
                ),
                Err(e) => warn!("Error sending to worker {}: {}", worker.index(), e),
            }
        }

        let mut outputs = Vec::with_capacity(requested.len());
        for i in requested {
            let worker = &mut self.workers[i];
            match worker.await_response(frame, self.worker_timeout) {
                Ok(Some(values)) => outputs.push(values),
                Ok(None) => debug!("Worker {} skipped frame {}", worker.index(), frame),
                Err(e) => warn!("Error receiving from worker {}: {}", worker.index(), e),
            }
        }

        let combined = aggregate(&outputs);

        if let Some(driver) = self.driver.as_mut() {
            if !self.driver_lost {
                let msg = IpcMessage::FrameData {
                    frame,
                    values: combined,
                };
                if let Err(e) = driver.send(&msg) {
                    if driver.is_disconnected() {
                        error!("Actuation driver is no longer reachable: {}", e);
                        self.driver_lost = true;
                    } else {
                        self.driver_dropped += 1;
                        if self.driver_dropped % STATUS_EVERY == 1 {
                            warn!(
                                "Frame {} not delivered to the driver ({} dropped so far): {}",
                                frame, self.driver_dropped, e
                            );
                        }
                    }
                }
            }
        }

        if let Err(e) = write_snapshot(&self.snapshot_path, &combined) {
            error!("Failed to write snapshot {}: {}", self.snapshot_path.display(), e);
        }

        if frame % STATUS_EVERY == 0 {
            info!(
                "Frame {}: {} of {} workers contributed, aggregate range [{:.3}, {:.3}]",
                frame,
                outputs.len(),
                self.workers.len(),
                combined.min(),
                combined.max()
            );
        }

        TickReport {
            frame,
            contributors: outputs.len(),
            aggregate: combined,
            elapsed: tick_start.elapsed(),
        }
    }

    /// Tick at the configured interval until `running` is cleared, then shut down
    pub fn run(&mut self, running: &AtomicBool) {
        info!(
            "Frame loop running every {:?} with {} workers",
            self.interval,
            self.workers.len()
        );
        self.started = Instant::now();

        while running.load(Ordering::SeqCst) {
            let report = self.tick();
            match self.interval.checked_sub(report.elapsed) {
                Some(rest) => thread::sleep(rest),
                None => debug!(
                    "Frame {} overran the interval by {:?}",
                    report.frame,
                    report.elapsed - self.interval
                ),
            }
        }

        info!("Frame loop stopped after {} frames", self.frame);
        self.shutdown();
    }

    /// Stop every worker and the driver; no child outlives this call
    pub fn shutdown(&mut self) {
        info!("Shutting down {} workers and the driver", self.workers.len());
        let links = self
            .workers
            .iter_mut()
            .map(|w| w.link_mut())
            .chain(self.driver.as_mut());
        shutdown_links(links, self.grace);
        info!("Shutdown complete");
    }
}
