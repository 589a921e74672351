//! Actuation driver
//!
//! Turns a clamped aggregate frame into control packets. Each nozzle value is
//! rescaled from `[-1.0, 1.0]` into that nozzle's calibrated range, the 36
//! results are split into three blocks of 12, and each block goes to its
//! controller as one UDP packet.
//!
//! In a full run the driver lives in its own process and receives frames
//! from the orchestrator over stdin (see [`run_driver_process`]).

use crate::artnet::DmxPacket;
use crate::config::{DriverConfig, CONTROLLER_COUNT, NOZZLES_PER_CONTROLLER};
use crate::error::{Error, Result};
use crate::frame::{FrameVector, NOZZLE_COUNT};
use crate::ipc::IpcMessage;
use std::io::Read;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, error, info, warn};

/// How often the driver reports what it sent
const STATUS_EVERY: u64 = 100;

/// Map `value` from `[-1.0, 1.0]` onto `[low, high]`
pub fn remap(value: f64, low: f64, high: f64) -> f64 {
    low + (value + 1.0) * (high - low) / 2.0
}

pub struct ActuationDriver {
    config: DriverConfig,
    socket: UdpSocket,
    sequence: u8,
    frames: u64,
}

impl ActuationDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self::with_socket(config, socket))
    }

    pub fn with_socket(config: DriverConfig, socket: UdpSocket) -> Self {
        info!(
            "Actuation driver ready: {} controllers, {} ranges",
            CONTROLLER_COUNT, NOZZLE_COUNT
        );
        Self {
            config,
            socket,
            sequence: 0,
            frames: 0,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    /// Remap every nozzle into its calibrated output range
    pub fn remap_frame(&self, frame: &FrameVector) -> [f64; NOZZLE_COUNT] {
        let mut out = [0.0; NOZZLE_COUNT];
        for (i, (value, &(low, high))) in frame.iter().zip(self.config.ranges.iter()).enumerate() {
            out[i] = remap(*value, low, high);
        }
        out
    }

    /// Build one packet per controller. Every packet takes the next sequence
    /// number whether or not it is delivered.
    pub fn packets(&mut self, frame: &FrameVector) -> Vec<(SocketAddr, DmxPacket)> {
        let mapped = self.remap_frame(frame);
        let mut packets = Vec::with_capacity(CONTROLLER_COUNT);

        for (universe, block) in mapped.chunks_exact(NOZZLES_PER_CONTROLLER).enumerate() {
            let channels = block.iter().map(|&v| (false, v)).collect();
            let packet = DmxPacket::new(universe as u16, self.sequence, channels);
            self.sequence = self.sequence.wrapping_add(1);
            packets.push((self.config.controllers[universe], packet));
        }
        packets
    }

    /// Send `frame` to all controllers; returns how many packets went out.
    ///
    /// A failed send is logged and the remaining controllers still get theirs.
    pub fn apply(&mut self, frame: &FrameVector) -> usize {
        let mut delivered = 0;
        for (universe, (addr, packet)) in self.packets(frame).into_iter().enumerate() {
            match self.socket.send_to(&packet.encode(), addr) {
                Ok(_) => delivered += 1,
                Err(e) => error!(
                    "Error sending packet to controller {} ({}): {}",
                    universe, addr, e
                ),
            }
        }

        self.frames += 1;
        if self.frames % STATUS_EVERY == 0 {
            let mapped = self.remap_frame(frame);
            let out_min = mapped.iter().copied().fold(f64::INFINITY, f64::min);
            let out_max = mapped.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            info!(
                "Driver sent frame {}: input range [{:.3}, {:.3}] -> output range [{:.3}, {:.3}]",
                self.frames,
                frame.min(),
                frame.max(),
                out_min,
                out_max
            );
        }
        delivered
    }
}

/// Driver process loop: apply every `FrameData` until `Shutdown` or end of stream
pub fn run_driver_process<R: Read>(mut reader: R, driver: &mut ActuationDriver) -> Result<()> {
    loop {
        match IpcMessage::receive(&mut reader) {
            Ok(IpcMessage::FrameData { frame, values }) => {
                debug!("Driver applying frame {}", frame);
                driver.apply(&values);
            }
            Ok(IpcMessage::Shutdown) => {
                info!("Driver received shutdown after {} frames", driver.frames_sent());
                return Ok(());
            }
            Ok(other) => warn!("Driver ignoring unexpected {} message", other.kind()),
            Err(Error::Codec(e)) | Err(Error::Protocol(e)) => {
                warn!("Driver received invalid message: {}", e);
            }
            Err(Error::Channel(_)) => {
                info!("Driver channel closed after {} frames", driver.frames_sent());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
