//! IPC between the orchestrator and its child processes
//!
//! Orchestrator ←→ Pattern worker (one private pipe pair per worker)
//! Orchestrator  → Actuation driver
//!
//! Every message is a 4-byte little-endian length prefix followed by a
//! bincode payload. A payload that fails to decode leaves the stream aligned
//! on the next frame, so a bad message can be skipped without resyncing.

use crate::error::{Error, Result};
use crate::frame::FrameVector;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// Upper bound on a single IPC payload
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Message types exchanged with worker and driver processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcMessage {
    /// Orchestrator → Worker: render frame `frame` for this input value
    StartFrame { frame: u64, value: f64 },

    /// Orchestrator → Driver: push this aggregate to the controllers
    FrameData { frame: u64, values: FrameVector },

    /// Orchestrator → Worker/Driver: stop and exit
    Shutdown,

    /// Worker → Orchestrator: engine constructed, waiting for requests
    Ready { pattern: String },

    /// Worker → Orchestrator: engine could not be constructed; the worker exits next
    StartupFailed { reason: String },

    /// Worker → Orchestrator: one value per nozzle
    Frame { frame: u64, values: FrameVector },

    /// Worker → Orchestrator: the same value for every nozzle
    Scalar { frame: u64, value: f64 },

    /// Worker → Orchestrator: render failed, no contribution this frame
    Skipped { frame: u64 },
}

impl IpcMessage {
    /// Serialize message to bytes for transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Write one length-prefixed message and flush
    pub fn send<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.to_bytes()?;
        let len = bytes.len() as u32;

        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.flush()?;

        Ok(())
    }

    /// Block until one message arrives.
    ///
    /// Returns `Error::Channel` when the peer has closed its end,
    /// `Error::Codec` when a complete frame arrived but could not be decoded.
    pub fn receive<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut len_bytes = [0u8; 4];
        read_frame_part(reader, &mut len_bytes)?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_LEN {
            // Drain the payload so the next frame starts on a length prefix
            std::io::copy(&mut (&mut *reader).take(len as u64), &mut std::io::sink())?;
            return Err(Error::Protocol(format!("Message too large: {} bytes", len)));
        }

        let mut data = vec![0u8; len];
        read_frame_part(reader, &mut data)?;

        Self::from_bytes(&data)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            IpcMessage::StartFrame { .. } => "start_frame",
            IpcMessage::FrameData { .. } => "frame_data",
            IpcMessage::Shutdown => "shutdown",
            IpcMessage::Ready { .. } => "ready",
            IpcMessage::StartupFailed { .. } => "startup_failed",
            IpcMessage::Frame { .. } => "frame",
            IpcMessage::Scalar { .. } => "scalar",
            IpcMessage::Skipped { .. } => "skipped",
        }
    }

    /// Frame a worker reply answers; `None` for every other message
    pub fn reply_frame(&self) -> Option<u64> {
        match self {
            IpcMessage::Frame { frame, .. }
            | IpcMessage::Scalar { frame, .. }
            | IpcMessage::Skipped { frame } => Some(*frame),
            _ => None,
        }
    }
}

fn read_frame_part<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Channel("peer closed the channel".to_string()),
        _ => Error::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_message_over_stream() {
        let mut wire = Vec::new();
        IpcMessage::StartFrame { frame: 7, value: -0.25 }
            .send(&mut wire)
            .unwrap();
        IpcMessage::Shutdown.send(&mut wire).unwrap();

        let len = u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize;
        assert!(wire.len() > len + 4);

        let mut cursor = Cursor::new(wire);
        assert_eq!(
            IpcMessage::receive(&mut cursor).unwrap(),
            IpcMessage::StartFrame { frame: 7, value: -0.25 }
        );
        assert_eq!(IpcMessage::receive(&mut cursor).unwrap(), IpcMessage::Shutdown);

        match IpcMessage::receive(&mut cursor) {
            Err(Error::Channel(_)) => {}
            other => panic!("expected closed channel, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_frame_only_for_worker_replies() {
        assert_eq!(IpcMessage::Skipped { frame: 4 }.reply_frame(), Some(4));
        assert_eq!(IpcMessage::Scalar { frame: 5, value: 0.0 }.reply_frame(), Some(5));
        assert_eq!(IpcMessage::StartFrame { frame: 6, value: 0.0 }.reply_frame(), None);
        assert_eq!(IpcMessage::Shutdown.reply_frame(), None);
    }

    #[test]
    fn test_frame_payload_keeps_all_values() {
        let mut values = FrameVector::zero();
        values[35] = 0.5;
        let mut wire = Vec::new();
        IpcMessage::Frame { frame: 1, values }.send(&mut wire).unwrap();

        match IpcMessage::receive(&mut Cursor::new(wire)).unwrap() {
            IpcMessage::Frame { frame, values: decoded } => {
                assert_eq!(frame, 1);
                assert_eq!(decoded, values);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_payload_is_codec_error_and_stream_stays_aligned() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&[0xff, 0xff, 0xff]);
        IpcMessage::Shutdown.send(&mut wire).unwrap();

        let mut cursor = Cursor::new(wire);
        assert!(matches!(IpcMessage::receive(&mut cursor), Err(Error::Codec(_))));
        assert_eq!(IpcMessage::receive(&mut cursor).unwrap(), IpcMessage::Shutdown);
    }

    #[test]
    fn test_oversized_length_rejected_and_skipped() {
        let len = MAX_MESSAGE_LEN + 1;
        let mut wire = Vec::new();
        wire.extend_from_slice(&(len as u32).to_le_bytes());
        wire.resize(4 + len, 0);
        IpcMessage::Shutdown.send(&mut wire).unwrap();

        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            IpcMessage::receive(&mut cursor),
            Err(Error::Protocol(_))
        ));
        assert_eq!(IpcMessage::receive(&mut cursor).unwrap(), IpcMessage::Shutdown);
    }
}
