//! Hardware input channels
//!
//! Sensor readings arrive on a named FIFO shared with the ADC sampling
//! process. Each record is a 4-byte big-endian length followed by a JSON
//! object:
//!
//! ```text
//! [len: u32 BE][{"channel": "pot0", "value": 0.42, "timestamp": 1712.5}]
//! ```
//!
//! [`ChannelReader`] reads whatever is available without blocking, keeps
//! partial records buffered across polls, and caches the latest value per
//! channel. A record that fails to parse discards the whole buffer; the
//! reader resynchronizes on the next read.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Records larger than this are treated as corrupt
pub const MAX_RECORD_LEN: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;
const READ_CHUNK: usize = 4096;

/// Upper bound on reads per poll so a chatty producer cannot stall a frame
const MAX_READS_PER_POLL: usize = 16;

/// One reading from a named input channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub channel: String,
    pub value: f64,
    /// Unix seconds at the producer, if it sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl SensorSample {
    pub fn new(channel: impl Into<String>, value: f64) -> Self {
        Self {
            channel: channel.into(),
            value,
            timestamp: None,
        }
    }

    /// Sample stamped with the current wall-clock time
    pub fn now(channel: impl Into<String>, value: f64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .ok();
        Self {
            timestamp,
            ..Self::new(channel, value)
        }
    }

    /// Length-prefixed wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_RECORD_LEN {
            return Err(Error::Protocol(format!(
                "Sensor record too large: {} bytes",
                body.len()
            )));
        }
        let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Latest calibrated value of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelValue {
    pub value: f64,
    pub received_at: Instant,
}

/// Non-blocking reader of length-prefixed sensor records
pub struct ChannelReader<R> {
    source: R,
    buffer: Vec<u8>,
    values: HashMap<String, ChannelValue>,
    discarded: u64,
}

impl ChannelReader<File> {
    /// Open (creating if needed) the FIFO at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_fifo(path)?;
        info!("Reading sensor channels from {}", path.display());
        Ok(Self::new(file))
    }
}

impl<R: Read> ChannelReader<R> {
    /// Wrap a source that is already in non-blocking mode
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            values: HashMap::new(),
            discarded: 0,
        }
    }

    /// Read everything currently available and return the newly parsed samples.
    ///
    /// An empty read or `WouldBlock` means no data right now; the cache is
    /// left as it was.
    pub fn poll(&mut self) -> Vec<SensorSample> {
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..MAX_READS_PER_POLL {
            match self.source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Sensor stream read failed: {}", e);
                    break;
                }
            }
        }
        self.drain_records()
    }

    /// Push raw bytes as if they had been read from the stream
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SensorSample> {
        self.buffer.extend_from_slice(bytes);
        self.drain_records()
    }

    /// Latest value for `channel`, or 0.0 if nothing was received on it
    pub fn latest(&self, channel: &str) -> f64 {
        self.values.get(channel).map_or(0.0, |v| v.value)
    }

    pub fn get(&self, channel: &str) -> Option<&ChannelValue> {
        self.values.get(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&str, &ChannelValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Bytes held back waiting for the rest of a record
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// How many times the buffer was thrown away after a bad record
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn drain_records(&mut self) -> Vec<SensorSample> {
        let mut samples = Vec::new();

        while self.buffer.len() >= LENGTH_PREFIX {
            let mut len_bytes = [0u8; LENGTH_PREFIX];
            len_bytes.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
            let len = u32::from_be_bytes(len_bytes) as usize;

            if len > MAX_RECORD_LEN {
                self.discard(&format!("record length {} exceeds limit", len));
                break;
            }
            let end = LENGTH_PREFIX + len;
            if self.buffer.len() < end {
                break;
            }

            match serde_json::from_slice::<SensorSample>(&self.buffer[LENGTH_PREFIX..end]) {
                Ok(mut sample) => {
                    self.buffer.drain(..end);
                    sample.value = sample.value.clamp(-1.0, 1.0);
                    self.values.insert(
                        sample.channel.clone(),
                        ChannelValue {
                            value: sample.value,
                            received_at: Instant::now(),
                        },
                    );
                    samples.push(sample);
                }
                Err(e) => {
                    self.discard(&e.to_string());
                    break;
                }
            }
        }

        samples
    }

    fn discard(&mut self, reason: &str) {
        warn!(
            "Error parsing sensor record: {}; discarding {} buffered bytes",
            reason,
            self.buffer.len()
        );
        self.buffer.clear();
        self.discarded += 1;
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Config(format!("Invalid FIFO path {}", path.display())))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::AlreadyExists {
            return Err(Error::Config(format!(
                "Cannot create FIFO {}: {}",
                path.display(),
                err
            )));
        }
    }
    Ok(())
}

/// Create the FIFO if it is missing and open it for non-blocking reads
pub fn open_fifo(path: &Path) -> Result<File> {
    match std::fs::metadata(path) {
        Ok(meta) if !meta.file_type().is_fifo() => {
            return Err(Error::Config(format!(
                "Sensor pipe {} exists but is not a FIFO",
                path.display()
            )));
        }
        Ok(_) => {}
        Err(_) => {
            mkfifo(path)?;
            debug!("Created FIFO {}", path.display());
        }
    }

    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| Error::Config(format!("Cannot open sensor pipe {}: {}", path.display(), e)))
}

/// Write one record into the FIFO at `path`.
///
/// Fails immediately if nobody has the FIFO open for reading. The write
/// holds an exclusive `flock` so concurrent producers never interleave.
pub fn send_sample(path: &Path, sample: &SensorSample) -> Result<()> {
    let record = sample.encode()?;
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;

    let fd = file.as_raw_fd();
    // SAFETY: fd belongs to `file`, which outlives both flock calls
    if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let written = file.write_all(&record);
    // SAFETY: as above
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    written?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Yields one queued chunk per read, then `WouldBlock`
    struct ChunkedSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkedSource {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for ChunkedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(io::Error::new(ErrorKind::WouldBlock, "empty")),
            }
        }
    }

    fn record(channel: &str, value: f64) -> Vec<u8> {
        SensorSample::new(channel, value).encode().unwrap()
    }

    #[test]
    fn test_record_in_one_read() {
        let mut reader = ChannelReader::new(ChunkedSource::new(vec![record("pot0", 0.25)]));
        let samples = reader.poll();
        assert_eq!(samples.len(), 1);
        assert_eq!(reader.latest("pot0"), 0.25);
        assert!(reader.get("pot0").is_some());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_record_split_across_reads() {
        let bytes = record("pot1", -0.5);
        let (head, tail) = bytes.split_at(3);
        let mut reader = ChannelReader::new(io::empty());

        assert!(reader.feed(head).is_empty());
        assert_eq!(reader.latest("pot1"), 0.0);
        assert_eq!(reader.feed(tail).len(), 1);
        assert_eq!(reader.latest("pot1"), -0.5);
    }

    #[test]
    fn test_split_between_polls() {
        let bytes = record("pot2", 0.75);
        let (head, tail) = bytes.split_at(bytes.len() - 2);
        let mut reader = ChannelReader::new(ChunkedSource::new(vec![head.to_vec()]));
        assert!(reader.poll().is_empty());

        reader.source.chunks.push_back(tail.to_vec());
        assert_eq!(reader.poll().len(), 1);
        assert_eq!(reader.latest("pot2"), 0.75);
    }

    #[test]
    fn test_values_are_clamped() {
        let mut reader = ChannelReader::new(io::empty());
        let mut bytes = record("hi", 3.5);
        bytes.extend(record("lo", -9.0));
        reader.feed(&bytes);
        assert_eq!(reader.latest("hi"), 1.0);
        assert_eq!(reader.latest("lo"), -1.0);
    }

    #[test]
    fn test_unknown_channel_defaults_to_zero() {
        let reader = ChannelReader::new(io::empty());
        assert_eq!(reader.latest("nothing"), 0.0);
    }

    #[test]
    fn test_parse_error_discards_whole_buffer() {
        let mut reader = ChannelReader::new(io::empty());
        reader.feed(&record("pot0", 0.125));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(b"nope!");
        bytes.extend(record("pot0", 0.875));
        assert!(reader.feed(&bytes).is_empty());

        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.discarded(), 1);
        assert_eq!(reader.latest("pot0"), 0.125);

        reader.feed(&record("pot0", 0.875));
        assert_eq!(reader.latest("pot0"), 0.875);
    }

    #[test]
    fn test_oversized_length_discards_buffer() {
        let mut reader = ChannelReader::new(io::empty());
        let mut bytes = ((MAX_RECORD_LEN + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        reader.feed(&bytes);
        assert_eq!(reader.buffered(), 0);
        assert_eq!(reader.discarded(), 1);
    }

    #[test]
    fn test_empty_read_keeps_cache() {
        let mut reader = ChannelReader::new(io::empty());
        reader.feed(&record("pot3", 0.375));
        assert!(reader.poll().is_empty());
        assert_eq!(reader.latest("pot3"), 0.375);
    }

    #[test]
    fn test_timestamp_is_optional_on_the_wire() {
        let body = br#"{"channel":"pot4","value":0.5}"#;
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);

        let mut reader = ChannelReader::new(io::empty());
        let samples = reader.feed(&bytes);
        assert_eq!(samples[0].timestamp, None);

        let stamped = SensorSample::now("pot4", 0.5);
        assert!(stamped.timestamp.is_some());
        let samples = reader.feed(&stamped.encode().unwrap());
        assert_eq!(samples[0].timestamp, stamped.timestamp);
    }
}
