//! # BirdBath - nozzle pattern engine
//!
//! Renders animated patterns across the 36 water nozzles of the BirdBath
//! installation and streams them to the nozzle controllers.
//!
//! ## Architecture
//!
//! ```text
//!   sensor FIFO ──► ChannelReader
//!                        │
//!                  Orchestrator ──StartFrame──► worker process × ≤6
//!                        │      ◄──Frame/Scalar──
//!              sum + clamp│
//!                        ├──FrameData──► driver process ──UDP──► 3 controllers
//!                        └──► nozzle_data.json
//! ```
//!
//! - **Pattern workers** each host one [`pattern::Pattern`] in a separate
//!   process and answer render requests in lock-step.
//! - **The orchestrator** ticks at a fixed interval, feeds each worker its
//!   input channel, sums the replies and publishes the result.
//! - **The actuation driver** rescales the aggregate into per-nozzle
//!   calibrated ranges and sends one packet per controller.
//!
//! All three roles are the same `birdbath` binary; children are started
//! with hidden subcommands and speak [`ipc::IpcMessage`] over stdin/stdout.

pub mod artnet;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod nozzle;
pub mod orchestrator;
pub mod pattern;
pub mod sensor;
pub mod snapshot;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
pub use frame::{FrameVector, NOZZLE_COUNT};
