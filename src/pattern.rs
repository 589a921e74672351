//! Pattern engine
//!
//! A pattern turns one input scalar per frame into an intensity for every
//! nozzle. The input is either elapsed loop time (the `time` channel) or a
//! live sensor value in `[-1.0, 1.0]`; each pattern decides how to use it.
//!
//! Patterns are a closed set. [`PatternKind`] maps a name from the
//! configuration file to a constructor once, when the worker starts.

use crate::error::{Error, Result};
use crate::frame::FrameVector;
use crate::nozzle::{NozzleLayout, RING_COUNT, SECTION_COUNT};
use std::f64::consts::{PI, TAU};

/// Output of one render call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rendered {
    /// One value per nozzle
    Frame(FrameVector),
    /// The same value for every nozzle
    Uniform(f64),
}

impl Rendered {
    pub fn into_frame(self) -> FrameVector {
        match self {
            Rendered::Frame(frame) => frame,
            Rendered::Uniform(value) => FrameVector::uniform(value),
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            Rendered::Frame(frame) => frame.is_finite(),
            Rendered::Uniform(value) => value.is_finite(),
        }
    }
}

/// A frame generator hosted by a pattern worker
pub trait Pattern: Send {
    /// Registry tag of this pattern
    fn name(&self) -> &'static str;

    /// Render one frame for the given input scalar
    fn render(&mut self, input: f64) -> Result<Rendered>;
}

/// Every pattern variant the registry knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    SineSweep,
    Amplitude,
    RingPulse,
    SectionChase,
}

impl PatternKind {
    pub const ALL: [PatternKind; 4] = [
        PatternKind::SineSweep,
        PatternKind::Amplitude,
        PatternKind::RingPulse,
        PatternKind::SectionChase,
    ];

    /// Resolve a configured name. Accepts the snake_case tag or the
    /// CamelCase class name used by older configuration files.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim() {
            "sine_sweep" | "TestPattern" => Ok(PatternKind::SineSweep),
            "amplitude" | "AmplitudePattern" => Ok(PatternKind::Amplitude),
            "ring_pulse" | "RingPulsePattern" => Ok(PatternKind::RingPulse),
            "section_chase" | "SectionChasePattern" => Ok(PatternKind::SectionChase),
            other => Err(Error::Pattern(format!(
                "Unknown pattern '{}' (available: {})",
                other,
                PatternKind::ALL
                    .iter()
                    .map(|k| k.tag())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            PatternKind::SineSweep => "sine_sweep",
            PatternKind::Amplitude => "amplitude",
            PatternKind::RingPulse => "ring_pulse",
            PatternKind::SectionChase => "section_chase",
        }
    }

    pub fn build(&self) -> Box<dyn Pattern> {
        match self {
            PatternKind::SineSweep => Box::new(SineSweep::new()),
            PatternKind::Amplitude => Box::new(Amplitude),
            PatternKind::RingPulse => Box::new(RingPulse::new()),
            PatternKind::SectionChase => Box::new(SectionChase::new()),
        }
    }
}

/// Sine wave swept around the bath by nozzle angle
pub struct SineSweep {
    layout: NozzleLayout,
    frequency: f64,
}

impl SineSweep {
    pub fn new() -> Self {
        Self {
            layout: NozzleLayout::new(),
            frequency: 0.3,
        }
    }
}

impl Default for SineSweep {
    fn default() -> Self {
        Self::new()
    }
}

impl Pattern for SineSweep {
    fn name(&self) -> &'static str {
        PatternKind::SineSweep.tag()
    }

    fn render(&mut self, input: f64) -> Result<Rendered> {
        let mut frame = FrameVector::zero();
        for nozzle in self.layout.nozzles() {
            frame[nozzle.index] = (nozzle.angle + self.frequency * input).sin();
        }
        Ok(Rendered::Frame(frame))
    }
}

/// Every nozzle follows the input directly
pub struct Amplitude;

impl Pattern for Amplitude {
    fn name(&self) -> &'static str {
        PatternKind::Amplitude.tag()
    }

    fn render(&mut self, input: f64) -> Result<Rendered> {
        Ok(Rendered::Uniform(input))
    }
}

/// Rings pulse in turn, outer ring leading
pub struct RingPulse {
    layout: NozzleLayout,
    frequency: f64,
}

impl RingPulse {
    pub fn new() -> Self {
        Self {
            layout: NozzleLayout::new(),
            frequency: 0.25,
        }
    }
}

impl Default for RingPulse {
    fn default() -> Self {
        Self::new()
    }
}

impl Pattern for RingPulse {
    fn name(&self) -> &'static str {
        PatternKind::RingPulse.tag()
    }

    fn render(&mut self, input: f64) -> Result<Rendered> {
        let mut frame = FrameVector::zero();
        for ring in 0..RING_COUNT {
            let value = (TAU * self.frequency * input - ring as f64 * PI / 3.0).sin();
            for nozzle in self.layout.ring(ring) {
                frame[nozzle.index] = value;
            }
        }
        Ok(Rendered::Frame(frame))
    }
}

/// One section fully open at a time, stepping once per input unit
pub struct SectionChase {
    layout: NozzleLayout,
}

impl SectionChase {
    pub fn new() -> Self {
        Self {
            layout: NozzleLayout::new(),
        }
    }
}

impl Default for SectionChase {
    fn default() -> Self {
        Self::new()
    }
}

impl Pattern for SectionChase {
    fn name(&self) -> &'static str {
        PatternKind::SectionChase.tag()
    }

    fn render(&mut self, input: f64) -> Result<Rendered> {
        if !input.is_finite() {
            return Err(Error::Pattern(format!("section_chase got input {}", input)));
        }
        let active = (input.floor() as i64).rem_euclid(SECTION_COUNT as i64) as usize;
        let mut frame = FrameVector::uniform(-1.0);
        for nozzle in self.layout.section(active) {
            frame[nozzle.index] = 1.0;
        }
        Ok(Rendered::Frame(frame))
    }
}
