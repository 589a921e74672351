//! Physical nozzle layout
//!
//! The bath is split into 6 sections, 60° apart. Each section holds three
//! concentric rings with 3, 2 and 1 nozzles (outer to inner), for 36 nozzles
//! total. Nozzles are numbered section by section, so a section occupies a
//! contiguous block of 6 indices while a ring is strided across sections:
//!
//! ```text
//! section 0: [ r0p0 r0p1 r0p2 r1p0 r1p1 r2p0 ]  indices 0..6
//! section 1: [ r0p0 r0p1 r0p2 r1p0 r1p1 r2p0 ]  indices 6..12
//! ...
//! ```

use crate::frame::NOZZLE_COUNT;
use std::f64::consts::{PI, TAU};
use std::fmt;

pub const SECTION_COUNT: usize = 6;
pub const RING_COUNT: usize = 3;
pub const NOZZLES_PER_SECTION: usize = 6;

/// Nozzles per ring within one section
pub const RING_SIZES: [usize; RING_COUNT] = [3, 2, 1];

pub const RING_RADIUS: [f64; RING_COUNT] = [3.0, 2.0, 1.0];

/// Angular offset of each ring from its section's base angle
pub const RING_BASE_ANGLE: [f64; RING_COUNT] = [PI / 18.0, PI / 12.0, PI / 6.0];

/// Angular offset of each position within a ring
pub const POSITION_ANGLE: [&[f64]; RING_COUNT] = [
    &[0.0, PI / 9.0, 2.0 * PI / 9.0],
    &[0.0, PI / 6.0],
    &[0.0],
];

/// One nozzle's fixed placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nozzle {
    pub index: usize,
    pub ring: usize,
    pub section: usize,
    pub position: usize,
    pub x: f64,
    pub y: f64,
    /// `atan2(x, y)`, computed once at construction
    pub angle: f64,
}

impl Nozzle {
    fn new(index: usize, ring: usize, section: usize, position: usize, x: f64, y: f64) -> Self {
        Self {
            index,
            ring,
            section,
            position,
            x,
            y,
            angle: x.atan2(y),
        }
    }
}

impl fmt::Display for Nozzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Nozzle(idx={}, ring={}, section={}, pos={}, x={:.2}, y={:.2}, angle={:.3})",
            self.index, self.ring, self.section, self.position, self.x, self.y, self.angle
        )
    }
}

/// Read-only table of all 36 nozzles
#[derive(Debug, Clone)]
pub struct NozzleLayout {
    nozzles: Vec<Nozzle>,
}

impl NozzleLayout {
    pub fn new() -> Self {
        let mut nozzles = Vec::with_capacity(NOZZLE_COUNT);

        for section in 0..SECTION_COUNT {
            let base_angle = section as f64 * TAU / SECTION_COUNT as f64;
            for ring in 0..RING_COUNT {
                for position in 0..RING_SIZES[ring] {
                    let full_angle =
                        base_angle + RING_BASE_ANGLE[ring] + POSITION_ANGLE[ring][position];
                    let radius = RING_RADIUS[ring];
                    let x = full_angle.sin() * radius;
                    let y = full_angle.cos() * radius;
                    nozzles.push(Nozzle::new(nozzles.len(), ring, section, position, x, y));
                }
            }
        }

        Self { nozzles }
    }

    pub fn nozzles(&self) -> &[Nozzle] {
        &self.nozzles
    }

    pub fn get(&self, index: usize) -> Option<&Nozzle> {
        self.nozzles.get(index)
    }

    /// The contiguous 6-nozzle block of one section; empty if out of range
    pub fn section(&self, section: usize) -> &[Nozzle] {
        if section >= SECTION_COUNT {
            return &[];
        }
        let start = section * NOZZLES_PER_SECTION;
        &self.nozzles[start..start + NOZZLES_PER_SECTION]
    }

    /// All nozzles of one ring across every section, in section order
    pub fn ring(&self, ring: usize) -> Vec<&Nozzle> {
        let Some(offset) = ring_offset(ring) else {
            return Vec::new();
        };
        let size = RING_SIZES[ring];
        self.nozzles
            .chunks(NOZZLES_PER_SECTION)
            .flat_map(|section| section[offset..offset + size].iter())
            .collect()
    }

    /// The nozzle at `(ring, position)` in every section, in section order.
    ///
    /// Any ring other than 0 or 1 selects the innermost nozzle.
    pub fn at_position(&self, ring: usize, position: usize) -> Vec<&Nozzle> {
        let slot = match ring {
            0 => position,
            1 => position + RING_SIZES[0],
            _ => NOZZLES_PER_SECTION - 1,
        };
        if slot >= NOZZLES_PER_SECTION {
            return Vec::new();
        }
        self.nozzles.iter().skip(slot).step_by(NOZZLES_PER_SECTION).collect()
    }
}

impl Default for NozzleLayout {
    fn default() -> Self {
        Self::new()
    }
}

fn ring_offset(ring: usize) -> Option<usize> {
    if ring >= RING_COUNT {
        return None;
    }
    Some(RING_SIZES[..ring].iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_has_36_nozzles_in_order() {
        let layout = NozzleLayout::new();
        assert_eq!(layout.nozzles().len(), NOZZLE_COUNT);
        for (i, nozzle) in layout.nozzles().iter().enumerate() {
            assert_eq!(nozzle.index, i);
            assert_eq!(nozzle.section, i / NOZZLES_PER_SECTION);
        }
    }

    #[test]
    fn test_first_nozzle_angle() {
        let layout = NozzleLayout::new();
        let first = layout.get(0).unwrap();
        assert_eq!(first.ring, 0);
        assert_eq!(first.position, 0);
        let expected = RING_BASE_ANGLE[0] + POSITION_ANGLE[0][0];
        assert!((first.angle - expected).abs() < 1e-12);
        assert!((first.x - expected.sin() * 3.0).abs() < 1e-12);
        assert!((first.y - expected.cos() * 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_angle_matches_atan2_everywhere() {
        let layout = NozzleLayout::new();
        for nozzle in layout.nozzles() {
            assert_eq!(nozzle.angle, nozzle.x.atan2(nozzle.y));
        }
    }

    #[test]
    fn test_section_is_contiguous_block() {
        let layout = NozzleLayout::new();
        let section = layout.section(2);
        let indices: Vec<usize> = section.iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![12, 13, 14, 15, 16, 17]);
        assert!(layout.section(6).is_empty());
    }

    #[test]
    fn test_ring_is_strided() {
        let layout = NozzleLayout::new();

        let outer: Vec<usize> = layout.ring(0).iter().map(|n| n.index).collect();
        assert_eq!(outer.len(), 18);
        assert_eq!(&outer[..6], &[0, 1, 2, 6, 7, 8]);

        let middle: Vec<usize> = layout.ring(1).iter().map(|n| n.index).collect();
        assert_eq!(middle.len(), 12);
        assert_eq!(&middle[..4], &[3, 4, 9, 10]);

        let inner: Vec<usize> = layout.ring(2).iter().map(|n| n.index).collect();
        assert_eq!(inner, vec![5, 11, 17, 23, 29, 35]);

        assert!(layout.ring(3).is_empty());
        assert!(layout.ring(2).iter().all(|n| n.ring == 2));
    }

    #[test]
    fn test_at_position() {
        let layout = NozzleLayout::new();

        let indices: Vec<usize> = layout.at_position(0, 1).iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![1, 7, 13, 19, 25, 31]);

        let indices: Vec<usize> = layout.at_position(1, 1).iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![4, 10, 16, 22, 28, 34]);

        let indices: Vec<usize> = layout.at_position(2, 0).iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![5, 11, 17, 23, 29, 35]);
    }

    #[test]
    fn test_sections_are_sixty_degrees_apart() {
        let layout = NozzleLayout::new();
        let a = layout.section(0)[5];
        let b = layout.section(1)[5];
        let expected = RING_BASE_ANGLE[2] + TAU / 6.0;
        assert!((b.angle - expected).abs() < 1e-12);
        assert!((b.angle - a.angle - TAU / 6.0).abs() < 1e-12);
    }
}
