// src/motion/mod.rs - Planning and step generation
pub mod arc;
pub mod junction;
pub mod planner;
pub mod profile;
pub mod stepper;

pub use arc::{ArcCenter, ArcGenerator, ArcSpec};
pub use planner::{Block, BlockState, HoldState, MoveKind, MoveRate, Planner};
pub use stepper::{Runtime, RuntimeState, Segment, SegmentKind};

use crate::{AXES, DDA_FREQUENCY_HZ, SEGMENT_TIME_US};

/// Lengths and velocities below this are treated as zero.
pub const EPSILON: f64 = 1e-9;

/// Nominal runtime segment duration in minutes.
pub fn segment_minutes() -> f64 {
    f64::from(SEGMENT_TIME_US) / 60_000_000.0
}

/// Whole DDA ticks in a span of minutes, rounded to nearest.
pub fn ticks_for_minutes(minutes: f64) -> u32 {
    (minutes * 60.0 * f64::from(DDA_FREQUENCY_HZ)).round().max(0.0) as u32
}

pub fn calculate_distance(start: &[f64; AXES], end: &[f64; AXES]) -> f64 {
    start
        .iter()
        .zip(end)
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f64>()
        .sqrt()
}

/// Direction cosines from `start` to `end`, or zeros for a null move.
pub fn calculate_unit_vector(start: &[f64; AXES], end: &[f64; AXES]) -> [f64; AXES] {
    let distance = calculate_distance(start, end);
    let mut unit = [0.0; AXES];
    if distance > EPSILON {
        for i in 0..AXES {
            unit[i] = (end[i] - start[i]) / distance;
        }
    }
    unit
}
