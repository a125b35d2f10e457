// src/lib.rs - millcore: motion-control core for a small stepper CNC controller
//! Canonical machine, look-ahead planner, DDA segment runtime, arc and dwell
//! generators, and the cooperative scheduler that keeps them fed.
//!
//! Data flows forward: a line arrives at the [`scheduler::Controller`], the
//! [`machine::CanonicalMachine`] validates it and submits moves to the
//! [`motion::planner::Planner`], whose segment executor feeds the
//! [`motion::stepper::Runtime`]. Control flows backward only through the
//! signal flags and back-pressure results.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod gcode;
pub mod hardware;
pub mod machine;
pub mod motion;
pub mod report;
pub mod scheduler;
pub mod sim;

pub use config::{ConfigError, MachineConfig, load_config};
pub use error::{MotionError, MotionResult};
pub use machine::{CanonicalMachine, MachineMode};
pub use scheduler::Controller;
pub use sim::Simulator;

/// Number of axes the canonical machine tracks (X Y Z A B C).
pub const AXES: usize = 6;
/// Number of motor channels driven by the runtime.
pub const MOTORS: usize = 4;
/// DDA tick rate.
pub const DDA_FREQUENCY_HZ: u32 = 50_000;
/// Nominal duration of one runtime segment.
pub const SEGMENT_TIME_US: u32 = 5_000;
/// Planner ring capacity.
pub const PLANNER_BUFFER_SIZE: usize = 28;
/// Runtime ring slots; one is always kept free.
pub const RUNTIME_RING_SLOTS: usize = 4;
/// Longest accepted input line, excluding the terminator.
pub const LINE_BUFFER_LEN: usize = 254;
/// Period of the low-rate housekeeping tick used for switch debouncing.
pub const RTC_PERIOD_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
}

impl Axis {
    pub const ALL: [Axis; AXES] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Axis> {
        Self::ALL.get(index).copied()
    }

    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            'A' => Some(Axis::A),
            'B' => Some(Axis::B),
            'C' => Some(Axis::C),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        ['x', 'y', 'z', 'a', 'b', 'c'][self.index()]
    }

    /// Rotary axes are programmed in degrees and never unit-converted.
    pub fn is_rotary(self) -> bool {
        matches!(self, Axis::A | Axis::B | Axis::C)
    }
}
