// src/hardware/mod.rs - Contracts for the collaborators the core drives
//! The core never touches registers or serial ports itself. Step/direction
//! lines, switch inputs, the line stream, the response stream and the settings
//! store are reached through these traits; the simulator provides recording
//! implementations.

use crate::config::tokens::ConfigChange;
use crate::report::Response;
use crate::{Axis, LINE_BUFFER_LEN};
use serde::Serialize;

pub type LineBuffer = heapless::String<LINE_BUFFER_LEN>;

/// Step and direction outputs. Only the runtime calls these.
pub trait StepperPins {
    fn set_direction(&mut self, motor: usize, level: bool);
    fn step_rise(&mut self, motor: usize);
    fn step_fall(&mut self, motor: usize);
    fn set_enable(&mut self, motor: usize, enabled: bool);
}

/// Which end of travel a switch guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchEnd {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchId {
    pub axis: Axis,
    pub end: SwitchEnd,
}

/// Switches are fitted to the first four axes, one at each end.
pub const SWITCH_COUNT: usize = 8;

impl SwitchId {
    pub fn index(self) -> usize {
        self.axis.index() * 2 + usize::from(self.end == SwitchEnd::Max)
    }

    pub fn from_index(index: usize) -> Option<SwitchId> {
        if index >= SWITCH_COUNT {
            return None;
        }
        let axis = Axis::from_index(index / 2)?;
        let end = if index % 2 == 0 { SwitchEnd::Min } else { SwitchEnd::Max };
        Some(SwitchId { axis, end })
    }
}

/// Raw electrical level of a switch input; polarity is applied by the debouncer.
pub trait SwitchInputs {
    fn read(&self, switch: SwitchId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line was written into the buffer.
    Line,
    /// The line did not fit in the buffer and was discarded.
    Overflow,
    NoneAvailable,
    EndOfStream,
}

/// Non-blocking source of input lines. Signal characters never reach it.
pub trait LineSource {
    fn next_line(&mut self, buf: &mut LineBuffer) -> LineStatus;
}

pub trait ResponseSink {
    fn respond(&mut self, response: &Response);
}

/// Receives a notification for every applied settings write.
pub trait SettingsListener {
    fn config_changed(&mut self, change: &ConfigChange);
}

impl SettingsListener for () {
    fn config_changed(&mut self, _change: &ConfigChange) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_ids_round_trip_through_index() {
        for i in 0..SWITCH_COUNT {
            let id = SwitchId::from_index(i).unwrap();
            assert_eq!(id.index(), i);
        }
        assert_eq!(SwitchId::from_index(SWITCH_COUNT), None);
        assert_eq!(
            SwitchId { axis: Axis::Y, end: SwitchEnd::Max }.index(),
            3
        );
    }
}
