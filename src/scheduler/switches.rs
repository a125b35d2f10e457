// src/scheduler/switches.rs - Limit switch debouncing on the housekeeping tick
use crate::config::{MachineConfig, SwitchType};
use crate::hardware::{SWITCH_COUNT, SwitchEnd, SwitchId, SwitchInputs};

/// Consecutive equal readings needed to accept a change. At the 10 ms tick a
/// transient shorter than 30 ms cannot produce this many.
pub const DEBOUNCE_COUNT: u8 = 4;

#[derive(Debug, Clone, Copy, Default)]
struct SwitchState {
    enabled: bool,
    active: bool,
    candidate: bool,
    count: u8,
}

#[derive(Debug, Clone)]
pub struct Switches {
    switches: [SwitchState; SWITCH_COUNT],
    normally_closed: bool,
}

impl Switches {
    pub fn new(config: &MachineConfig) -> Self {
        let mut switches = Self {
            switches: [SwitchState::default(); SWITCH_COUNT],
            normally_closed: false,
        };
        switches.configure(config);
        switches
    }

    pub fn configure(&mut self, config: &MachineConfig) {
        self.normally_closed = config.system.switch_type == SwitchType::NormallyClosed;
        for (i, state) in self.switches.iter_mut().enumerate() {
            let Some(id) = SwitchId::from_index(i) else {
                continue;
            };
            let axis = config.axis(id.axis);
            state.enabled = axis.is_enabled()
                && match id.end {
                    SwitchEnd::Min => axis.min_switch_enabled,
                    SwitchEnd::Max => axis.max_switch_enabled,
                };
            if !state.enabled {
                *state = SwitchState::default();
            }
        }
    }

    /// Take one reading of every enabled switch. Returns a switch whose
    /// closure was confirmed on this sample.
    pub fn sample<I: SwitchInputs + ?Sized>(&mut self, inputs: &I) -> Option<SwitchId> {
        let mut tripped = None;
        for (i, state) in self.switches.iter_mut().enumerate() {
            if !state.enabled {
                continue;
            }
            let Some(id) = SwitchId::from_index(i) else {
                continue;
            };
            let closed = inputs.read(id) != self.normally_closed;
            if closed != state.candidate {
                state.candidate = closed;
                state.count = 1;
            } else if state.count < DEBOUNCE_COUNT {
                state.count += 1;
            }
            if state.count >= DEBOUNCE_COUNT && state.active != state.candidate {
                state.active = state.candidate;
                if state.active && tripped.is_none() {
                    tripped = Some(id);
                }
            }
        }
        tripped
    }

    pub fn is_active(&self, switch: SwitchId) -> bool {
        self.switches[switch.index()].active
    }

    pub fn any_active(&self) -> bool {
        self.switches.iter().any(|s| s.active)
    }
}
