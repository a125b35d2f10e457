// src/machine/homing.rs - G28.2 homing cycle
//! Homes the requested axes one at a time, Z first. Each axis searches toward
//! its minimum switch, is zeroed at its travel minimum when the switch trips,
//! then backs off by the configured distance.

use super::CanonicalMachine;
use crate::config::MachineConfig;
use crate::error::{MotionError, MotionResult};
use crate::hardware::{SwitchEnd, SwitchId};
use crate::motion::planner::{MoveRate, Planner};
use crate::motion::stepper::Runtime;
use crate::{AXES, Axis};

/// Search distance as a multiple of the travel range.
const SEARCH_TRAVEL_FACTOR: f64 = 1.5;

const HOMING_ORDER: [Axis; AXES] = [Axis::Z, Axis::X, Axis::Y, Axis::A, Axis::B, Axis::C];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Search,
    Backoff,
}

#[derive(Debug, Clone)]
pub struct HomingCycle {
    axes: heapless::Vec<Axis, AXES>,
    current: usize,
    phase: Phase,
}

impl HomingCycle {
    /// Validate the request. Every named axis needs an enabled minimum switch
    /// and a travel range to search over.
    pub fn new(requested: &[bool; AXES], config: &MachineConfig) -> MotionResult<Self> {
        let mut axes = heapless::Vec::new();
        for axis in HOMING_ORDER {
            if !requested[axis.index()] {
                continue;
            }
            let a = config.axis(axis);
            if !a.is_enabled() || !a.min_switch_enabled || !a.has_travel_range() {
                tracing::warn!("Axis {} cannot be homed", axis.letter());
                return Err(MotionError::Homing);
            }
            if config.motor_for_axis(axis).is_none() {
                tracing::warn!("Axis {} has no motor", axis.letter());
                return Err(MotionError::Homing);
            }
            // Capacity equals the number of axes.
            let _ = axes.push(axis);
        }
        tracing::info!("Homing cycle over {:?}", axes);
        Ok(Self { axes, current: 0, phase: Phase::Start })
    }

    pub fn current_axis(&self) -> Option<Axis> {
        self.axes.get(self.current).copied()
    }

    /// Advance the cycle. `tripped` carries a switch that has just been
    /// confirmed closed. Returns true once every axis has been homed.
    pub fn poll(
        &mut self,
        tripped: Option<SwitchId>,
        machine: &mut CanonicalMachine,
        planner: &mut Planner,
        runtime: &mut Runtime,
        config: &MachineConfig,
    ) -> MotionResult<bool> {
        let Some(axis) = self.current_axis() else {
            return Ok(true);
        };
        let settings = config.axis(axis);
        match self.phase {
            Phase::Start => {
                let mut target = planner.get_position();
                target[axis.index()] -= SEARCH_TRAVEL_FACTOR * (settings.travel_max - settings.travel_min);
                planner.plan_line(&target, MoveRate::Feed(settings.search_velocity), config)?;
                planner.plan_finalize();
                tracing::info!("Homing {}: searching at {}", axis.letter(), settings.search_velocity);
                self.phase = Phase::Search;
            }
            Phase::Search => {
                if tripped == Some(SwitchId { axis, end: SwitchEnd::Min }) {
                    runtime.abort();
                    planner.reset();
                    planner.sync_from_steps(runtime.position(), config);
                    planner.set_axis_position(axis, settings.travel_min, config);
                    runtime.set_position(planner.step_position());
                    machine.sync_position(planner.get_position());
                    machine.mark_homed(axis);

                    let mut target = planner.get_position();
                    target[axis.index()] += settings.zero_backoff;
                    match planner.plan_line(&target, MoveRate::Feed(settings.latch_velocity), config) {
                        Err(e) if !e.is_informational() => return Err(e),
                        _ => {}
                    }
                    planner.plan_finalize();
                    tracing::info!("Homing {}: switch found, backing off {}", axis.letter(), settings.zero_backoff);
                    self.phase = Phase::Backoff;
                } else if !planner.has_work() && runtime.is_idle() {
                    tracing::warn!("Homing {}: search ended without a switch", axis.letter());
                    return Err(MotionError::Homing);
                }
            }
            Phase::Backoff => {
                if !planner.has_work() && runtime.is_idle() {
                    machine.sync_position(planner.get_position());
                    tracing::info!("Homing {}: done", axis.letter());
                    self.current += 1;
                    self.phase = Phase::Start;
                    return Ok(self.current >= self.axes.len());
                }
            }
        }
        Ok(false)
    }
}
