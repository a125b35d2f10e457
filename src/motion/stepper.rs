// src/motion/stepper.rs - DDA segment runtime
//! Consumes prepared segments and turns them into step pulses, one DDA tick
//! at a time. The foreground pushes segments with [`Runtime::load`]; the
//! tick interrupt calls [`Runtime::tick`] and the pulse-width timer calls
//! [`Runtime::pulse_end`]. The segment ring is the only state the two sides
//! share and each side only moves its own end of it.

use crate::config::{MachineConfig, PowerMode};
use crate::error::{MotionError, MotionResult};
use crate::hardware::StepperPins;
use crate::{MOTORS, RUNTIME_RING_SLOTS};
use heapless::spsc::Queue;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Motion,
    Dwell,
}

/// A short slice of a planned move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub ticks: u32,
    /// Signed step counts per motor.
    pub steps: [i32; MOTORS],
    /// Path velocity at the end of the segment, mm/min.
    pub velocity: f64,
    /// Sequence number of the planner block this segment belongs to.
    pub seq: u32,
    /// Last segment of a move that ends with the machine at rest.
    pub ends_at_rest: bool,
}

impl Segment {
    pub fn dwell(ticks: u32, seq: u32) -> Self {
        Self {
            kind: SegmentKind::Dwell,
            ticks,
            steps: [0; MOTORS],
            velocity: 0.0,
            seq,
            ends_at_rest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Idle,
    Running,
    /// Hold requested; the current segment finishes and the next is not started.
    Holding,
    /// Ran out of segments in the middle of motion.
    Starved,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub ticks: u64,
    pub dwell_ticks: u64,
    pub starvations: u32,
}

struct ActiveSegment {
    segment: Segment,
    remaining: u32,
    accumulator: [i64; MOTORS],
    increment: [i64; MOTORS],
    direction: [i64; MOTORS],
    period: i64,
}

impl ActiveSegment {
    fn new(segment: Segment) -> Self {
        let max_steps = segment.steps.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        let ticks = segment.ticks.max(max_steps).max(1);
        let t = i64::from(ticks);
        let mut increment = [0; MOTORS];
        let mut direction = [0; MOTORS];
        for (m, steps) in segment.steps.iter().enumerate() {
            increment[m] = 2 * i64::from(steps.unsigned_abs());
            direction[m] = i64::from(steps.signum());
        }
        Self {
            segment,
            remaining: ticks,
            accumulator: [-t; MOTORS],
            increment,
            direction,
            period: 2 * t,
        }
    }
}

pub struct Runtime {
    ring: Queue<Segment, RUNTIME_RING_SLOTS>,
    current: Option<ActiveSegment>,
    state: RuntimeState,
    hold_requested: bool,
    position: [i64; MOTORS],
    invert: [bool; MOTORS],
    power: [PowerMode; MOTORS],
    enabled: [bool; MOTORS],
    power_dirty: bool,
    pulsing: u8,
    stats: RuntimeStats,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            ring: Queue::new(),
            current: None,
            state: RuntimeState::Idle,
            hold_requested: false,
            position: [0; MOTORS],
            invert: [false; MOTORS],
            power: [PowerMode::default(); MOTORS],
            enabled: [false; MOTORS],
            power_dirty: true,
            pulsing: 0,
            stats: RuntimeStats::default(),
        }
    }

    /// Pick up direction polarity and power policy from the configuration.
    pub fn configure(&mut self, config: &MachineConfig) {
        for m in 0..MOTORS {
            self.invert[m] = config.direction_inverted(m);
            self.power[m] = config.motors[m].power_mode;
        }
        self.power_dirty = true;
    }

    /// Push one segment. Fails with `RuntimeFull` when every usable slot is taken.
    pub fn load(&mut self, segment: Segment) -> MotionResult<()> {
        self.ring.enqueue(segment).map_err(|_| MotionError::RuntimeFull)
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn queued(&self) -> usize {
        self.ring.len()
    }

    /// No segment executing and none waiting.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.ring.is_empty()
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    /// Sequence number of the block being executed, or of the next one waiting.
    pub fn active_seq(&self) -> Option<u32> {
        match &self.current {
            Some(active) => Some(active.segment.seq),
            None => self.ring.peek().map(|s| s.seq),
        }
    }

    pub fn current_velocity(&self) -> f64 {
        self.current.as_ref().map_or(0.0, |a| a.segment.velocity)
    }

    /// Machine position in steps, counting every pulse fired so far.
    pub fn position(&self) -> [i64; MOTORS] {
        self.position
    }

    pub fn set_position(&mut self, steps: [i64; MOTORS]) {
        self.position = steps;
    }

    pub fn hold(&mut self) {
        self.hold_requested = true;
        if self.current.is_none() && matches!(self.state, RuntimeState::Running | RuntimeState::Starved) {
            self.state = RuntimeState::Holding;
        }
    }

    pub fn resume(&mut self) {
        self.hold_requested = false;
        if self.state == RuntimeState::Holding {
            self.state = if self.is_idle() { RuntimeState::Idle } else { RuntimeState::Running };
        }
    }

    /// Drop the executing segment and everything queued. Step position is kept.
    pub fn abort(&mut self) {
        while self.ring.dequeue().is_some() {}
        self.current = None;
        self.hold_requested = false;
        self.state = RuntimeState::Idle;
        self.power_dirty = true;
    }

    /// Apply the enable policy for the current state.
    pub fn energize<P: StepperPins + ?Sized>(&mut self, pins: &mut P) {
        let moving = self.current.as_ref().map(|a| a.segment.steps);
        for m in 0..MOTORS {
            let want = match (self.power[m], moving) {
                (PowerMode::AlwaysOn, _) => true,
                (PowerMode::InCycle, Some(_)) => true,
                (PowerMode::WhenMoving, Some(steps)) => steps[m] != 0,
                (_, None) => self.state != RuntimeState::Idle && self.power[m] == PowerMode::InCycle,
            };
            if want != self.enabled[m] {
                pins.set_enable(m, want);
                self.enabled[m] = want;
            }
        }
        self.power_dirty = false;
    }

    /// One DDA tick. Returns the mask of motors whose step line was raised.
    pub fn tick<P: StepperPins + ?Sized>(&mut self, pins: &mut P) -> u8 {
        let Some(active) = self.current.as_mut() else {
            self.advance(pins, true);
            return 0;
        };
        self.stats.ticks += 1;
        let mut mask = 0u8;
        if active.segment.kind == SegmentKind::Dwell {
            self.stats.dwell_ticks += 1;
        } else {
            for m in 0..MOTORS {
                if active.increment[m] == 0 {
                    continue;
                }
                active.accumulator[m] += active.increment[m];
                if active.accumulator[m] > 0 {
                    active.accumulator[m] -= active.period;
                    pins.step_rise(m);
                    self.position[m] += active.direction[m];
                    mask |= 1 << m;
                }
            }
        }
        active.remaining -= 1;
        if active.remaining == 0 {
            let at_rest = active.segment.ends_at_rest;
            self.current = None;
            // Load the next segment now so its direction lines settle before its first edge.
            self.advance(pins, at_rest);
        }
        self.pulsing |= mask;
        mask
    }

    /// Trailing edge of the step pulses raised by the last tick.
    pub fn pulse_end<P: StepperPins + ?Sized>(&mut self, pins: &mut P) {
        for m in 0..MOTORS {
            if self.pulsing & (1 << m) != 0 {
                pins.step_fall(m);
            }
        }
        self.pulsing = 0;
    }

    fn advance<P: StepperPins + ?Sized>(&mut self, pins: &mut P, at_rest: bool) {
        if self.hold_requested {
            if matches!(self.state, RuntimeState::Running | RuntimeState::Starved) {
                self.state = RuntimeState::Holding;
            }
        } else if let Some(segment) = self.ring.dequeue() {
            self.start(segment, pins);
            return;
        } else if self.state == RuntimeState::Running {
            if at_rest {
                self.state = RuntimeState::Idle;
                self.power_dirty = true;
            } else {
                self.state = RuntimeState::Starved;
                self.stats.starvations += 1;
            }
        }
        if self.power_dirty {
            self.energize(pins);
        }
    }

    fn start<P: StepperPins + ?Sized>(&mut self, segment: Segment, pins: &mut P) {
        for (m, steps) in segment.steps.iter().enumerate() {
            if *steps != 0 {
                pins.set_direction(m, (*steps < 0) ^ self.invert[m]);
            }
        }
        self.current = Some(ActiveSegment::new(segment));
        self.state = RuntimeState::Running;
        self.energize(pins);
    }
}
