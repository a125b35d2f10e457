// src/motion/planner/exec.rs - Slicing planned blocks into runtime segments
use super::{BlockState, MoveKind, Planner};
use crate::motion::profile::{Profile, transition_length, transition_time};
use crate::motion::stepper::{Runtime, Segment, SegmentKind};
use crate::motion::{EPSILON, segment_minutes, ticks_for_minutes};
use crate::MOTORS;
use serde::Serialize;

/// Remaining lengths below this finish the block instead of parking it.
const PARK_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldState {
    #[default]
    Off,
    /// Feedhold seen; takes effect at the next segment boundary.
    Requested,
    Decelerating,
    /// Stopped on the path, resumable.
    Held,
}

/// One constant-jerk velocity ramp (or a constant-velocity stretch when
/// start and end velocities match).
#[derive(Debug, Clone, Copy, Default)]
struct Phase {
    start_velocity: f64,
    end_velocity: f64,
    length: f64,
    /// Minutes.
    duration: f64,
    jerk: f64,
    /// Block distance at which the phase starts.
    origin: f64,
}

impl Phase {
    /// Distance covered and velocity reached `t` minutes into the phase.
    fn sample(&self, t: f64) -> (f64, f64) {
        let dv = self.end_velocity - self.start_velocity;
        if dv.abs() < EPSILON || self.duration <= 0.0 {
            let fraction = if self.duration > 0.0 { t / self.duration } else { 1.0 };
            return (self.length * fraction, self.start_velocity);
        }
        let sign = dv.signum();
        let j = self.jerk;
        let (s, v) = if t <= self.duration / 2.0 {
            (
                self.start_velocity * t + sign * j * t * t * t / 6.0,
                self.start_velocity + sign * j * t * t / 2.0,
            )
        } else {
            let tau = self.duration - t;
            (
                self.length - (self.end_velocity * tau - sign * j * tau * tau * tau / 6.0),
                self.end_velocity - sign * j * tau * tau / 2.0,
            )
        };
        (s.clamp(0.0, self.length), v.max(0.0))
    }

    fn segments(&self) -> u32 {
        ((self.duration / segment_minutes()).ceil() as u32).max(1)
    }
}

#[derive(Debug, Clone)]
struct ActiveBlock {
    slot: usize,
    seq: u32,
    kind: MoveKind,
    total_length: f64,
    steps: [i64; MOTORS],
    emitted: [i64; MOTORS],
    /// Distance from the block start reached by the last emitted segment.
    distance: f64,
    velocity: f64,
    jerk: f64,
    phases: [Phase; 3],
    phase_count: usize,
    phase: usize,
    segment: u32,
    segments: u32,
    dwell_ticks: u32,
}

impl ActiveBlock {
    fn load_phases(&mut self, profile: &Profile) {
        let mut origin = self.distance;
        let mut count = 0;
        let candidates = [
            (profile.entry_velocity, profile.cruise_velocity, profile.head_length, profile.t_accel),
            (profile.cruise_velocity, profile.cruise_velocity, profile.body_length, profile.t_cruise),
            (profile.cruise_velocity, profile.exit_velocity, profile.tail_length, profile.t_decel),
        ];
        for (start_velocity, end_velocity, length, seconds) in candidates {
            if length < EPSILON {
                continue;
            }
            self.phases[count] = Phase {
                start_velocity,
                end_velocity,
                length,
                duration: seconds / 60.0,
                jerk: self.jerk,
                origin,
            };
            origin += length;
            count += 1;
        }
        if count == 0 {
            let v = profile.cruise_velocity;
            self.phases[0] = Phase {
                start_velocity: v,
                end_velocity: v,
                length: (self.total_length - self.distance).max(0.0),
                duration: segment_minutes(),
                jerk: self.jerk,
                origin: self.distance,
            };
            count = 1;
        }
        self.set_phases(count);
    }

    fn set_phases(&mut self, count: usize) {
        self.phase_count = count;
        self.phase = 0;
        self.segment = 0;
        self.segments = self.phases[0].segments();
    }

    fn remaining(&self) -> f64 {
        (self.total_length - self.distance).max(0.0)
    }
}

/// Executor state kept inside the planner.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecState {
    hold: HoldState,
    active: Option<ActiveBlock>,
    /// Segment produced but refused by a full runtime.
    staged: Option<Segment>,
    last_exit_velocity: f64,
}

impl ExecState {
    pub(crate) fn held_slot(&self) -> Option<usize> {
        match (&self.active, self.hold) {
            (Some(active), HoldState::Held) if active.kind == MoveKind::Line => Some(active.slot),
            _ => None,
        }
    }

    pub(crate) fn last_exit_velocity(&self) -> f64 {
        self.last_exit_velocity
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.active.is_some() || self.staged.is_some()
    }
}

impl Planner {
    pub fn hold_state(&self) -> HoldState {
        self.exec.hold
    }

    /// Ask the executor to bring the machine to rest. Repeated requests are ignored.
    pub fn request_hold(&mut self) {
        if self.exec.hold == HoldState::Off {
            self.exec.hold = HoldState::Requested;
        }
    }

    /// Leave a hold. Returns false while the machine is still decelerating.
    pub fn resume(&mut self) -> bool {
        match self.exec.hold {
            HoldState::Off => true,
            HoldState::Requested => {
                self.exec.hold = HoldState::Off;
                true
            }
            HoldState::Decelerating => false,
            HoldState::Held => {
                self.plan_lookahead(true);
                if let Some(active) = self.exec.active.as_mut() {
                    if active.kind == MoveKind::Line {
                        let profile = self.blocks[active.slot].profile;
                        active.velocity = 0.0;
                        active.load_phases(&profile);
                    }
                }
                self.exec.hold = HoldState::Off;
                tracing::info!("Resuming from feedhold");
                true
            }
        }
    }

    /// Velocity at the end of the last emitted segment.
    pub fn exec_velocity(&self) -> f64 {
        self.exec.active.as_ref().map_or(self.exec.last_exit_velocity, |a| a.velocity)
    }

    /// Hand segments to the runtime until it is full or nothing is ready.
    /// Returns the number of segments loaded.
    pub fn fill(&mut self, runtime: &mut Runtime) -> usize {
        let running = runtime.active_seq().or(self.exec.staged.map(|s| s.seq));
        self.reclaim(running);
        let mut loaded = 0;
        while !runtime.is_full() {
            let Some(segment) = self.exec.staged.take().or_else(|| self.next_segment()) else {
                break;
            };
            if runtime.load(segment).is_err() {
                self.exec.staged = Some(segment);
                break;
            }
            tracing::trace!(
                "Segment for block {}: {} ticks, steps {:?}",
                segment.seq,
                segment.ticks,
                segment.steps
            );
            loaded += 1;
        }
        loaded
    }

    /// Produce the next segment, starting blocks as needed.
    pub fn next_segment(&mut self) -> Option<Segment> {
        if self.exec.active.is_none() {
            if self.exec.hold != HoldState::Off && self.exec.last_exit_velocity <= EPSILON {
                self.exec.hold = HoldState::Held;
                return None;
            }
            let slot = self.next_startable()?;
            self.start_block(slot);
        }
        if self.exec.hold == HoldState::Held {
            return None;
        }
        let kind = self.exec.active.as_ref()?.kind;
        match kind {
            MoveKind::Dwell => self.emit_dwell(),
            MoveKind::Line => {
                if self.exec.hold == HoldState::Requested {
                    self.begin_deceleration();
                    if self.exec.hold == HoldState::Held {
                        return None;
                    }
                }
                self.emit_line()
            }
        }
    }

    fn next_startable(&self) -> Option<usize> {
        let mut idx = self.tail;
        for _ in 0..self.count {
            let block = &self.blocks[idx];
            match block.state {
                BlockState::Exhausted => idx = block.next,
                BlockState::Pending => return Some(idx),
                BlockState::Queued if self.exec.last_exit_velocity > EPSILON => return Some(idx),
                _ => return None,
            }
        }
        None
    }

    fn start_block(&mut self, slot: usize) {
        let block = &mut self.blocks[slot];
        block.state = BlockState::Running;
        let mut active = ActiveBlock {
            slot,
            seq: block.seq,
            kind: block.kind,
            total_length: block.total_length,
            steps: block.steps,
            emitted: [0; MOTORS],
            distance: 0.0,
            velocity: block.profile.entry_velocity,
            jerk: block.jerk,
            phases: [Phase::default(); 3],
            phase_count: 0,
            phase: 0,
            segment: 0,
            segments: 0,
            dwell_ticks: block.dwell_ticks,
        };
        let profile = block.profile;
        if block.kind == MoveKind::Line {
            active.load_phases(&profile);
        }
        tracing::debug!("Executing block {} ({:.3} s planned)", active.seq, profile.duration());
        self.exec.active = Some(active);
    }

    fn finish_block(&mut self) {
        if let Some(active) = self.exec.active.take() {
            let block = &mut self.blocks[active.slot];
            block.state = BlockState::Exhausted;
            self.exec.last_exit_velocity = match active.kind {
                MoveKind::Line => active.velocity,
                MoveKind::Dwell => 0.0,
            };
        }
    }

    fn emit_dwell(&mut self) -> Option<Segment> {
        let active = self.exec.active.as_mut()?;
        if self.exec.hold == HoldState::Requested {
            self.exec.hold = HoldState::Held;
            tracing::info!("Feedhold during dwell, {} ticks left", active.dwell_ticks);
            return None;
        }
        let chunk = active.dwell_ticks.min(ticks_for_minutes(segment_minutes()));
        active.dwell_ticks -= chunk;
        let segment = Segment::dwell(chunk, active.seq);
        if active.dwell_ticks == 0 {
            self.finish_block();
        }
        Some(segment)
    }

    /// Replace the remaining phases with a stop from the current velocity.
    fn begin_deceleration(&mut self) {
        let Some(active) = self.exec.active.as_mut() else {
            return;
        };
        let v = active.velocity;
        let remaining = active.remaining();
        if v <= EPSILON {
            self.exec.hold = HoldState::Held;
            self.park();
            return;
        }
        let mut jerk = active.jerk;
        let mut length = transition_length(v, 0.0, jerk);
        if length > remaining {
            // Compress the stop into what is left of the block.
            jerk = v * v * v / (remaining * remaining);
            length = remaining;
        }
        active.phases[0] = Phase {
            start_velocity: v,
            end_velocity: 0.0,
            length,
            duration: transition_time(v, 0.0, jerk),
            jerk,
            origin: active.distance,
        };
        active.set_phases(1);
        self.exec.hold = HoldState::Decelerating;
        tracing::info!(
            "Feedhold: stopping from {:.1} mm/min within {:.4} mm of block {}",
            v,
            length,
            active.seq
        );
    }

    fn emit_line(&mut self) -> Option<Segment> {
        let decelerating = self.exec.hold == HoldState::Decelerating;
        let active = self.exec.active.as_mut()?;
        let phase = active.phases[active.phase];
        active.segment += 1;
        let last_of_phase = active.segment >= active.segments;
        let dt = phase.duration / f64::from(active.segments);
        let (offset, velocity) = if last_of_phase {
            (phase.length, phase.end_velocity)
        } else {
            phase.sample(phase.duration * f64::from(active.segment) / f64::from(active.segments))
        };
        if last_of_phase {
            active.phase += 1;
            active.segment = 0;
            if active.phase < active.phase_count {
                active.segments = active.phases[active.phase].segments();
            }
        }
        let block_done = active.phase >= active.phase_count;

        let mut distance = (phase.origin + offset).min(active.total_length);
        if block_done && !decelerating {
            distance = active.total_length;
        }
        let lands = distance >= active.total_length - EPSILON;

        let mut steps = [0i32; MOTORS];
        let mut max_steps = 0u32;
        for m in 0..MOTORS {
            let target = if lands {
                active.steps[m]
            } else {
                (active.steps[m] as f64 * distance / active.total_length).round() as i64
            };
            let delta = target - active.emitted[m];
            active.emitted[m] = target;
            steps[m] = delta as i32;
            max_steps = max_steps.max(delta.unsigned_abs() as u32);
        }
        active.distance = distance;
        active.velocity = velocity;

        let ends_at_rest = block_done && velocity <= EPSILON;
        let segment = Segment {
            kind: SegmentKind::Motion,
            ticks: ticks_for_minutes(dt).max(max_steps).max(1),
            steps,
            velocity,
            seq: active.seq,
            ends_at_rest,
        };

        if block_done {
            if decelerating {
                self.exec.hold = HoldState::Held;
                self.park();
            } else {
                self.finish_block();
            }
        }
        Some(segment)
    }

    /// Stopped mid-block: shrink the block to what is left and replan
    /// everything after it from rest.
    fn park(&mut self) {
        self.exec.last_exit_velocity = 0.0;
        let Some(active) = self.exec.active.as_mut() else {
            return;
        };
        active.velocity = 0.0;
        let remaining = active.remaining();
        if remaining <= PARK_EPSILON && active.emitted == active.steps {
            tracing::info!("Feedhold reached the end of block {}", active.seq);
            self.finish_block();
        } else {
            self.blocks[active.slot].length = remaining.max(PARK_EPSILON);
            tracing::info!("Held with {:.4} mm left in block {}", remaining, active.seq);
        }
        self.plan_lookahead(true);
    }
}
