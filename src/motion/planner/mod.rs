// src/motion/planner/mod.rs - Look-ahead move planner
//! Moves wait in a fixed ring of [`Block`]s. Every new move triggers a
//! backward pass (how fast may each block be entered and still stop by the
//! end of the queue) and a forward pass (how fast can each block actually be
//! entered given the one before it). The result is a jerk-limited
//! [`Profile`] per block, which the executor in [`exec`] slices into
//! runtime segments.

pub mod exec;

pub use exec::HoldState;

use crate::config::MachineConfig;
use crate::error::{MotionError, MotionResult};
use crate::motion::junction::junction_velocity;
use crate::motion::profile::{Profile, reachable_velocity};
use crate::motion::{EPSILON, calculate_distance, calculate_unit_vector};
use crate::{AXES, Axis, DDA_FREQUENCY_HZ, MOTORS, PLANNER_BUFFER_SIZE};
use exec::ExecState;

/// Share of the DDA rate a single motor may be asked to step at.
const STEP_RATE_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Empty,
    /// Accepted; velocities may still change as moves are appended.
    Queued,
    /// Released for execution.
    Pending,
    Running,
    /// Every segment has been handed to the runtime.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveKind {
    #[default]
    Line,
    Dwell,
}

/// How the commanded speed of a line is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveRate {
    /// Each axis at its traverse maximum.
    Traverse,
    /// Path speed in mm/min.
    Feed(f64),
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub state: BlockState,
    pub kind: MoveKind,
    pub seq: u32,
    pub unit: [f64; AXES],
    /// Length still to be planned. Shrinks when a held move is parked.
    pub length: f64,
    pub total_length: f64,
    pub steps: [i64; MOTORS],
    pub cruise_vmax: f64,
    pub junction_vmax: f64,
    /// Highest entry velocity that still allows every later block to stop in time.
    pub entry_vmax: f64,
    pub jerk: f64,
    pub profile: Profile,
    pub dwell_ticks: u32,
    pub prev: usize,
    pub next: usize,
}

pub struct Planner {
    blocks: [Block; PLANNER_BUFFER_SIZE],
    tail: usize,
    head: usize,
    count: usize,
    position: [f64; AXES],
    steps: [i64; MOTORS],
    next_seq: u32,
    exec: ExecState,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner {
    pub fn new() -> Self {
        let blocks = std::array::from_fn(|i| Block {
            prev: (i + PLANNER_BUFFER_SIZE - 1) % PLANNER_BUFFER_SIZE,
            next: (i + 1) % PLANNER_BUFFER_SIZE,
            ..Block::default()
        });
        Self {
            blocks,
            tail: 0,
            head: 0,
            count: 0,
            position: [0.0; AXES],
            steps: [0; MOTORS],
            next_seq: 1,
            exec: ExecState::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.count == PLANNER_BUFFER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        PLANNER_BUFFER_SIZE - self.count
    }

    /// Position after the last accepted move.
    pub fn get_position(&self) -> [f64; AXES] {
        self.position
    }

    /// Step position after the last accepted move.
    pub fn step_position(&self) -> [i64; MOTORS] {
        self.steps
    }

    /// Live blocks from oldest to newest.
    pub fn iter_blocks(&self) -> impl Iterator<Item = &Block> {
        (0..self.count).map(move |k| &self.blocks[(self.tail + k) % PLANNER_BUFFER_SIZE])
    }

    /// Any block that has not yet been fully handed to the runtime.
    pub fn has_work(&self) -> bool {
        self.iter_blocks().any(|b| b.state != BlockState::Exhausted) || self.exec.is_busy()
    }

    /// Queue a straight move to `target` (mm, machine coordinates).
    ///
    /// A move that rounds to no steps on any motor is not queued; the
    /// position still advances so the residual carries into the next move.
    pub fn plan_line(
        &mut self,
        target: &[f64; AXES],
        rate: MoveRate,
        config: &MachineConfig,
    ) -> MotionResult<()> {
        if self.is_full() {
            return Err(MotionError::PlannerFull);
        }
        let target_steps = self.target_steps(target, config);
        let length = calculate_distance(&self.position, target);
        if target_steps == self.steps || length < EPSILON {
            self.position = *target;
            return Err(MotionError::ZeroLengthMove);
        }

        let unit = calculate_unit_vector(&self.position, target);
        let cruise_vmax = cruise_limit(&unit, rate, config);
        if cruise_vmax <= EPSILON {
            return Err(MotionError::BadNumber);
        }
        let jerk = Axis::ALL
            .iter()
            .filter(|axis| unit[axis.index()].abs() > EPSILON)
            .map(|axis| config.jerk(*axis) / unit[axis.index()].abs())
            .fold(f64::INFINITY, f64::min);

        let junction_vmax = match self.newest() {
            Some(prev) if prev.kind == MoveKind::Line => junction_velocity(&prev.unit, &unit, config)
                .min(prev.cruise_vmax)
                .min(cruise_vmax),
            _ => 0.0,
        };

        let mut steps = [0i64; MOTORS];
        for (m, s) in steps.iter_mut().enumerate() {
            *s = target_steps[m] - self.steps[m];
        }

        let seq = self.push(Block {
            kind: MoveKind::Line,
            unit,
            length,
            total_length: length,
            steps,
            cruise_vmax,
            junction_vmax,
            jerk,
            ..Block::default()
        });
        tracing::debug!(
            "Planned line {}: length {:.4} mm, cruise {:.1} mm/min, junction {:.1} mm/min",
            seq,
            length,
            cruise_vmax,
            junction_vmax
        );
        self.position = *target;
        self.steps = target_steps;
        self.plan_lookahead(false);
        Ok(())
    }

    /// Queue a pause. A zero-length dwell queues nothing.
    pub fn plan_dwell(&mut self, seconds: f64) -> MotionResult<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(MotionError::BadNumber);
        }
        if self.is_full() {
            return Err(MotionError::PlannerFull);
        }
        let ticks = (seconds * f64::from(DDA_FREQUENCY_HZ)).round() as u32;
        if ticks == 0 {
            return Ok(());
        }
        let seq = self.push(Block {
            kind: MoveKind::Dwell,
            dwell_ticks: ticks,
            ..Block::default()
        });
        tracing::debug!("Planned dwell {}: {} ticks", seq, ticks);
        self.plan_lookahead(false);
        Ok(())
    }

    /// Release every queued block for execution. Returns true if any was queued.
    pub fn plan_finalize(&mut self) -> bool {
        let mut released = false;
        for k in 0..self.count {
            let block = &mut self.blocks[(self.tail + k) % PLANNER_BUFFER_SIZE];
            if block.state == BlockState::Queued {
                block.state = BlockState::Pending;
                released = true;
            }
        }
        released
    }

    /// Recompute entry, cruise and exit velocities of every block that is not
    /// yet running. `force` disables the early stop of the backward pass.
    pub fn plan_lookahead(&mut self, force: bool) {
        let held = self.exec.held_slot();
        let mut start_velocity = self.exec.last_exit_velocity();
        let mut list: heapless::Vec<usize, PLANNER_BUFFER_SIZE> = heapless::Vec::new();
        let mut idx = self.tail;
        for _ in 0..self.count {
            let block = &self.blocks[idx];
            match block.state {
                BlockState::Exhausted => {}
                BlockState::Running if Some(idx) != held => {
                    start_velocity = block.profile.exit_velocity;
                }
                _ => {
                    if Some(idx) == held {
                        start_velocity = 0.0;
                    }
                    // Capacity equals the ring size.
                    let _ = list.push(idx);
                }
            }
            idx = block.next;
        }
        let Some(last) = list.len().checked_sub(1) else {
            return;
        };

        let mut next_entry = 0.0;
        for (pos, &i) in list.iter().enumerate().rev() {
            let block = &mut self.blocks[i];
            let bound = match block.kind {
                MoveKind::Dwell => 0.0,
                MoveKind::Line => block
                    .junction_vmax
                    .min(block.cruise_vmax)
                    .min(reachable_velocity(next_entry, block.length, block.jerk)),
            };
            if pos != last && !force && (bound - block.entry_vmax).abs() < EPSILON {
                break;
            }
            block.entry_vmax = bound;
            next_entry = bound;
        }

        let mut v = start_velocity;
        for (pos, &i) in list.iter().enumerate() {
            let exit_cap = if pos < last { self.blocks[list[pos + 1]].entry_vmax } else { 0.0 };
            let block = &mut self.blocks[i];
            match block.kind {
                MoveKind::Dwell => {
                    block.profile = Profile::default();
                    v = 0.0;
                }
                MoveKind::Line => {
                    let entry = if pos == 0 { v } else { v.min(block.entry_vmax) };
                    let exit = exit_cap.min(reachable_velocity(entry, block.length, block.jerk));
                    block.profile = Profile::plan(entry, exit, block.cruise_vmax, block.length, block.jerk);
                    v = exit;
                }
            }
        }
    }

    /// Free exhausted blocks the runtime has finished with. `runtime_seq` is
    /// the block the runtime is executing or about to execute.
    pub fn reclaim(&mut self, runtime_seq: Option<u32>) {
        while self.count > 0 {
            let block = &mut self.blocks[self.tail];
            if block.state != BlockState::Exhausted || runtime_seq == Some(block.seq) {
                break;
            }
            block.state = BlockState::Empty;
            self.tail = block.next;
            self.count -= 1;
        }
    }

    /// Set the symbolic position and derive the step position from it.
    pub fn set_position(&mut self, position: &[f64; AXES], config: &MachineConfig) {
        self.position = *position;
        for (m, motor) in config.motors.iter().enumerate() {
            self.steps[m] = (position[motor.axis.index()] * config.steps_per_unit(m)).round() as i64;
        }
    }

    pub fn set_axis_position(&mut self, axis: Axis, value: f64, config: &MachineConfig) {
        self.position[axis.index()] = value;
        for (m, motor) in config.motors.iter().enumerate() {
            if motor.axis == axis {
                self.steps[m] = (value * config.steps_per_unit(m)).round() as i64;
            }
        }
    }

    /// Adopt a step position (usually the runtime's after an abort) and
    /// derive the symbolic position of every axis that has a motor.
    pub fn sync_from_steps(&mut self, steps: [i64; MOTORS], config: &MachineConfig) {
        self.steps = steps;
        for axis in Axis::ALL {
            if let Some(m) = config.motor_for_axis(axis) {
                self.position[axis.index()] = steps[m] as f64 / config.steps_per_unit(m);
            }
        }
    }

    /// Drop every block and the executor state. Positions are kept.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.state = BlockState::Empty;
        }
        self.tail = self.head;
        self.count = 0;
        self.exec = ExecState::default();
    }

    fn target_steps(&self, target: &[f64; AXES], config: &MachineConfig) -> [i64; MOTORS] {
        let mut steps = self.steps;
        for (m, motor) in config.motors.iter().enumerate() {
            if config.axis(motor.axis).is_enabled() {
                steps[m] = (target[motor.axis.index()] * config.steps_per_unit(m)).round() as i64;
            }
        }
        steps
    }

    fn newest(&self) -> Option<&Block> {
        (self.count > 0).then(|| &self.blocks[self.blocks[self.head].prev])
    }

    fn push(&mut self, block: Block) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let slot = &mut self.blocks[self.head];
        let (prev, next) = (slot.prev, slot.next);
        *slot = Block {
            state: BlockState::Queued,
            seq,
            prev,
            next,
            ..block
        };
        self.head = next;
        self.count += 1;
        seq
    }
}

/// Fastest path velocity allowed for a move along `unit`.
fn cruise_limit(unit: &[f64; AXES], rate: MoveRate, config: &MachineConfig) -> f64 {
    let mut limit = match rate {
        MoveRate::Traverse => f64::INFINITY,
        MoveRate::Feed(feed) => feed,
    };
    for axis in Axis::ALL {
        let u = unit[axis.index()].abs();
        if u > EPSILON {
            let a = config.axis(axis);
            let cap = match rate {
                MoveRate::Traverse => a.velocity_max,
                MoveRate::Feed(_) => a.feedrate_max,
            };
            limit = limit.min(cap / u);
        }
    }
    let max_step_rate = STEP_RATE_FRACTION * f64::from(DDA_FREQUENCY_HZ) * 60.0;
    for (m, motor) in config.motors.iter().enumerate() {
        let u = unit[motor.axis.index()].abs();
        if u > EPSILON {
            limit = limit.min(max_step_rate / (config.steps_per_unit(m) * u));
        }
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: f64, y: f64) -> [f64; AXES] {
        [x, y, 0.0, 0.0, 0.0, 0.0]
    }

    fn blocks(planner: &Planner) -> Vec<Block> {
        planner.iter_blocks().cloned().collect()
    }

    #[test]
    fn line_steps_follow_steps_per_unit() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(10.0, 0.0), MoveRate::Traverse, &config).unwrap();
        let b = &blocks(&planner)[0];
        assert_eq!(b.steps, [3200, 0, 0, 0]);
        assert_eq!(b.state, BlockState::Queued);
        assert_eq!(b.cruise_vmax, 5000.0);
        assert_eq!(planner.step_position(), [3200, 0, 0, 0]);
        assert_eq!(planner.get_position(), xy(10.0, 0.0));
    }

    #[test]
    fn zero_length_move_is_dropped() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        assert_eq!(
            planner.plan_line(&xy(0.001, 0.0), MoveRate::Feed(600.0), &config),
            Err(MotionError::ZeroLengthMove)
        );
        assert!(planner.is_empty());
        assert_eq!(planner.get_position(), xy(0.001, 0.0));
        // 0.002 mm is 0.64 steps: the carried residual makes it one step.
        planner.plan_line(&xy(0.002, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        assert_eq!(blocks(&planner)[0].steps[0], 1);
    }

    #[test]
    fn rounding_is_carried_across_moves() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        let mut total = 0;
        for k in 1..=10 {
            let x = k as f64 * 0.1015;
            planner.plan_line(&xy(x, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        }
        for b in planner.iter_blocks() {
            total += b.steps[0];
        }
        assert_eq!(total, (1.015f64 * 320.0).round() as i64);
    }

    #[test]
    fn ring_reports_full() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        for k in 1..=PLANNER_BUFFER_SIZE {
            planner.plan_line(&xy(k as f64, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        }
        assert!(planner.is_full());
        assert_eq!(planner.available(), 0);
        assert_eq!(
            planner.plan_line(&xy(100.0, 0.0), MoveRate::Feed(600.0), &config),
            Err(MotionError::PlannerFull)
        );
        assert_eq!(planner.plan_dwell(1.0), Err(MotionError::PlannerFull));
    }

    #[test]
    fn collinear_moves_keep_speed() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(5.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        planner.plan_line(&xy(10.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        let b = blocks(&planner);
        assert_eq!(b[1].junction_vmax, 600.0);
        assert_eq!(b[0].profile.exit_velocity, 600.0);
        assert_eq!(b[1].profile.entry_velocity, 600.0);
        assert_eq!(b[0].profile.tail_length, 0.0);
        assert_eq!(b[1].profile.exit_velocity, 0.0);
    }

    #[test]
    fn corner_slows_to_junction_velocity() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(10.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        planner.plan_line(&xy(10.0, 10.0), MoveRate::Feed(600.0), &config).unwrap();
        let b = blocks(&planner);
        assert!((b[1].junction_vmax - 109.87).abs() < 0.01);
        assert!((b[0].profile.exit_velocity - b[1].junction_vmax).abs() < 1e-9);
        assert_eq!(b[0].profile.exit_velocity, b[1].profile.entry_velocity);
    }

    #[test]
    fn reversal_stops() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(10.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        planner.plan_line(&xy(0.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        let b = blocks(&planner);
        assert_eq!(b[1].junction_vmax, 0.0);
        assert_eq!(b[0].profile.exit_velocity, 0.0);
    }

    #[test]
    fn dwell_separates_moves() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(5.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        planner.plan_dwell(1.0).unwrap();
        planner.plan_line(&xy(10.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        planner.plan_dwell(0.0).unwrap();
        let b = blocks(&planner);
        assert_eq!(b.len(), 3);
        assert_eq!(b[1].kind, MoveKind::Dwell);
        assert_eq!(b[1].dwell_ticks, 50_000);
        assert_eq!(b[0].profile.exit_velocity, 0.0);
        assert_eq!(b[2].junction_vmax, 0.0);
        assert_eq!(b[2].profile.entry_velocity, 0.0);
    }

    #[test]
    fn feed_is_capped_per_axis() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        let target = [0.0, 0.0, 10.0, 0.0, 0.0, 0.0];
        planner.plan_line(&target, MoveRate::Feed(3000.0), &config).unwrap();
        assert_eq!(blocks(&planner)[0].cruise_vmax, 1200.0);
    }

    #[test]
    fn step_rate_is_capped() {
        let mut config = MachineConfig::default();
        config.axes.x.velocity_max = 100_000.0;
        let mut planner = Planner::new();
        planner.plan_line(&xy(50.0, 0.0), MoveRate::Traverse, &config).unwrap();
        let cap = 0.9 * 50_000.0 * 60.0 / 320.0;
        assert!((blocks(&planner)[0].cruise_vmax - cap).abs() < 1e-9);
    }

    #[test]
    fn finalize_releases_queued_blocks() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.plan_line(&xy(5.0, 0.0), MoveRate::Feed(600.0), &config).unwrap();
        assert!(planner.plan_finalize());
        assert!(!planner.plan_finalize());
        assert_eq!(blocks(&planner)[0].state, BlockState::Pending);
    }

    #[test]
    fn sync_from_steps_rebuilds_position() {
        let config = MachineConfig::default();
        let mut planner = Planner::new();
        planner.sync_from_steps([320, -640, 800, 0], &config);
        let p = planner.get_position();
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert!((p[1] + 2.0).abs() < 1e-12);
        assert!((p[2] - 1.0).abs() < 1e-12);
        planner.set_axis_position(Axis::Y, 3.0, &config);
        assert_eq!(planner.step_position()[1], 960);
    }
}
