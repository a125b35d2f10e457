// src/machine/mod.rs - Canonical machine: modal state and coordinate handling
//! Turns canonical commands into planner calls. Positions handed to the
//! planner are machine coordinates in millimetres (degrees for rotary axes);
//! everything the program supplies is composed with the active coordinate
//! system and G92 offset first.

pub mod command;
pub mod homing;

pub use command::{CanonicalCommand, ModalState};
pub use homing::HomingCycle;

use crate::config::MachineConfig;
use crate::error::{MotionError, MotionResult};
use crate::motion::arc::{ArcCenter, ArcGenerator, ArcSpec};
use crate::motion::planner::{MoveRate, Planner};
use crate::motion::{EPSILON, calculate_distance};
use crate::{AXES, Axis};
use command::{
    ArcCommand, AxisWords, COORD_SYSTEMS, CoolantChange, DistanceMode, FeedMode, ModalChange, MotionMode,
    OriginCommand,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineMode {
    #[default]
    Reset,
    Ready,
    Run,
    Hold,
    Alarm,
}

pub struct CanonicalMachine {
    modal: ModalState,
    mode: MachineMode,
    offsets: [[f64; AXES]; COORD_SYSTEMS],
    g92: [f64; AXES],
    g92_enabled: bool,
    /// Machine position after the last accepted command.
    position: [f64; AXES],
    homed: [bool; AXES],
    line_number: u32,
    arc: Option<ArcGenerator>,
}

impl Default for CanonicalMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalMachine {
    pub fn new() -> Self {
        Self {
            modal: ModalState::default(),
            mode: MachineMode::Reset,
            offsets: [[0.0; AXES]; COORD_SYSTEMS],
            g92: [0.0; AXES],
            g92_enabled: false,
            position: [0.0; AXES],
            homed: [false; AXES],
            line_number: 0,
            arc: None,
        }
    }

    pub fn modal(&self) -> &ModalState {
        &self.modal
    }

    pub fn mode(&self) -> MachineMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MachineMode) {
        if mode != self.mode {
            tracing::info!("Machine mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    pub fn line_number(&self) -> u32 {
        self.line_number
    }

    pub fn set_line_number(&mut self, line: u32) {
        self.line_number = line;
    }

    pub fn position(&self) -> [f64; AXES] {
        self.position
    }

    /// Adopt a position reconstructed elsewhere (after an abort or homing stop).
    pub fn sync_position(&mut self, position: [f64; AXES]) {
        self.position = position;
    }

    pub fn set_axis_position(&mut self, axis: Axis, value: f64) {
        self.position[axis.index()] = value;
    }

    pub fn is_homed(&self, axis: Axis) -> bool {
        self.homed[axis.index()]
    }

    pub fn mark_homed(&mut self, axis: Axis) {
        self.homed[axis.index()] = true;
    }

    /// Offset currently added to programmed absolute coordinates.
    fn active_offset(&self, i: usize) -> f64 {
        let g92 = if self.g92_enabled { self.g92[i] } else { 0.0 };
        self.offsets[self.modal.coord_system][i] + g92
    }

    /// Position in the active work coordinates and program units.
    pub fn work_position(&self) -> [f64; AXES] {
        self.to_work(&self.position)
    }

    /// Express a machine position in the active work coordinates and program units.
    pub fn to_work(&self, machine: &[f64; AXES]) -> [f64; AXES] {
        let mut work = [0.0; AXES];
        for axis in Axis::ALL {
            let i = axis.index();
            let mm = machine[i] - self.active_offset(i);
            work[i] = if axis.is_rotary() { mm } else { self.modal.units.from_mm(mm) };
        }
        work
    }

    fn to_mm(&self, axis: Axis, value: f64) -> f64 {
        if axis.is_rotary() { value } else { self.modal.units.to_mm(value) }
    }

    /// Machine position for a set of programmed axis words.
    pub fn to_machine(&self, words: &AxisWords, machine_coords: bool, config: &MachineConfig) -> [f64; AXES] {
        let mut target = self.position;
        for axis in Axis::ALL {
            let i = axis.index();
            let Some(value) = words[i] else {
                continue;
            };
            if !config.axis(axis).is_enabled() {
                continue;
            }
            let mm = self.to_mm(axis, value);
            target[i] = if machine_coords {
                mm
            } else {
                match self.modal.distance {
                    DistanceMode::Absolute => mm + self.active_offset(i),
                    DistanceMode::Incremental => self.position[i] + mm,
                }
            };
        }
        target
    }

    fn check_soft_limits(&self, target: &[f64; AXES], config: &MachineConfig) -> MotionResult<()> {
        if !config.system.soft_limits {
            return Ok(());
        }
        for axis in Axis::ALL {
            let a = config.axis(axis);
            let v = target[axis.index()];
            if a.is_enabled() && a.has_travel_range() && (v < a.travel_min - EPSILON || v > a.travel_max + EPSILON) {
                tracing::warn!(
                    "Soft limit: {} target {:.3} outside {:.3}..{:.3}",
                    axis.letter(),
                    v,
                    a.travel_min,
                    a.travel_max
                );
                return Err(MotionError::SoftLimit);
            }
        }
        Ok(())
    }

    /// Path feed in mm/min for a move of `length`. Inverse-time feed is
    /// used up by the move that consumes it.
    fn path_feed(&mut self, length: f64) -> MotionResult<f64> {
        let feed = self.modal.feed_rate;
        if feed <= 0.0 {
            return Err(MotionError::BadNumber);
        }
        match self.modal.feed_mode {
            FeedMode::UnitsPerMinute => Ok(self.modal.units.to_mm(feed)),
            FeedMode::InverseTime => {
                self.modal.feed_rate = 0.0;
                Ok(length * feed)
            }
        }
    }

    /// Hand a straight move to the planner. A move too short to produce a
    /// step still updates the position.
    fn submit_line(
        &mut self,
        target: [f64; AXES],
        rate: MoveRate,
        planner: &mut Planner,
        config: &MachineConfig,
    ) -> MotionResult<()> {
        match planner.plan_line(&target, rate, config) {
            Ok(()) => {
                self.position = target;
                Ok(())
            }
            Err(e) if e.is_informational() => {
                tracing::debug!("Dropped move to {:?}: {}", target, e);
                self.position = target;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply one canonical command. Back-pressure errors leave every piece
    /// of state untouched so the command can be retried.
    pub fn execute(
        &mut self,
        command: &CanonicalCommand,
        planner: &mut Planner,
        config: &MachineConfig,
    ) -> MotionResult<()> {
        match command {
            CanonicalCommand::StraightTraverse { target, machine_coords } => {
                let target = self.to_machine(target, *machine_coords, config);
                self.check_soft_limits(&target, config)?;
                if planner.is_full() {
                    return Err(MotionError::PlannerFull);
                }
                self.submit_line(target, MoveRate::Traverse, planner, config)
            }
            CanonicalCommand::StraightFeed { target, machine_coords } => {
                let target = self.to_machine(target, *machine_coords, config);
                self.check_soft_limits(&target, config)?;
                if planner.is_full() {
                    return Err(MotionError::PlannerFull);
                }
                let feed = self.path_feed(calculate_distance(&self.position, &target))?;
                self.submit_line(target, MoveRate::Feed(feed), planner, config)
            }
            CanonicalCommand::ArcFeed(arc) => self.start_arc(arc, config),
            CanonicalCommand::Dwell { seconds } => planner.plan_dwell(*seconds),
            CanonicalCommand::ProgramStop { .. } => Ok(()),
            CanonicalCommand::ProgramEnd => {
                self.program_end();
                Ok(())
            }
            CanonicalCommand::SetOrigin(origin) => {
                self.set_origin(origin, planner, config);
                Ok(())
            }
            CanonicalCommand::SelectCoordSystem(system) => {
                self.modal.coord_system = *system;
                Ok(())
            }
            CanonicalCommand::ChangeModal(change) => {
                self.change_modal(*change);
                Ok(())
            }
            // Homing cycles are driven by the scheduler.
            CanonicalCommand::Home { .. } => Err(MotionError::UnsupportedCommand),
        }
    }

    fn change_modal(&mut self, change: ModalChange) {
        let m = &mut self.modal;
        match change {
            ModalChange::FeedMode(mode) => m.feed_mode = mode,
            ModalChange::FeedRate(f) => m.feed_rate = f,
            ModalChange::SpindleSpeed(s) => m.spindle_speed = s,
            ModalChange::Tool(t) => m.tool = t,
            ModalChange::Spindle(s) => m.spindle = s,
            ModalChange::Coolant(CoolantChange::Mist) => m.coolant.mist = true,
            ModalChange::Coolant(CoolantChange::Flood) => m.coolant.flood = true,
            ModalChange::Coolant(CoolantChange::Off) => {
                m.coolant.mist = false;
                m.coolant.flood = false;
            }
            ModalChange::Plane(p) => m.plane = p,
            ModalChange::Units(u) => m.units = u,
            ModalChange::Distance(d) => m.distance = d,
            ModalChange::ArcDistance(d) => m.arc_distance = d,
            ModalChange::MotionMode(mode) => m.motion_mode = mode,
        }
    }

    fn set_origin(&mut self, origin: &OriginCommand, planner: &mut Planner, config: &MachineConfig) {
        match origin {
            OriginCommand::CoordOffset { system, offsets } => {
                for axis in Axis::ALL {
                    if let Some(v) = offsets[axis.index()] {
                        self.offsets[*system][axis.index()] = self.to_mm(axis, v);
                    }
                }
            }
            OriginCommand::SetPosition(words) => {
                for axis in Axis::ALL {
                    if let Some(v) = words[axis.index()] {
                        let mm = self.to_mm(axis, v);
                        self.position[axis.index()] = mm;
                        self.homed[axis.index()] = true;
                        planner.set_axis_position(axis, mm, config);
                    }
                }
                tracing::info!("Machine position set to {:?}", self.position);
            }
            OriginCommand::G92Set(words) => {
                for axis in Axis::ALL {
                    let i = axis.index();
                    if let Some(v) = words[i] {
                        self.g92[i] = self.position[i] - self.offsets[self.modal.coord_system][i] - self.to_mm(axis, v);
                    } else if !self.g92_enabled {
                        self.g92[i] = 0.0;
                    }
                }
                self.g92_enabled = true;
            }
            OriginCommand::G92Reset => {
                self.g92 = [0.0; AXES];
                self.g92_enabled = false;
            }
            OriginCommand::G92Suspend => self.g92_enabled = false,
            OriginCommand::G92Resume => self.g92_enabled = true,
        }
    }

    /// M2/M30 modal reset.
    pub fn program_end(&mut self) {
        self.g92 = [0.0; AXES];
        self.g92_enabled = false;
        let m = &mut self.modal;
        m.coord_system = 0;
        m.plane = command::Plane::Xy;
        m.distance = DistanceMode::Absolute;
        m.feed_mode = FeedMode::UnitsPerMinute;
        m.spindle = command::Spindle::Off;
        m.coolant = command::Coolant::default();
        m.motion_mode = MotionMode::Cancelled;
        tracing::info!("Program end");
    }

    pub fn arc_active(&self) -> bool {
        self.arc.as_ref().is_some_and(ArcGenerator::is_active)
    }

    fn start_arc(&mut self, arc: &ArcCommand, config: &MachineConfig) -> MotionResult<()> {
        let target = self.to_machine(&arc.target, false, config);
        self.check_soft_limits(&target, config)?;
        let plane = self.modal.plane.axes();
        let center = match (arc.radius, arc.offsets[plane.0], arc.offsets[plane.1]) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => return Err(MotionError::ArcGeometry),
            (Some(r), None, None) => ArcCenter::Radius(self.modal.units.to_mm(r)),
            (None, None, None) => return Err(MotionError::ArcGeometry),
            (None, i, j) => {
                let mut offset = [
                    self.modal.units.to_mm(i.unwrap_or(0.0)),
                    self.modal.units.to_mm(j.unwrap_or(0.0)),
                ];
                if self.modal.arc_distance == DistanceMode::Absolute {
                    // Centre given in work coordinates.
                    offset[0] += self.active_offset(plane.0) - self.position[plane.0];
                    offset[1] += self.active_offset(plane.1) - self.position[plane.1];
                }
                ArcCenter::Offset(offset)
            }
        };
        let mut spec = ArcSpec {
            start: self.position,
            target,
            center,
            plane,
            clockwise: arc.clockwise,
            turns: arc.turns,
            feed: 1.0,
            chord_tolerance: config.system.chord_tolerance,
            chord_time_max: config.system.chord_time_max,
        };
        // Inverse time needs the path length, which needs the geometry.
        let sizing = ArcGenerator::new(&spec)?;
        spec.feed = self.path_feed(sizing.path_length())?;
        let arc = ArcGenerator::new(&spec)?;
        tracing::debug!("Arc of radius {:.3} mm over {:.3} mm of path", arc.radius(), arc.path_length());
        self.arc = Some(arc);
        Ok(())
    }

    /// Plan the next chord of the active arc. Returns false when no arc is running.
    pub fn arc_step(&mut self, planner: &mut Planner, config: &MachineConfig) -> MotionResult<bool> {
        let Some(arc) = self.arc.as_mut() else {
            return Ok(false);
        };
        let Some(point) = arc.next_point() else {
            self.arc = None;
            return Ok(false);
        };
        let feed = arc.feed();
        match self.submit_line(point, MoveRate::Feed(feed), planner, config) {
            Ok(()) => {
                if let Some(arc) = self.arc.as_mut() {
                    arc.advance();
                }
                Ok(true)
            }
            Err(e) if e.is_back_pressure() => Err(e),
            Err(e) => {
                self.abort_arc();
                Err(e)
            }
        }
    }

    pub fn abort_arc(&mut self) {
        if let Some(arc) = self.arc.as_mut() {
            arc.abort();
        }
        self.arc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::{interpret, parse_block};

    fn run(machine: &mut CanonicalMachine, planner: &mut Planner, config: &MachineConfig, line: &str) -> MotionResult<()> {
        let block = parse_block(line)?;
        let commands = interpret(&block, machine.modal().motion_mode)?;
        for command in commands.iter() {
            machine.execute(command, planner, config)?;
        }
        Ok(())
    }

    fn setup() -> (CanonicalMachine, Planner, MachineConfig) {
        (CanonicalMachine::new(), Planner::new(), MachineConfig::default())
    }

    #[test]
    fn absolute_moves_compose_offsets() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G10 L2 P2 X10 Y20").unwrap();
        run(&mut m, &mut p, &c, "G55 G0 X1 Y1").unwrap();
        assert_eq!(m.position()[0], 11.0);
        assert_eq!(m.position()[1], 21.0);
        assert_eq!(m.work_position()[0], 1.0);
        run(&mut m, &mut p, &c, "G53 G0 X5").unwrap();
        assert_eq!(m.position()[0], 5.0);
    }

    #[test]
    fn incremental_and_inch_moves() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G20 G91 G0 X1").unwrap();
        run(&mut m, &mut p, &c, "X1").unwrap();
        assert!((m.position()[0] - 50.8).abs() < 1e-9);
        assert!((m.work_position()[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn g92_offsets_current_point() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G0 X10").unwrap();
        run(&mut m, &mut p, &c, "G92 X0").unwrap();
        assert_eq!(m.work_position()[0], 0.0);
        run(&mut m, &mut p, &c, "G0 X5").unwrap();
        assert_eq!(m.position()[0], 15.0);
        run(&mut m, &mut p, &c, "G92.2").unwrap();
        assert_eq!(m.work_position()[0], 15.0);
        run(&mut m, &mut p, &c, "G92.3").unwrap();
        assert_eq!(m.work_position()[0], 5.0);
        run(&mut m, &mut p, &c, "G92.1").unwrap();
        assert_eq!(m.work_position()[0], 15.0);
    }

    #[test]
    fn feed_move_needs_feed_rate() {
        let (mut m, mut p, c) = setup();
        assert_eq!(run(&mut m, &mut p, &c, "G1 X10"), Err(MotionError::BadNumber));
        assert_eq!(m.position()[0], 0.0);
        run(&mut m, &mut p, &c, "G1 F600 X10").unwrap();
        assert_eq!(p.iter_blocks().next().unwrap().cruise_vmax, 600.0);
    }

    #[test]
    fn inverse_time_feed_is_per_move() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G93 G1 X10 F30").unwrap();
        // 10 mm in 1/30 min is 300 mm/min.
        assert!((p.iter_blocks().next().unwrap().cruise_vmax - 300.0).abs() < 1e-9);
        assert_eq!(run(&mut m, &mut p, &c, "X20"), Err(MotionError::BadNumber));
    }

    #[test]
    fn soft_limits_reject_out_of_range_targets() {
        let (mut m, mut p, mut c) = setup();
        c.system.soft_limits = true;
        assert_eq!(run(&mut m, &mut p, &c, "G0 X250"), Err(MotionError::SoftLimit));
        assert_eq!(run(&mut m, &mut p, &c, "G0 X-1"), Err(MotionError::SoftLimit));
        assert!(p.is_empty());
        // Rotary axes without a travel range are not limited.
        run(&mut m, &mut p, &c, "G0 A720").unwrap();
    }

    #[test]
    fn sub_step_move_is_absorbed() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G0 X0.001").unwrap();
        assert_eq!(m.position()[0], 0.001);
        assert!(p.is_empty());
        run(&mut m, &mut p, &c, "G0 X1").unwrap();
        assert_eq!(p.iter_blocks().count(), 1);
    }

    #[test]
    fn disabled_axis_keeps_position() {
        let (mut m, mut p, mut c) = setup();
        c.axes.y.mode = crate::config::AxisMode::Disabled;
        run(&mut m, &mut p, &c, "G0 X5 Y5").unwrap();
        assert_eq!(m.position()[1], 0.0);
    }

    #[test]
    fn program_end_resets_modes() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G91 G18 G55 G93 M3 M8").unwrap();
        run(&mut m, &mut p, &c, "G92 X3").unwrap();
        run(&mut m, &mut p, &c, "M2").unwrap();
        let modal = m.modal();
        assert_eq!(modal.distance, DistanceMode::Absolute);
        assert_eq!(modal.plane, command::Plane::Xy);
        assert_eq!(modal.coord_system, 0);
        assert_eq!(modal.feed_mode, FeedMode::UnitsPerMinute);
        assert_eq!(modal.spindle, command::Spindle::Off);
        assert!(!modal.coolant.flood);
        assert_eq!(m.work_position()[0], 0.0);
    }

    #[test]
    fn arc_is_generated_chord_by_chord() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G2 X0 Y0 I10 J0 F500").unwrap();
        assert!(m.arc_active());
        let mut chords = 0;
        while m.arc_step(&mut p, &c).unwrap() {
            chords += 1;
            if p.is_full() {
                p.reset();
            }
        }
        assert!(chords > 100);
        assert!(!m.arc_active());
        assert!(m.position()[0].abs() < 1e-12 && m.position()[1].abs() < 1e-12);
    }

    #[test]
    fn arc_needs_exactly_one_centre_form() {
        let (mut m, mut p, c) = setup();
        assert_eq!(run(&mut m, &mut p, &c, "G2 X10 Y10 F500"), Err(MotionError::ArcGeometry));
        assert_eq!(run(&mut m, &mut p, &c, "G2 X10 Y10 I10 R10 F500"), Err(MotionError::ArcGeometry));
        assert!(!m.arc_active());
    }

    #[test]
    fn set_position_marks_axes_homed() {
        let (mut m, mut p, c) = setup();
        run(&mut m, &mut p, &c, "G28.3 X50 Z10").unwrap();
        assert!(m.is_homed(Axis::X) && m.is_homed(Axis::Z) && !m.is_homed(Axis::Y));
        assert_eq!(p.step_position()[0], 16_000);
        assert_eq!(p.step_position()[2], 8_000);
    }
}
