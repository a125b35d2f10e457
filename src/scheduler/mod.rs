// src/scheduler/mod.rs - Cooperative controller loop and interrupt entry points
//! [`Controller`] owns every piece of foreground state and runs the task list
//! one pass at a time. No task blocks: a task that cannot proceed leaves its
//! work in place and the next pass tries again. The DDA, pulse trailing edge
//! and housekeeping tick enter through [`Controller::dda_tick`],
//! [`Controller::pulse_end`] and [`Controller::rtc_tick`].

pub mod signals;
pub mod switches;

pub use signals::{Signal, Signals};
pub use switches::Switches;

use crate::config::MachineConfig;
use crate::config::tokens::{ConfigChange, ConfigCommand, Token, parse_config_line};
use crate::error::{MotionError, MotionResult};
use crate::gcode::{CommandQueue, interpret, parse_block};
use crate::hardware::{
    LineBuffer, LineSource, LineStatus, ResponseSink, SettingsListener, StepperPins, SwitchId, SwitchInputs,
};
use crate::machine::{CanonicalCommand, CanonicalMachine, HomingCycle, MachineMode};
use crate::machine::command::OriginCommand;
use crate::motion::planner::{HoldState, Planner};
use crate::motion::stepper::Runtime;
use crate::report::{Response, StatusReport};
use crate::{AXES, Axis, RTC_PERIOD_MS};
use std::sync::Arc;

/// Outcome of one scheduler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Idle,
    Progress,
    /// Blocked on back-pressure; retried next pass.
    Again,
}

impl Task {
    fn progressed(self) -> bool {
        self == Task::Progress
    }
}

/// Deferred settings writes waiting for the machine to go idle.
const DEFERRED_WRITES: usize = 8;

/// The block whose commands are being executed. Its acknowledgement goes out
/// once every command, arc chord and homing step it produced is accepted.
#[derive(Debug, Clone, Copy)]
struct CurrentLine {
    number: Option<u32>,
}

pub struct Controller {
    config: MachineConfig,
    machine: CanonicalMachine,
    planner: Planner,
    runtime: Runtime,
    signals: Arc<Signals>,
    switches: Switches,
    pending: CommandQueue,
    line: LineBuffer,
    /// `line` holds text that was read but could not be processed yet.
    line_waiting: bool,
    current: Option<CurrentLine>,
    homing: Option<HomingCycle>,
    homing_trip: Option<SwitchId>,
    deferred: heapless::Deque<ConfigChange, DEFERRED_WRITES>,
    /// Paused by M0/M1 until cycle start.
    stopped: bool,
    /// A cycle start arrived with nothing to resume; it releases the next
    /// program stop instead.
    start_armed: bool,
    end_of_stream: bool,
    clock_ms: u64,
    last_report_ms: u64,
}

impl Controller {
    /// Power-up: apply the configuration and declare the origin as the
    /// machine position.
    pub fn new(config: MachineConfig) -> Self {
        let mut runtime = Runtime::new();
        runtime.configure(&config);
        let mut planner = Planner::new();
        let mut machine = CanonicalMachine::new();
        planner.set_position(&[0.0; AXES], &config);
        runtime.set_position(planner.step_position());
        machine.sync_position(planner.get_position());
        machine.set_mode(MachineMode::Ready);
        Self {
            switches: Switches::new(&config),
            config,
            machine,
            planner,
            runtime,
            signals: Arc::new(Signals::new()),
            pending: CommandQueue::new(),
            line: LineBuffer::new(),
            line_waiting: false,
            current: None,
            homing: None,
            homing_trip: None,
            deferred: heapless::Deque::new(),
            stopped: false,
            start_armed: false,
            end_of_stream: false,
            clock_ms: 0,
            last_report_ms: 0,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn machine(&self) -> &CanonicalMachine {
        &self.machine
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn signals(&self) -> Arc<Signals> {
        Arc::clone(&self.signals)
    }

    pub fn mode(&self) -> MachineMode {
        self.machine.mode()
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Nothing left to read, plan, apply or step.
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
            && !self.line_waiting
            && self.pending.is_empty()
            && self.deferred.is_empty()
            && self.homing.is_none()
            && !self.machine.arc_active()
            && !self.planner.has_work()
            && self.runtime.is_idle()
    }

    fn motion_idle(&self) -> bool {
        !self.planner.has_work() && self.runtime.is_idle() && !self.machine.arc_active()
    }

    /// Current machine position: commanded when at rest, read back from the
    /// step counters while moving.
    pub fn machine_position(&self) -> [f64; AXES] {
        let mut position = self.machine.position();
        if self.motion_idle() {
            return position;
        }
        let steps = self.runtime.position();
        for axis in Axis::ALL {
            if let Some(m) = self.config.motor_for_axis(axis) {
                position[axis.index()] = steps[m] as f64 / self.config.steps_per_unit(m);
            }
        }
        position
    }

    pub fn status_report(&self) -> StatusReport {
        let machine = self.machine_position();
        StatusReport {
            line: self.machine.line_number(),
            position: self.machine.to_work(&machine),
            machine,
            velocity: self.runtime.current_velocity(),
            available: self.planner.available(),
            mode: self.machine.mode(),
        }
    }

    // Interrupt entry points. None of these log or allocate.

    pub fn dda_tick<P: StepperPins + ?Sized>(&mut self, pins: &mut P) -> u8 {
        self.runtime.tick(pins)
    }

    pub fn pulse_end<P: StepperPins + ?Sized>(&mut self, pins: &mut P) {
        self.runtime.pulse_end(pins);
    }

    pub fn rtc_tick<I: SwitchInputs + ?Sized>(&mut self, inputs: &I) {
        self.clock_ms += u64::from(RTC_PERIOD_MS);
        if let Some(switch) = self.switches.sample(inputs) {
            self.signals.trip(switch);
        }
    }

    /// Run every task once, highest priority first. Returns true if any task
    /// made progress.
    pub fn pass<S, R, L>(&mut self, source: &mut S, sink: &mut R, listener: &mut L) -> bool
    where
        S: LineSource + ?Sized,
        R: ResponseSink + ?Sized,
        L: SettingsListener + ?Sized,
    {
        let mut progressed = self.urgent(sink).progressed();
        progressed |= self.hold_and_start().progressed();

        let intake = self.intake(source, sink, listener);
        let execute = self.execute(sink);
        let arc = self.arc_step(sink);
        let homing = self.homing_step(sink);
        self.finish_line(sink);

        let blocked = execute == Task::Again || arc == Task::Again || intake == Task::Again;
        if (intake != Task::Progress && !self.machine.arc_active()) || self.planner.is_full() || blocked {
            progressed |= self.planner.plan_finalize();
        }
        if self.machine.mode() != MachineMode::Alarm && self.planner.fill(&mut self.runtime) > 0 {
            progressed = true;
        }

        self.apply_deferred(listener);
        self.update_mode(sink);
        self.heartbeat(sink);
        progressed || intake.progressed() || execute.progressed() || arc.progressed() || homing.progressed()
    }

    /// Abort and limit trips.
    fn urgent<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) -> Task {
        if let Some(switch) = self.signals.take_trip() {
            if self.homing.is_some() {
                self.homing_trip = Some(switch);
            } else {
                tracing::warn!("Limit switch {:?} {:?} tripped", switch.axis, switch.end);
                self.raise_alarm(Some(switch), sink);
                return Task::Progress;
            }
        }
        if self.signals.take(Signal::Abort) {
            tracing::warn!("Abort requested");
            self.raise_alarm(None, sink);
            return Task::Progress;
        }
        Task::Idle
    }

    fn raise_alarm<R: ResponseSink + ?Sized>(&mut self, switch: Option<SwitchId>, sink: &mut R) {
        self.runtime.abort();
        self.planner.reset();
        self.machine.abort_arc();
        self.homing = None;
        self.homing_trip = None;
        self.pending.clear();
        self.stopped = false;
        self.start_armed = false;
        self.signals.take(Signal::Feedhold);
        self.signals.take(Signal::CycleStart);
        self.resync_from_runtime();
        if let Some(current) = self.current.take() {
            sink.respond(&Response::ack(current.number, Err(MotionError::HardwareAlarm)));
        }
        self.machine.set_mode(MachineMode::Alarm);
        sink.respond(&Response::Alarm { switch, status: MotionError::HardwareAlarm.code() });
        self.report_now(sink);
    }

    /// Rebuild planner and machine positions from the runtime step counters.
    fn resync_from_runtime(&mut self) {
        self.planner.sync_from_steps(self.runtime.position(), &self.config);
        self.machine.sync_position(self.planner.get_position());
    }

    fn hold_and_start(&mut self) -> Task {
        let mut task = Task::Idle;
        if self.signals.take(Signal::Feedhold) {
            self.start_armed = false;
            if self.planner.has_work() || !self.runtime.is_idle() {
                tracing::info!("Feedhold");
                self.planner.request_hold();
            }
            task = Task::Progress;
        }
        if self.signals.is_set(Signal::CycleStart) {
            if self.planner.hold_state() == HoldState::Decelerating {
                // Resume once the machine has stopped.
                return Task::Again;
            }
            self.signals.take(Signal::CycleStart);
            let held = self.planner.hold_state() != HoldState::Off;
            if self.planner.resume() {
                self.runtime.resume();
            }
            if self.stopped {
                tracing::info!("Program resumed");
                self.stopped = false;
            } else if !held {
                tracing::debug!("Cycle start with nothing held; armed for the next program stop");
                self.start_armed = true;
            }
            task = Task::Progress;
        }
        task
    }

    fn intake<S, R, L>(&mut self, source: &mut S, sink: &mut R, listener: &mut L) -> Task
    where
        S: LineSource + ?Sized,
        R: ResponseSink + ?Sized,
        L: SettingsListener + ?Sized,
    {
        if self.current.is_some() || self.stopped || self.homing.is_some() || self.machine.arc_active() {
            return Task::Idle;
        }
        if !self.line_waiting {
            match source.next_line(&mut self.line) {
                LineStatus::Line => {
                    self.line_waiting = true;
                    self.end_of_stream = false;
                }
                LineStatus::Overflow => {
                    tracing::warn!("Input line longer than the line buffer");
                    sink.respond(&Response::ack(None, Err(MotionError::BadNumber)));
                    return Task::Progress;
                }
                LineStatus::NoneAvailable => return Task::Idle,
                LineStatus::EndOfStream => {
                    self.end_of_stream = true;
                    return Task::Idle;
                }
            }
        }
        let line = self.line.clone();
        let text = line.trim();
        let result = if text.starts_with('$') {
            self.config_line(text, sink, listener)
        } else {
            self.gcode_line(text, sink)
        };
        match result {
            Err(e) if e.is_back_pressure() => Task::Again,
            _ => {
                self.line_waiting = false;
                Task::Progress
            }
        }
    }

    fn gcode_line<R: ResponseSink + ?Sized>(&mut self, text: &str, sink: &mut R) -> MotionResult<()> {
        if self.machine.mode() == MachineMode::Alarm {
            tracing::debug!("Refused {:?} while alarmed", text);
            sink.respond(&Response::ack(None, Err(MotionError::MachineAlarmed)));
            return Ok(());
        }
        let block = match parse_block(text) {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("Rejected line {:?}: {}", text, e);
                sink.respond(&Response::ack(None, Err(e.into())));
                return Ok(());
            }
        };
        match interpret(&block, self.machine.modal().motion_mode) {
            Ok(commands) => {
                self.pending = commands;
                self.current = Some(CurrentLine { number: block.n });
            }
            Err(e) => {
                tracing::warn!("Rejected line {:?}: {}", text, e);
                sink.respond(&Response::ack(block.n, Err(e)));
            }
        }
        Ok(())
    }

    fn config_line<R, L>(&mut self, text: &str, sink: &mut R, listener: &mut L) -> MotionResult<()>
    where
        R: ResponseSink + ?Sized,
        L: SettingsListener + ?Sized,
    {
        let result = match parse_config_line(text) {
            Ok(ConfigCommand::Status) => {
                self.report_now(sink);
                Ok(())
            }
            Ok(ConfigCommand::Read(token)) => {
                sink.respond(&Response::Config { token, value: self.config.read_token(token) });
                Ok(())
            }
            Ok(ConfigCommand::Write(token, value)) => self.write_setting(token, value, sink, listener),
            Ok(ConfigCommand::Clear) => {
                self.clear_alarm();
                Ok(())
            }
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.is_back_pressure() => return Err(e),
            Err(e) => {
                tracing::warn!("Rejected config line {:?}: {}", text, e);
                sink.respond(&Response::ack(None, Err(e)));
            }
            Ok(()) => sink.respond(&Response::ack(None, Ok(()))),
        }
        Ok(())
    }

    fn write_setting<R, L>(&mut self, token: Token, value: f64, sink: &mut R, listener: &mut L) -> MotionResult<()>
    where
        R: ResponseSink + ?Sized,
        L: SettingsListener + ?Sized,
    {
        if token.is_deferred() {
            let mut trial = self.config.clone();
            trial.write_token(token, value)?;
            self.deferred
                .push_back(ConfigChange { token, value })
                .map_err(|_| MotionError::TryAgain)?;
            tracing::debug!("Deferred {} = {} until idle", token, value);
        } else {
            self.config.write_token(token, value)?;
            self.runtime.configure(&self.config);
            self.switches.configure(&self.config);
            listener.config_changed(&ConfigChange { token, value });
        }
        sink.respond(&Response::Config { token, value });
        Ok(())
    }

    /// Apply deferred settings once nothing is in flight, then re-derive the
    /// step positions from the symbolic position.
    fn apply_deferred<L: SettingsListener + ?Sized>(&mut self, listener: &mut L) {
        if self.deferred.is_empty() || !self.motion_idle() || self.homing.is_some() || !self.pending.is_empty() {
            return;
        }
        while let Some(change) = self.deferred.pop_front() {
            match self.config.write_token(change.token, change.value) {
                Ok(()) => listener.config_changed(&change),
                Err(e) => tracing::warn!("Dropped deferred {}: {}", change.token, e),
            }
        }
        self.runtime.configure(&self.config);
        self.switches.configure(&self.config);
        self.planner.set_position(&self.machine.position(), &self.config);
        self.runtime.set_position(self.planner.step_position());
        tracing::info!("Applied deferred settings");
    }

    fn clear_alarm(&mut self) {
        if self.machine.mode() != MachineMode::Alarm {
            return;
        }
        if self.switches.any_active() {
            tracing::warn!("Alarm cleared with a limit switch still closed");
        }
        self.resync_from_runtime();
        self.signals.clear();
        self.machine.set_mode(MachineMode::Ready);
    }

    /// Run the current line's commands in order.
    fn execute<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) -> Task {
        let mut task = Task::Idle;
        while let Some(command) = self.pending.front().copied() {
            if command.needs_idle() && !self.motion_idle() {
                return Task::Again;
            }
            let result = match command {
                CanonicalCommand::Home { axes } => {
                    HomingCycle::new(&axes, &self.config).map(|cycle| self.homing = Some(cycle))
                }
                CanonicalCommand::ProgramStop { optional } => {
                    if std::mem::take(&mut self.start_armed) {
                        tracing::info!("Program stop released by an earlier cycle start");
                    } else {
                        tracing::info!("Program stop{}", if optional { " (optional)" } else { "" });
                        self.stopped = true;
                    }
                    Ok(())
                }
                CanonicalCommand::SetOrigin(OriginCommand::SetPosition(_)) => self
                    .machine
                    .execute(&command, &mut self.planner, &self.config)
                    .map(|()| self.runtime.set_position(self.planner.step_position())),
                _ => self.machine.execute(&command, &mut self.planner, &self.config),
            };
            match result {
                Ok(()) => {
                    self.pending.pop_front();
                    task = Task::Progress;
                    if self.machine.arc_active() || self.homing.is_some() {
                        break;
                    }
                }
                Err(e) if e.is_back_pressure() => return Task::Again,
                Err(e) => {
                    tracing::warn!("Command {:?} failed: {}", command, e);
                    self.pending.clear();
                    if let Some(current) = self.current.take() {
                        sink.respond(&Response::ack(current.number, Err(e)));
                    }
                    return Task::Progress;
                }
            }
        }
        task
    }

    fn arc_step<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) -> Task {
        if !self.machine.arc_active() {
            return Task::Idle;
        }
        match self.machine.arc_step(&mut self.planner, &self.config) {
            Ok(true) => Task::Progress,
            Ok(false) => Task::Idle,
            Err(e) if e.is_back_pressure() => Task::Again,
            Err(e) => {
                self.pending.clear();
                if let Some(current) = self.current.take() {
                    sink.respond(&Response::ack(current.number, Err(e)));
                }
                Task::Progress
            }
        }
    }

    fn homing_step<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) -> Task {
        let Some(cycle) = self.homing.as_mut() else {
            return Task::Idle;
        };
        let trip = self.homing_trip.take();
        match cycle.poll(trip, &mut self.machine, &mut self.planner, &mut self.runtime, &self.config) {
            Ok(false) => Task::Idle,
            Ok(true) => {
                tracing::info!("Homing complete");
                self.homing = None;
                Task::Progress
            }
            Err(e) if e.is_back_pressure() => Task::Again,
            Err(e) => {
                tracing::warn!("Homing failed: {}", e);
                self.homing = None;
                self.runtime.abort();
                self.planner.reset();
                self.resync_from_runtime();
                self.pending.clear();
                if let Some(current) = self.current.take() {
                    sink.respond(&Response::ack(current.number, Err(e)));
                }
                Task::Progress
            }
        }
    }

    /// Acknowledge the current line once everything it started has been accepted.
    fn finish_line<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) {
        if !self.pending.is_empty() || self.machine.arc_active() || self.homing.is_some() {
            return;
        }
        if let Some(current) = self.current.take() {
            if let Some(n) = current.number {
                self.machine.set_line_number(n);
            }
            sink.respond(&Response::ack(current.number, Ok(())));
        }
    }

    fn update_mode<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) {
        let mode = match self.machine.mode() {
            MachineMode::Alarm => MachineMode::Alarm,
            _ if self.planner.hold_state() == HoldState::Held && self.runtime.is_idle() => {
                self.runtime.hold();
                MachineMode::Hold
            }
            _ if !self.motion_idle() || self.homing.is_some() => MachineMode::Run,
            _ => MachineMode::Ready,
        };
        if mode != self.machine.mode() {
            self.machine.set_mode(mode);
            if self.config.system.status_interval_ms > 0 {
                self.report_now(sink);
            }
        }
    }

    /// Periodic report while moving.
    fn heartbeat<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) {
        let interval = u64::from(self.config.system.status_interval_ms);
        if interval == 0 || self.machine.mode() != MachineMode::Run {
            return;
        }
        if self.clock_ms.saturating_sub(self.last_report_ms) >= interval {
            self.report_now(sink);
        }
    }

    fn report_now<R: ResponseSink + ?Sized>(&mut self, sink: &mut R) {
        self.last_report_ms = self.clock_ms;
        sink.respond(&Response::Report(self.status_report()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SwitchEnd;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Lines(VecDeque<String>);

    impl LineSource for Lines {
        fn next_line(&mut self, buf: &mut LineBuffer) -> LineStatus {
            match self.0.pop_front() {
                Some(line) => {
                    buf.clear();
                    match buf.push_str(&line) {
                        Ok(()) => LineStatus::Line,
                        Err(()) => LineStatus::Overflow,
                    }
                }
                None => LineStatus::NoneAvailable,
            }
        }
    }

    #[derive(Default)]
    struct Responses(Vec<Response>);

    impl ResponseSink for Responses {
        fn respond(&mut self, response: &Response) {
            self.0.push(response.clone());
        }
    }

    impl Responses {
        fn acks(&self) -> Vec<(Option<u32>, u8)> {
            self.0
                .iter()
                .filter_map(|r| match r {
                    Response::Ack { line, status } => Some((*line, *status)),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Default)]
    struct Changes(Vec<ConfigChange>);

    impl SettingsListener for Changes {
        fn config_changed(&mut self, change: &ConfigChange) {
            self.0.push(*change);
        }
    }

    struct NoPins;

    impl StepperPins for NoPins {
        fn set_direction(&mut self, _motor: usize, _level: bool) {}
        fn step_rise(&mut self, _motor: usize) {}
        fn step_fall(&mut self, _motor: usize) {}
        fn set_enable(&mut self, _motor: usize, _enabled: bool) {}
    }

    fn lines(text: &[&str]) -> Lines {
        Lines(text.iter().map(|s| s.to_string()).collect())
    }

    /// Drive passes and ticks until idle or `limit` passes have run.
    fn run(ctl: &mut Controller, source: &mut Lines, sink: &mut Responses, listener: &mut Changes, limit: usize) {
        let mut pins = NoPins;
        for _ in 0..limit {
            ctl.pass(source, sink, listener);
            for _ in 0..50 {
                ctl.dda_tick(&mut pins);
                ctl.pulse_end(&mut pins);
            }
            if source.0.is_empty() && ctl.is_idle() {
                break;
            }
        }
    }

    #[test]
    fn every_line_is_acknowledged_in_order() {
        let mut ctl = Controller::new(MachineConfig::default());
        let mut source = lines(&["N1 G0 X1", "N2 G1 X2", "N3 G1 F300 X2", "N4 Q1", "N5 G0 X0"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 5_000);
        assert_eq!(
            sink.acks(),
            vec![
                (Some(1), 0),
                (Some(2), MotionError::BadNumber.code()),
                (Some(3), 0),
                (None, MotionError::UnsupportedCommand.code()),
                (Some(5), 0),
            ]
        );
        assert_eq!(ctl.machine().line_number(), 5);
        assert_eq!(ctl.runtime().position()[0], 0);
        assert_eq!(ctl.mode(), MachineMode::Ready);
    }

    #[test]
    fn config_lines_read_and_write() {
        let mut ctl = Controller::new(MachineConfig::default());
        let mut source = lines(&["$xjm", "$xjm=2500", "$bogus", "$1mi=3", "$si=0"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 20);
        assert!(sink.0.contains(&Response::Config { token: Token::parse("xjm").unwrap(), value: 5000.0 }));
        assert_eq!(ctl.config().axes.x.jerk_max, 2500.0);
        let statuses: Vec<u8> = sink.acks().iter().map(|a| a.1).collect();
        assert_eq!(statuses, vec![0, 0, MotionError::UnknownToken.code(), MotionError::BadValue.code(), 0]);
        assert_eq!(changes.0.len(), 2);
    }

    #[test]
    fn step_mapping_writes_wait_for_idle() {
        let mut ctl = Controller::new(MachineConfig::default());
        let mut source = lines(&["G0 X10", "$1mi=4"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        let mut pins = NoPins;
        for _ in 0..4 {
            ctl.pass(&mut source, &mut sink, &mut changes);
            ctl.dda_tick(&mut pins);
        }
        assert_eq!(ctl.config().motors[0].microsteps, 8);
        assert!(changes.0.is_empty());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 5_000);
        assert_eq!(ctl.config().motors[0].microsteps, 4);
        assert_eq!(changes.0.len(), 1);
        // 10 mm at 160 steps/mm.
        assert_eq!(ctl.runtime().position()[0], 1600);
        assert_eq!(ctl.planner().step_position()[0], 1600);
    }

    #[test]
    fn limit_trip_raises_alarm_until_cleared() {
        let mut ctl = Controller::new(MachineConfig::default());
        let mut source = lines(&["G1 F1000 X50"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        let mut pins = NoPins;
        for _ in 0..200 {
            ctl.pass(&mut source, &mut sink, &mut changes);
            for _ in 0..50 {
                ctl.dda_tick(&mut pins);
            }
        }
        assert_eq!(ctl.mode(), MachineMode::Run);
        let switch = SwitchId { axis: Axis::X, end: SwitchEnd::Max };
        ctl.signals().trip(switch);
        ctl.pass(&mut source, &mut sink, &mut changes);
        assert_eq!(ctl.mode(), MachineMode::Alarm);
        assert!(ctl.runtime().is_idle());
        assert!(sink.0.contains(&Response::Alarm { switch: Some(switch), status: 20 }));
        let stopped_at = ctl.runtime().position()[0];
        assert!(stopped_at > 0 && stopped_at < 16_000);

        source.0.push_back("G0 X0".into());
        source.0.push_back("$clear".into());
        source.0.push_back("G0 X0".into());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 5_000);
        let acks = sink.acks();
        assert_eq!(acks[acks.len() - 3].1, MotionError::MachineAlarmed.code());
        assert_eq!(acks[acks.len() - 1].1, 0);
        assert_eq!(ctl.mode(), MachineMode::Ready);
        assert_eq!(ctl.runtime().position()[0], 0);
    }

    #[test]
    fn program_stop_pauses_intake_until_cycle_start() {
        let mut ctl = Controller::new(MachineConfig::default());
        let mut source = lines(&["G0 X1", "M0", "G0 X2"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 2_000);
        assert!(ctl.is_stopped());
        assert_eq!(source.0.len(), 1);
        ctl.signals().set(Signal::CycleStart);
        run(&mut ctl, &mut source, &mut sink, &mut changes, 2_000);
        assert!(!ctl.is_stopped());
        assert_eq!(ctl.runtime().position()[0], 640);
    }

    #[test]
    fn early_cycle_start_releases_the_next_program_stop() {
        let mut ctl = Controller::new(MachineConfig::default());
        ctl.signals().set(Signal::CycleStart);
        let mut source = lines(&["G0 X1", "M0", "G0 X2", "M0", "G0 X3"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 2_000);
        // Only the first stop is released.
        assert!(ctl.is_stopped());
        assert_eq!(ctl.runtime().position()[0], 640);
        ctl.signals().set(Signal::CycleStart);
        run(&mut ctl, &mut source, &mut sink, &mut changes, 2_000);
        assert!(!ctl.is_stopped());
        assert_eq!(ctl.runtime().position()[0], 960);
    }

    #[test]
    fn feedhold_while_idle_is_ignored() {
        let mut ctl = Controller::new(MachineConfig::default());
        ctl.signals().set(Signal::Feedhold);
        let mut source = lines(&["G0 X1"]);
        let (mut sink, mut changes) = (Responses::default(), Changes::default());
        run(&mut ctl, &mut source, &mut sink, &mut changes, 2_000);
        assert_eq!(ctl.runtime().position()[0], 320);
        assert_eq!(ctl.planner().hold_state(), HoldState::Off);
    }
}
