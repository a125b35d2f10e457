// src/sim/mod.rs - Deterministic simulator driving the controller in virtual time
//! Recording collaborators plus a clock that steps the DDA at its real rate,
//! runs a scheduler pass every millisecond and the housekeeping tick every
//! 10 ms. Used by the `millcore-sim` binary, the scenario tests and the
//! benchmarks.

use crate::config::MachineConfig;
use crate::config::tokens::ConfigChange;
use crate::hardware::{
    LineBuffer, LineSource, LineStatus, ResponseSink, SWITCH_COUNT, SettingsListener, StepperPins, SwitchEnd,
    SwitchId, SwitchInputs,
};
use crate::report::Response;
use crate::scheduler::{Controller, Signals};
use crate::{Axis, DDA_FREQUENCY_HZ, MOTORS, RTC_PERIOD_MS};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// DDA ticks between scheduler passes (1 ms).
pub const TICKS_PER_PASS: u64 = DDA_FREQUENCY_HZ as u64 / 1000;
/// DDA ticks between housekeeping ticks.
pub const TICKS_PER_RTC: u64 = TICKS_PER_PASS * RTC_PERIOD_MS as u64;
/// Bytes received per scheduler pass: one full-speed USB bulk packet per frame.
pub const RX_BYTES_PER_PASS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub tick: u64,
    pub motor: usize,
    /// Motor position after the step.
    pub position: i64,
    /// Planner sequence number of the block the step belongs to.
    pub seq: u32,
}

/// Step/direction outputs that integrate pulses into positions.
#[derive(Debug, Default)]
pub struct SimPins {
    position: [i64; MOTORS],
    invert: [bool; MOTORS],
    direction: [bool; MOTORS],
    high: [bool; MOTORS],
    enabled: [bool; MOTORS],
    pulses: [u64; MOTORS],
    /// Rising edges seen while the line was already high.
    overlaps: u64,
    tick: u64,
    seq: u32,
    record: bool,
    log: Vec<StepRecord>,
}

impl SimPins {
    pub fn new(config: &MachineConfig) -> Self {
        let mut pins = Self::default();
        pins.configure(config);
        pins
    }

    pub fn configure(&mut self, config: &MachineConfig) {
        for m in 0..MOTORS {
            self.invert[m] = config.direction_inverted(m);
        }
    }

    pub fn set_recording(&mut self, record: bool) {
        self.record = record;
    }

    pub fn position(&self) -> [i64; MOTORS] {
        self.position
    }

    pub fn pulses(&self) -> [u64; MOTORS] {
        self.pulses
    }

    pub fn enabled(&self) -> [bool; MOTORS] {
        self.enabled
    }

    pub fn overlaps(&self) -> u64 {
        self.overlaps
    }

    pub fn log(&self) -> &[StepRecord] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<StepRecord> {
        std::mem::take(&mut self.log)
    }

    fn stamp(&mut self, tick: u64, seq: Option<u32>) {
        self.tick = tick;
        self.seq = seq.unwrap_or(0);
    }
}

impl StepperPins for SimPins {
    fn set_direction(&mut self, motor: usize, level: bool) {
        self.direction[motor] = level;
    }

    fn step_rise(&mut self, motor: usize) {
        if self.high[motor] {
            self.overlaps += 1;
        }
        self.high[motor] = true;
        self.pulses[motor] += 1;
        let reverse = self.direction[motor] ^ self.invert[motor];
        self.position[motor] += if reverse { -1 } else { 1 };
        if self.record {
            self.log.push(StepRecord {
                tick: self.tick,
                motor,
                position: self.position[motor],
                seq: self.seq,
            });
        }
    }

    fn step_fall(&mut self, motor: usize) {
        self.high[motor] = false;
    }

    fn set_enable(&mut self, motor: usize, enabled: bool) {
        self.enabled[motor] = enabled;
    }
}

/// A switch that closes while a motor sits at or past a step position.
#[derive(Debug, Clone, Copy)]
struct Trigger {
    switch: SwitchId,
    motor: usize,
    threshold: i64,
}

/// Switch inputs driven by motor positions or forced by hand. Levels are
/// electrical: true means the contact is closed.
#[derive(Debug, Default)]
pub struct SimSwitches {
    levels: [bool; SWITCH_COUNT],
    forced: [Option<bool>; SWITCH_COUNT],
    triggers: Vec<Trigger>,
}

impl SimSwitches {
    /// Close `axis`'s switch at `end` when `motor` reaches `threshold` steps.
    pub fn place(&mut self, axis: Axis, end: SwitchEnd, motor: usize, threshold: i64) {
        self.triggers.push(Trigger { switch: SwitchId { axis, end }, motor, threshold });
    }

    pub fn force(&mut self, switch: SwitchId, level: Option<bool>) {
        self.forced[switch.index()] = level;
    }

    fn update(&mut self, positions: &[i64; MOTORS]) {
        self.levels = [false; SWITCH_COUNT];
        for t in &self.triggers {
            let p = positions[t.motor];
            let closed = match t.switch.end {
                SwitchEnd::Min => p <= t.threshold,
                SwitchEnd::Max => p >= t.threshold,
            };
            self.levels[t.switch.index()] |= closed;
        }
        for (level, forced) in self.levels.iter_mut().zip(self.forced) {
            if let Some(f) = forced {
                *level = f;
            }
        }
    }
}

impl SwitchInputs for SimSwitches {
    fn read(&self, switch: SwitchId) -> bool {
        self.levels[switch.index()]
    }
}

/// Line stream over script text. Text sent by the host waits on the wire
/// until [`ScriptSource::receive`] moves it into the receive buffer; signal
/// characters are handed to the signal flags at that point, whatever the
/// line reader is doing, and never reach the line buffer. Blank lines are
/// skipped.
pub struct ScriptSource {
    wire: VecDeque<u8>,
    rx: VecDeque<u8>,
    signals: Arc<Signals>,
}

impl ScriptSource {
    pub fn new(signals: Arc<Signals>) -> Self {
        Self { wire: VecDeque::new(), rx: VecDeque::new(), signals }
    }

    pub fn push(&mut self, text: &str) {
        self.wire.extend(text.bytes());
        if !text.ends_with('\n') {
            self.wire.push_back(b'\n');
        }
    }

    /// Receive up to `max` bytes off the wire.
    pub fn receive(&mut self, max: usize) {
        let count = max.min(self.wire.len());
        for byte in self.wire.drain(..count) {
            if !self.signals.scan_byte(byte) {
                self.rx.push_back(byte);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wire.is_empty() && self.rx.is_empty()
    }
}

impl LineSource for ScriptSource {
    fn next_line(&mut self, buf: &mut LineBuffer) -> LineStatus {
        buf.clear();
        loop {
            let Some(end) = self.rx.iter().position(|&b| b == b'\n') else {
                return if self.wire.is_empty() { LineStatus::EndOfStream } else { LineStatus::NoneAvailable };
            };
            let mut overflow = false;
            for byte in self.rx.drain(..=end) {
                if byte == b'\n' || byte == b'\r' {
                    continue;
                }
                if !overflow && buf.push(char::from(byte)).is_err() {
                    overflow = true;
                }
            }
            if overflow {
                return LineStatus::Overflow;
            }
            if !buf.trim().is_empty() {
                return LineStatus::Line;
            }
            buf.clear();
        }
    }
}

#[derive(Debug, Default)]
pub struct CaptureSink {
    responses: Vec<Response>,
}

impl CaptureSink {
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    pub fn take(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.responses)
    }
}

impl ResponseSink for CaptureSink {
    fn respond(&mut self, response: &Response) {
        self.responses.push(response.clone());
    }
}

#[derive(Debug, Default)]
pub struct ConfigLog {
    changes: Vec<ConfigChange>,
}

impl ConfigLog {
    pub fn changes(&self) -> &[ConfigChange] {
        &self.changes
    }
}

impl SettingsListener for ConfigLog {
    fn config_changed(&mut self, change: &ConfigChange) {
        self.changes.push(*change);
    }
}

pub struct Simulator {
    controller: Controller,
    pins: SimPins,
    switches: SimSwitches,
    source: ScriptSource,
    sink: CaptureSink,
    settings: ConfigLog,
    tick: u64,
}

impl Simulator {
    pub fn new(config: MachineConfig) -> Self {
        let pins = SimPins::new(&config);
        let controller = Controller::new(config);
        let source = ScriptSource::new(controller.signals());
        Self {
            controller,
            pins,
            switches: SimSwitches::default(),
            source,
            sink: CaptureSink::default(),
            settings: ConfigLog::default(),
            tick: 0,
        }
    }

    /// Put program text on the wire. It arrives [`RX_BYTES_PER_PASS`] bytes
    /// per pass and lines are read one per pass.
    pub fn send(&mut self, text: &str) {
        self.source.push(text);
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn signals(&self) -> Arc<Signals> {
        self.controller.signals()
    }

    pub fn pins(&self) -> &SimPins {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut SimPins {
        &mut self.pins
    }

    pub fn switches_mut(&mut self) -> &mut SimSwitches {
        &mut self.switches
    }

    pub fn responses(&self) -> &[Response] {
        self.sink.responses()
    }

    pub fn take_responses(&mut self) -> Vec<Response> {
        self.sink.take()
    }

    /// `(line, status)` of every acknowledgement so far.
    pub fn acks(&self) -> Vec<(Option<u32>, u8)> {
        self.sink
            .responses()
            .iter()
            .filter_map(|r| match r {
                Response::Ack { line, status } => Some((*line, *status)),
                _ => None,
            })
            .collect()
    }

    pub fn config_changes(&self) -> &[ConfigChange] {
        self.settings.changes()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn seconds(&self) -> f64 {
        self.tick as f64 / f64::from(DDA_FREQUENCY_HZ)
    }

    /// Advance one DDA period, running the foreground and housekeeping
    /// callbacks when they fall due.
    pub fn step(&mut self) {
        if self.tick % TICKS_PER_RTC == 0 {
            self.switches.update(&self.pins.position());
            self.controller.rtc_tick(&self.switches);
        }
        if self.tick % TICKS_PER_PASS == 0 {
            self.source.receive(RX_BYTES_PER_PASS);
            self.controller.pass(&mut self.source, &mut self.sink, &mut self.settings);
            self.pins.configure(self.controller.config());
        }
        self.pins.stamp(self.tick, self.controller.runtime().active_seq());
        self.controller.dda_tick(&mut self.pins);
        self.controller.pulse_end(&mut self.pins);
        self.tick += 1;
    }

    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Step until `done` holds at a pass boundary. Returns false if `max_ticks` ran out first.
    pub fn run_until<F: FnMut(&Simulator) -> bool>(&mut self, max_ticks: u64, mut done: F) -> bool {
        let end = self.tick + max_ticks;
        while self.tick < end {
            self.step();
            if self.tick % TICKS_PER_PASS == 0 && done(self) {
                return true;
            }
        }
        false
    }

    /// Run until every queued line has been read and executed and the
    /// machine is at rest.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> bool {
        self.run_until(max_ticks, |sim| sim.source.is_empty() && sim.controller.is_idle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Signal;

    #[test]
    fn script_source_strips_signals_and_blank_lines() {
        let signals = Arc::new(Signals::new());
        let mut source = ScriptSource::new(Arc::clone(&signals));
        source.push("G0 X1\r\n\n!\nG1 F100 X2~\n");
        let mut buf = LineBuffer::new();
        assert_eq!(source.next_line(&mut buf), LineStatus::NoneAvailable);
        source.receive(9);
        assert!(signals.is_set(Signal::Feedhold));
        assert!(!signals.is_set(Signal::CycleStart));
        assert_eq!(source.next_line(&mut buf), LineStatus::Line);
        assert_eq!(buf.as_str(), "G0 X1");
        assert_eq!(source.next_line(&mut buf), LineStatus::NoneAvailable);
        source.receive(64);
        assert!(signals.is_set(Signal::CycleStart));
        assert_eq!(source.next_line(&mut buf), LineStatus::Line);
        assert_eq!(buf.as_str(), "G1 F100 X2");
        assert_eq!(source.next_line(&mut buf), LineStatus::EndOfStream);
    }

    #[test]
    fn signals_are_taken_while_no_line_is_read() {
        let signals = Arc::new(Signals::new());
        let mut source = ScriptSource::new(Arc::clone(&signals));
        source.push("G1 F100 X10\n%");
        source.receive(64);
        assert!(signals.is_set(Signal::Abort));
        assert!(!source.is_empty());
    }

    #[test]
    fn overlong_line_is_reported_once() {
        let signals = Arc::new(Signals::new());
        let mut source = ScriptSource::new(signals);
        source.push(&"G1 X1 ".repeat(60));
        source.push("G0 X0");
        let mut buf = LineBuffer::new();
        source.receive(RX_BYTES_PER_PASS);
        assert_eq!(source.next_line(&mut buf), LineStatus::NoneAvailable);
        source.receive(1024);
        assert_eq!(source.next_line(&mut buf), LineStatus::Overflow);
        assert_eq!(source.next_line(&mut buf), LineStatus::Line);
        assert_eq!(buf.as_str(), "G0 X0");
    }

    #[test]
    fn pins_integrate_direction_and_polarity() {
        let mut config = MachineConfig::default();
        config.motors[1].polarity_reversed = true;
        let mut pins = SimPins::new(&config);
        pins.set_direction(0, true);
        pins.step_rise(0);
        pins.step_fall(0);
        // Reversed motor: the runtime drives the inverted level for a positive step.
        pins.set_direction(1, true);
        pins.step_rise(1);
        assert_eq!(pins.position()[0], -1);
        assert_eq!(pins.position()[1], 1);
        pins.step_rise(1);
        assert_eq!(pins.overlaps(), 1);
    }

    #[test]
    fn simulated_move_reaches_target() {
        let mut sim = Simulator::new(MachineConfig::default());
        sim.send("G21 G90 G0 X10 Y0");
        assert!(sim.run_until_idle(2 * u64::from(DDA_FREQUENCY_HZ)));
        assert_eq!(sim.pins().position()[0], 3200);
        assert_eq!(sim.controller().runtime().position()[0], 3200);
        assert_eq!(sim.acks(), vec![(None, 0)]);
    }

    #[test]
    fn position_driven_switch_trips_alarm() {
        let mut sim = Simulator::new(MachineConfig::default());
        sim.switches_mut().place(Axis::X, SwitchEnd::Min, 0, -320);
        sim.send("G0 X-5");
        sim.run_until(2 * u64::from(DDA_FREQUENCY_HZ), |s| {
            s.controller().mode() == crate::machine::MachineMode::Alarm
        });
        assert_eq!(sim.controller().mode(), crate::machine::MachineMode::Alarm);
        let position = sim.pins().position()[0];
        assert!(position <= -320 && position > -1600);

        // Clearing with the switch still closed, then backing off it.
        sim.send("$clear\nG0 X0");
        assert!(sim.run_until_idle(2 * u64::from(DDA_FREQUENCY_HZ)));
        assert_eq!(sim.controller().mode(), crate::machine::MachineMode::Ready);
        assert_eq!(sim.pins().position()[0], 0);
        assert_eq!(sim.acks(), vec![(None, 0); 3]);
    }
}
