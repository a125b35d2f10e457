// src/config/tokens.rs - Key=value access to axis, motor and system settings
use super::{AxisMode, MachineConfig, PowerMode};
use crate::error::{MotionError, MotionResult};
use crate::{Axis, MOTORS};
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisParam {
    Mode,
    VelocityMax,
    FeedrateMax,
    TravelMin,
    TravelMax,
    JerkMax,
    JunctionDeviation,
    Polarity,
    SearchVelocity,
    LatchVelocity,
    ZeroBackoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorParam {
    MapAxis,
    StepAngle,
    TravelPerRev,
    Microsteps,
    Polarity,
    PowerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemParam {
    StatusInterval,
    JunctionAcceleration,
    JunctionIntegrationTime,
    ChordTolerance,
    SoftLimits,
}

const AXIS_PARAMS: [(&str, AxisParam); 11] = [
    ("am", AxisParam::Mode),
    ("vm", AxisParam::VelocityMax),
    ("fr", AxisParam::FeedrateMax),
    ("tn", AxisParam::TravelMin),
    ("tm", AxisParam::TravelMax),
    ("jm", AxisParam::JerkMax),
    ("jd", AxisParam::JunctionDeviation),
    ("po", AxisParam::Polarity),
    ("sv", AxisParam::SearchVelocity),
    ("lv", AxisParam::LatchVelocity),
    ("zb", AxisParam::ZeroBackoff),
];

const MOTOR_PARAMS: [(&str, MotorParam); 6] = [
    ("ma", MotorParam::MapAxis),
    ("sa", MotorParam::StepAngle),
    ("tr", MotorParam::TravelPerRev),
    ("mi", MotorParam::Microsteps),
    ("po", MotorParam::Polarity),
    ("pm", MotorParam::PowerMode),
];

const SYSTEM_PARAMS: [(&str, SystemParam); 5] = [
    ("si", SystemParam::StatusInterval),
    ("ja", SystemParam::JunctionAcceleration),
    ("jt", SystemParam::JunctionIntegrationTime),
    ("ct", SystemParam::ChordTolerance),
    ("sl", SystemParam::SoftLimits),
];

fn lookup<P: Copy>(table: &[(&str, P)], name: &str) -> Option<P> {
    table
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, p)| *p)
}

fn suffix<P: PartialEq>(table: &[(&'static str, P)], param: &P) -> &'static str {
    table
        .iter()
        .find(|(_, p)| p == param)
        .map(|(n, _)| *n)
        .unwrap_or("??")
}

/// A named setting such as `xjm`, `1mi` or `si`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Axis(Axis, AxisParam),
    Motor(usize, MotorParam),
    System(SystemParam),
}

impl Token {
    /// Parse a token name, ignoring case.
    pub fn parse(name: &str) -> MotionResult<Token> {
        if !name.is_ascii() {
            return Err(MotionError::UnknownToken);
        }
        let token = match name.len() {
            2 => lookup(&SYSTEM_PARAMS, name).map(Token::System),
            3 => {
                let (head, tail) = name.split_at(1);
                let prefix = head.chars().next().unwrap_or(' ');
                if let Some(axis) = Axis::from_letter(prefix) {
                    lookup(&AXIS_PARAMS, tail).map(|p| Token::Axis(axis, p))
                } else {
                    match prefix.to_digit(10).map(|d| d as usize) {
                        Some(d) if (1..=MOTORS).contains(&d) => {
                            lookup(&MOTOR_PARAMS, tail).map(|p| Token::Motor(d - 1, p))
                        }
                        _ => None,
                    }
                }
            }
            _ => None,
        };
        token.ok_or(MotionError::UnknownToken)
    }

    /// Writes that change how positions map to steps wait for the machine to go idle.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            Token::Motor(
                _,
                MotorParam::MapAxis
                    | MotorParam::StepAngle
                    | MotorParam::TravelPerRev
                    | MotorParam::Microsteps
                    | MotorParam::Polarity
            ) | Token::Axis(_, AxisParam::Polarity)
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Axis(axis, p) => write!(f, "{}{}", axis.letter(), suffix(&AXIS_PARAMS, p)),
            Token::Motor(m, p) => write!(f, "{}{}", m + 1, suffix(&MOTOR_PARAMS, p)),
            Token::System(p) => f.write_str(suffix(&SYSTEM_PARAMS, p)),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Notification emitted after a write has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfigChange {
    pub token: Token,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigCommand {
    /// `$` alone: request a status report.
    Status,
    Read(Token),
    Write(Token, f64),
    /// `$clear`: leave alarm.
    Clear,
}

/// Parse a `$`-prefixed config line.
pub fn parse_config_line(line: &str) -> MotionResult<ConfigCommand> {
    let body = line.trim().strip_prefix('$').ok_or(MotionError::UnsupportedCommand)?;
    let body = body.trim();
    if body.is_empty() {
        return Ok(ConfigCommand::Status);
    }
    if body.eq_ignore_ascii_case("clear") {
        return Ok(ConfigCommand::Clear);
    }
    match body.split_once('=') {
        Some((name, value)) => {
            let token = Token::parse(name.trim())?;
            let value: f64 = value.trim().parse().map_err(|_| MotionError::BadNumber)?;
            if !value.is_finite() {
                return Err(MotionError::BadNumber);
            }
            Ok(ConfigCommand::Write(token, value))
        }
        None => Ok(ConfigCommand::Read(Token::parse(body)?)),
    }
}

fn flag(value: f64) -> MotionResult<bool> {
    if value == 0.0 {
        Ok(false)
    } else if value == 1.0 {
        Ok(true)
    } else {
        Err(MotionError::BadValue)
    }
}

fn positive(value: f64) -> MotionResult<f64> {
    if value > 0.0 { Ok(value) } else { Err(MotionError::BadValue) }
}

fn non_negative(value: f64) -> MotionResult<f64> {
    if value >= 0.0 { Ok(value) } else { Err(MotionError::BadValue) }
}

fn small_integer(value: f64, max: u32) -> MotionResult<u32> {
    if value.fract() == 0.0 && (0.0..=f64::from(max)).contains(&value) {
        Ok(value as u32)
    } else {
        Err(MotionError::BadValue)
    }
}

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

impl MachineConfig {
    pub fn read_token(&self, token: Token) -> f64 {
        match token {
            Token::Axis(axis, p) => {
                let a = self.axis(axis);
                match p {
                    AxisParam::Mode => bool_value(a.is_enabled()),
                    AxisParam::VelocityMax => a.velocity_max,
                    AxisParam::FeedrateMax => a.feedrate_max,
                    AxisParam::TravelMin => a.travel_min,
                    AxisParam::TravelMax => a.travel_max,
                    AxisParam::JerkMax => a.jerk_max,
                    AxisParam::JunctionDeviation => a.junction_deviation,
                    AxisParam::Polarity => bool_value(a.polarity_reversed),
                    AxisParam::SearchVelocity => a.search_velocity,
                    AxisParam::LatchVelocity => a.latch_velocity,
                    AxisParam::ZeroBackoff => a.zero_backoff,
                }
            }
            Token::Motor(m, p) => {
                let motor = &self.motors[m];
                match p {
                    MotorParam::MapAxis => motor.axis.index() as f64,
                    MotorParam::StepAngle => motor.step_angle,
                    MotorParam::TravelPerRev => motor.travel_per_rev,
                    MotorParam::Microsteps => f64::from(motor.microsteps),
                    MotorParam::Polarity => bool_value(motor.polarity_reversed),
                    MotorParam::PowerMode => match motor.power_mode {
                        PowerMode::AlwaysOn => 0.0,
                        PowerMode::InCycle => 1.0,
                        PowerMode::WhenMoving => 2.0,
                    },
                }
            }
            Token::System(p) => match p {
                SystemParam::StatusInterval => f64::from(self.system.status_interval_ms),
                SystemParam::JunctionAcceleration => self.system.junction_acceleration,
                SystemParam::JunctionIntegrationTime => self.system.junction_integration_time,
                SystemParam::ChordTolerance => self.system.chord_tolerance,
                SystemParam::SoftLimits => bool_value(self.system.soft_limits),
            },
        }
    }

    /// Validate and store a value. Nothing is changed when validation fails.
    pub fn write_token(&mut self, token: Token, value: f64) -> MotionResult<()> {
        if !value.is_finite() {
            return Err(MotionError::BadValue);
        }
        match token {
            Token::Axis(axis, p) => {
                let a = self.axes.get_mut(axis);
                match p {
                    AxisParam::Mode => {
                        a.mode = if flag(value)? { AxisMode::Standard } else { AxisMode::Disabled }
                    }
                    AxisParam::VelocityMax => a.velocity_max = positive(value)?,
                    AxisParam::FeedrateMax => a.feedrate_max = positive(value)?,
                    AxisParam::TravelMin => {
                        if value > a.travel_max {
                            return Err(MotionError::BadValue);
                        }
                        a.travel_min = value;
                    }
                    AxisParam::TravelMax => {
                        if value < a.travel_min {
                            return Err(MotionError::BadValue);
                        }
                        a.travel_max = value;
                    }
                    AxisParam::JerkMax => a.jerk_max = positive(value)?,
                    AxisParam::JunctionDeviation => a.junction_deviation = non_negative(value)?,
                    AxisParam::Polarity => a.polarity_reversed = flag(value)?,
                    AxisParam::SearchVelocity => a.search_velocity = positive(value)?,
                    AxisParam::LatchVelocity => a.latch_velocity = positive(value)?,
                    AxisParam::ZeroBackoff => a.zero_backoff = non_negative(value)?,
                }
            }
            Token::Motor(m, p) => {
                let motor = &mut self.motors[m];
                match p {
                    MotorParam::MapAxis => {
                        let index = small_integer(value, 5)? as usize;
                        motor.axis = Axis::from_index(index).ok_or(MotionError::BadValue)?;
                    }
                    MotorParam::StepAngle => motor.step_angle = positive(value)?,
                    MotorParam::TravelPerRev => motor.travel_per_rev = positive(value)?,
                    MotorParam::Microsteps => {
                        motor.microsteps = match small_integer(value, 8)? {
                            n @ (1 | 2 | 4 | 8) => n as u8,
                            _ => return Err(MotionError::BadValue),
                        }
                    }
                    MotorParam::Polarity => motor.polarity_reversed = flag(value)?,
                    MotorParam::PowerMode => {
                        motor.power_mode = match small_integer(value, 2)? {
                            0 => PowerMode::AlwaysOn,
                            1 => PowerMode::InCycle,
                            _ => PowerMode::WhenMoving,
                        }
                    }
                }
            }
            Token::System(p) => match p {
                SystemParam::StatusInterval => {
                    self.system.status_interval_ms = small_integer(value, 60_000)?
                }
                SystemParam::JunctionAcceleration => {
                    self.system.junction_acceleration = positive(value)?
                }
                SystemParam::JunctionIntegrationTime => {
                    self.system.junction_integration_time = positive(value)?
                }
                SystemParam::ChordTolerance => self.system.chord_tolerance = positive(value)?,
                SystemParam::SoftLimits => self.system.soft_limits = flag(value)?,
            },
        }
        Ok(())
    }
}
