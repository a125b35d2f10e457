// src/config/mod.rs - Machine, axis and motor settings
//! # Machine Configuration
//!
//! Axis, motor and system settings for the motion core. Every field has a
//! default, so an empty file describes a usable three-axis mill with a rotary A.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [system]
//! status_interval_ms = 100
//! junction_acceleration = 150000.0
//! soft_limits = true
//!
//! [axes.x]
//! velocity_max = 8000.0
//! jerk_max = 2500.0        # millions of mm/min^3
//! travel_max = 300.0
//!
//! [[motors]]
//! axis = "x"
//! step_angle = 1.8
//! travel_per_rev = 8.0
//! microsteps = 8
//! ```
//!
//! When `motors` is given it must list all four motor channels.
//! The same values can be read and written at run time through the token
//! channel in [`tokens`].

pub mod tokens;

use crate::{Axis, MOTORS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Jerk values are configured in millions of mm/min^3.
pub const JERK_MULTIPLIER: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisMode {
    Disabled,
    #[default]
    Standard,
}

/// When a motor driver is energized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    AlwaysOn,
    #[default]
    InCycle,
    WhenMoving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchType {
    #[default]
    NormallyOpen,
    NormallyClosed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Status report interval; zero disables periodic reports.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u32,
    /// Centripetal acceleration allowed while cornering, mm/min^2.
    #[serde(default = "default_junction_acceleration")]
    pub junction_acceleration: f64,
    /// Window over which an axis may absorb a corner velocity change, seconds.
    #[serde(default = "default_junction_integration_time")]
    pub junction_integration_time: f64,
    /// Maximum arc sagitta, mm.
    #[serde(default = "default_chord_tolerance")]
    pub chord_tolerance: f64,
    /// Longest time a single arc chord may take, seconds.
    #[serde(default = "default_chord_time_max")]
    pub chord_time_max: f64,
    #[serde(default)]
    pub soft_limits: bool,
    #[serde(default)]
    pub switch_type: SwitchType,
}

fn default_status_interval_ms() -> u32 {
    250
}
fn default_junction_acceleration() -> f64 {
    100_000.0
}
fn default_junction_integration_time() -> f64 {
    0.025
}
fn default_chord_tolerance() -> f64 {
    0.01
}
fn default_chord_time_max() -> f64 {
    0.1
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: default_status_interval_ms(),
            junction_acceleration: default_junction_acceleration(),
            junction_integration_time: default_junction_integration_time(),
            chord_tolerance: default_chord_tolerance(),
            chord_time_max: default_chord_time_max(),
            soft_limits: false,
            switch_type: SwitchType::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisConfig {
    #[serde(default)]
    pub mode: AxisMode,
    /// Traverse (G0) velocity, mm/min or deg/min.
    #[serde(default = "default_velocity_max")]
    pub velocity_max: f64,
    /// Upper bound on programmed feed rate.
    #[serde(default = "default_velocity_max")]
    pub feedrate_max: f64,
    #[serde(default)]
    pub travel_min: f64,
    #[serde(default = "default_travel_max")]
    pub travel_max: f64,
    #[serde(default = "default_jerk_max")]
    pub jerk_max: f64,
    #[serde(default = "default_junction_deviation")]
    pub junction_deviation: f64,
    #[serde(default)]
    pub polarity_reversed: bool,
    #[serde(default = "default_search_velocity")]
    pub search_velocity: f64,
    #[serde(default = "default_latch_velocity")]
    pub latch_velocity: f64,
    #[serde(default = "default_zero_backoff")]
    pub zero_backoff: f64,
    #[serde(default = "default_true")]
    pub min_switch_enabled: bool,
    #[serde(default)]
    pub max_switch_enabled: bool,
}

fn default_velocity_max() -> f64 {
    5000.0
}
fn default_travel_max() -> f64 {
    200.0
}
fn default_jerk_max() -> f64 {
    5000.0
}
fn default_junction_deviation() -> f64 {
    0.05
}
fn default_search_velocity() -> f64 {
    500.0
}
fn default_latch_velocity() -> f64 {
    100.0
}
fn default_zero_backoff() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl AxisConfig {
    pub fn linear() -> Self {
        Self {
            mode: AxisMode::Standard,
            velocity_max: default_velocity_max(),
            feedrate_max: default_velocity_max(),
            travel_min: 0.0,
            travel_max: default_travel_max(),
            jerk_max: default_jerk_max(),
            junction_deviation: default_junction_deviation(),
            polarity_reversed: false,
            search_velocity: default_search_velocity(),
            latch_velocity: default_latch_velocity(),
            zero_backoff: default_zero_backoff(),
            min_switch_enabled: true,
            max_switch_enabled: false,
        }
    }

    fn vertical() -> Self {
        Self {
            velocity_max: 1200.0,
            feedrate_max: 1200.0,
            travel_max: 100.0,
            search_velocity: 400.0,
            ..Self::linear()
        }
    }

    pub fn rotary() -> Self {
        Self {
            velocity_max: 3600.0,
            feedrate_max: 3600.0,
            travel_max: 0.0,
            junction_deviation: 0.5,
            min_switch_enabled: false,
            ..Self::linear()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != AxisMode::Disabled
    }

    /// A travel range is only enforced when one has been configured.
    pub fn has_travel_range(&self) -> bool {
        self.travel_max > self.travel_min
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxesConfig {
    #[serde(default = "AxisConfig::linear")]
    pub x: AxisConfig,
    #[serde(default = "AxisConfig::linear")]
    pub y: AxisConfig,
    #[serde(default = "AxisConfig::vertical")]
    pub z: AxisConfig,
    #[serde(default = "AxisConfig::rotary")]
    pub a: AxisConfig,
    #[serde(default = "AxisConfig::rotary")]
    pub b: AxisConfig,
    #[serde(default = "AxisConfig::rotary")]
    pub c: AxisConfig,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            x: AxisConfig::linear(),
            y: AxisConfig::linear(),
            z: AxisConfig::vertical(),
            a: AxisConfig::rotary(),
            b: AxisConfig::rotary(),
            c: AxisConfig::rotary(),
        }
    }
}

impl AxesConfig {
    pub fn get(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::A => &self.a,
            Axis::B => &self.b,
            Axis::C => &self.c,
        }
    }

    pub fn get_mut(&mut self, axis: Axis) -> &mut AxisConfig {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::A => &mut self.a,
            Axis::B => &mut self.b,
            Axis::C => &mut self.c,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotorConfig {
    pub axis: Axis,
    #[serde(default = "default_step_angle")]
    pub step_angle: f64,
    #[serde(default = "default_travel_per_rev")]
    pub travel_per_rev: f64,
    #[serde(default = "default_microsteps")]
    pub microsteps: u8,
    #[serde(default)]
    pub polarity_reversed: bool,
    #[serde(default)]
    pub power_mode: PowerMode,
}

fn default_step_angle() -> f64 {
    1.8
}
fn default_travel_per_rev() -> f64 {
    5.0
}
fn default_microsteps() -> u8 {
    8
}

impl MotorConfig {
    pub fn new(axis: Axis, travel_per_rev: f64) -> Self {
        Self {
            axis,
            step_angle: default_step_angle(),
            travel_per_rev,
            microsteps: default_microsteps(),
            polarity_reversed: false,
            power_mode: PowerMode::default(),
        }
    }

    pub fn steps_per_unit(&self) -> f64 {
        360.0 / (self.step_angle / f64::from(self.microsteps)) / self.travel_per_rev
    }
}

fn default_motors() -> [MotorConfig; MOTORS] {
    [
        MotorConfig::new(Axis::X, 5.0),
        MotorConfig::new(Axis::Y, 5.0),
        MotorConfig::new(Axis::Z, 2.0),
        MotorConfig::new(Axis::A, 360.0),
    ]
}

/// Complete machine description consumed by the planner, runtime and canonical machine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default = "default_motors")]
    pub motors: [MotorConfig; MOTORS],
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            axes: AxesConfig::default(),
            motors: default_motors(),
        }
    }
}

impl MachineConfig {
    pub fn axis(&self, axis: Axis) -> &AxisConfig {
        self.axes.get(axis)
    }

    pub fn axis_at(&self, index: usize) -> &AxisConfig {
        self.axes.get(Axis::ALL[index])
    }

    pub fn steps_per_unit(&self, motor: usize) -> f64 {
        self.motors[motor].steps_per_unit()
    }

    /// Axis jerk in mm/min^3.
    pub fn jerk(&self, axis: Axis) -> f64 {
        self.axis(axis).jerk_max * JERK_MULTIPLIER
    }

    pub fn junction_integration_minutes(&self) -> f64 {
        self.system.junction_integration_time / 60.0
    }

    /// Direction line level for a positive step is inverted when exactly one of
    /// the motor and its axis is reversed.
    pub fn direction_inverted(&self, motor: usize) -> bool {
        let m = &self.motors[motor];
        m.polarity_reversed ^ self.axis(m.axis).polarity_reversed
    }

    /// Lowest-numbered motor driving `axis`; used to read positions back from steps.
    pub fn motor_for_axis(&self, axis: Axis) -> Option<usize> {
        self.motors.iter().position(|m| m.axis == axis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, m) in self.motors.iter().enumerate() {
            if !matches!(m.microsteps, 1 | 2 | 4 | 8) {
                return Err(ConfigError::Invalid(format!(
                    "motor {} microsteps must be 1, 2, 4 or 8 (got {})",
                    i + 1,
                    m.microsteps
                )));
            }
            if m.step_angle <= 0.0 || m.travel_per_rev <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "motor {} step angle and travel per revolution must be positive",
                    i + 1
                )));
            }
        }
        for axis in Axis::ALL {
            let a = self.axis(axis);
            if a.velocity_max <= 0.0 || a.feedrate_max <= 0.0 || a.jerk_max <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "axis {} velocity, feed rate and jerk must be positive",
                    axis.letter()
                )));
            }
            if a.junction_deviation < 0.0 || a.travel_max < a.travel_min {
                return Err(ConfigError::Invalid(format!(
                    "axis {} junction deviation or travel range out of range",
                    axis.letter()
                )));
            }
        }
        let s = &self.system;
        if s.chord_tolerance <= 0.0 || s.chord_time_max <= 0.0 {
            return Err(ConfigError::Invalid(
                "chord tolerance and chord time must be positive".to_string(),
            ));
        }
        if s.junction_acceleration <= 0.0 || s.junction_integration_time <= 0.0 {
            return Err(ConfigError::Invalid(
                "junction acceleration and integration time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate a machine configuration file.
pub fn load_config(path: &str) -> Result<MachineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: MachineConfig = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    tracing::info!("Loaded machine configuration from {}", path);
    Ok(config)
}
