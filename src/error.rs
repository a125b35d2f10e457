// src/error.rs - Status kinds returned by foreground operations
use thiserror::Error;

/// Status code reported for an accepted block.
pub const STATUS_OK: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotionError {
    #[error("resource busy, try again")]
    TryAgain,
    #[error("planner buffer full")]
    PlannerFull,
    #[error("runtime buffer full")]
    RuntimeFull,
    #[error("zero length move")]
    ZeroLengthMove,
    #[error("bad number format")]
    BadNumber,
    #[error("unsupported command")]
    UnsupportedCommand,
    #[error("soft limit exceeded")]
    SoftLimit,
    #[error("arc specification error")]
    ArcGeometry,
    #[error("homing cycle failed")]
    Homing,
    #[error("unknown config token")]
    UnknownToken,
    #[error("config value out of range")]
    BadValue,
    #[error("command rejected while machine is alarmed")]
    MachineAlarmed,
    #[error("hardware alarm")]
    HardwareAlarm,
}

impl MotionError {
    /// Numeric code used in acknowledgements.
    pub fn code(self) -> u8 {
        match self {
            MotionError::TryAgain => 2,
            MotionError::PlannerFull => 3,
            MotionError::RuntimeFull => 4,
            MotionError::ZeroLengthMove => 5,
            MotionError::BadNumber => 10,
            MotionError::UnsupportedCommand => 11,
            MotionError::SoftLimit => 12,
            MotionError::ArcGeometry => 13,
            MotionError::Homing => 14,
            MotionError::UnknownToken => 15,
            MotionError::BadValue => 16,
            MotionError::MachineAlarmed => 17,
            MotionError::HardwareAlarm => 20,
        }
    }

    /// Back-pressure results are retried by the scheduler on the next pass.
    pub fn is_back_pressure(self) -> bool {
        matches!(
            self,
            MotionError::TryAgain | MotionError::PlannerFull | MotionError::RuntimeFull
        )
    }

    pub fn is_informational(self) -> bool {
        matches!(self, MotionError::ZeroLengthMove)
    }
}

pub type MotionResult<T> = Result<T, MotionError>;
