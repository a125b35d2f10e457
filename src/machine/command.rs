// src/machine/command.rs - Canonical commands and modal state
use crate::AXES;
use serde::Serialize;

/// Programmed value per axis; `None` leaves the axis where it is.
pub type AxisWords = [Option<f64>; AXES];

/// Work coordinate systems G54 to G59.3.
pub const COORD_SYSTEMS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Inches,
    #[default]
    Millimeters,
}

impl Units {
    pub fn to_mm(self, value: f64) -> f64 {
        match self {
            Units::Inches => value * 25.4,
            Units::Millimeters => value,
        }
    }

    pub fn from_mm(self, value: f64) -> f64 {
        match self {
            Units::Inches => value / 25.4,
            Units::Millimeters => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    #[default]
    Xy,
    Xz,
    Yz,
}

impl Plane {
    /// Axis indices of the plane, in the order that makes G2 clockwise
    /// when viewed from the positive third axis.
    pub fn axes(self) -> (usize, usize) {
        match self {
            Plane::Xy => (0, 1),
            Plane::Xz => (2, 0),
            Plane::Yz => (1, 2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    #[default]
    UnitsPerMinute,
    InverseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    Traverse,
    Feed,
    ArcClockwise,
    ArcCounterClockwise,
    #[default]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Spindle {
    #[default]
    Off,
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Coolant {
    pub mist: bool,
    pub flood: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModalState {
    pub units: Units,
    pub plane: Plane,
    pub distance: DistanceMode,
    pub arc_distance: DistanceMode,
    pub feed_mode: FeedMode,
    /// In program units per minute, or inverse minutes under G93.
    pub feed_rate: f64,
    pub motion_mode: MotionMode,
    pub tool: u32,
    pub spindle: Spindle,
    pub spindle_speed: f64,
    pub coolant: Coolant,
    pub coord_system: usize,
}

impl Default for ModalState {
    fn default() -> Self {
        Self {
            units: Units::Millimeters,
            plane: Plane::Xy,
            distance: DistanceMode::Absolute,
            arc_distance: DistanceMode::Incremental,
            feed_mode: FeedMode::UnitsPerMinute,
            feed_rate: 0.0,
            motion_mode: MotionMode::Cancelled,
            tool: 0,
            spindle: Spindle::Off,
            spindle_speed: 0.0,
            coolant: Coolant::default(),
            coord_system: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoolantChange {
    Mist,
    Flood,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModalChange {
    FeedMode(FeedMode),
    FeedRate(f64),
    SpindleSpeed(f64),
    Tool(u32),
    Spindle(Spindle),
    Coolant(CoolantChange),
    Plane(Plane),
    Units(Units),
    Distance(DistanceMode),
    ArcDistance(DistanceMode),
    MotionMode(MotionMode),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcCommand {
    pub target: AxisWords,
    /// I, J, K.
    pub offsets: [Option<f64>; 3],
    pub radius: Option<f64>,
    pub clockwise: bool,
    pub turns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OriginCommand {
    /// G10 L2: store offsets for a coordinate system.
    CoordOffset { system: usize, offsets: AxisWords },
    /// G28.3: declare the machine position of the named axes.
    SetPosition(AxisWords),
    G92Set(AxisWords),
    G92Reset,
    G92Suspend,
    G92Resume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanonicalCommand {
    StraightTraverse { target: AxisWords, machine_coords: bool },
    StraightFeed { target: AxisWords, machine_coords: bool },
    ArcFeed(ArcCommand),
    Dwell { seconds: f64 },
    ProgramStop { optional: bool },
    ProgramEnd,
    SetOrigin(OriginCommand),
    SelectCoordSystem(usize),
    ChangeModal(ModalChange),
    Home { axes: [bool; AXES] },
}

impl CanonicalCommand {
    /// Commands that only run once all queued motion has finished.
    pub fn needs_idle(&self) -> bool {
        matches!(
            self,
            CanonicalCommand::ProgramStop { .. }
                | CanonicalCommand::ProgramEnd
                | CanonicalCommand::Home { .. }
                | CanonicalCommand::SetOrigin(OriginCommand::SetPosition(_))
        )
    }
}
