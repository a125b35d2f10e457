// src/gcode/interp.rs - Block to canonical command translation
use super::parser::Block;
use crate::error::{MotionError, MotionResult};
use crate::machine::command::{
    ArcCommand, CanonicalCommand, CoolantChange, DistanceMode, FeedMode, ModalChange, MotionMode, OriginCommand,
    Plane, Spindle, Units,
};
use crate::AXES;
use heapless::Deque;

/// Commands produced by one block.
pub type CommandQueue = Deque<CanonicalCommand, 16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    NonModal,
    Motion,
    Plane,
    Distance,
    ArcDistance,
    FeedMode,
    Units,
    CoordSystem,
}

fn group_of(code: u16) -> Option<Group> {
    Some(match code {
        40 | 100 | 282 | 283 | 920 | 921 | 922 | 923 => Group::NonModal,
        0 | 10 | 20 | 30 | 800 => Group::Motion,
        170 | 180 | 190 => Group::Plane,
        900 | 910 => Group::Distance,
        901 | 911 => Group::ArcDistance,
        930 | 940 => Group::FeedMode,
        200 | 210 => Group::Units,
        540 | 550 | 560 | 570 | 580 | 590 | 591 | 592 | 593 => Group::CoordSystem,
        _ => return None,
    })
}

/// G codes of a block sorted into their modal groups.
#[derive(Default)]
struct Groups {
    non_modal: Option<u16>,
    motion: Option<u16>,
    plane: Option<u16>,
    distance: Option<u16>,
    arc_distance: Option<u16>,
    feed_mode: Option<u16>,
    units: Option<u16>,
    coord_system: Option<u16>,
    machine_coords: bool,
}

impl Groups {
    fn sort(codes: &[u16]) -> MotionResult<Self> {
        let mut groups = Groups::default();
        for &code in codes {
            if code == 530 {
                groups.machine_coords = true;
                continue;
            }
            let group = group_of(code).ok_or(MotionError::UnsupportedCommand)?;
            let slot = match group {
                Group::NonModal => &mut groups.non_modal,
                Group::Motion => &mut groups.motion,
                Group::Plane => &mut groups.plane,
                Group::Distance => &mut groups.distance,
                Group::ArcDistance => &mut groups.arc_distance,
                Group::FeedMode => &mut groups.feed_mode,
                Group::Units => &mut groups.units,
                Group::CoordSystem => &mut groups.coord_system,
            };
            if slot.replace(code).is_some() {
                return Err(MotionError::UnsupportedCommand);
            }
        }
        Ok(groups)
    }
}

fn push(queue: &mut CommandQueue, command: CanonicalCommand) -> MotionResult<()> {
    queue.push_back(command).map_err(|_| MotionError::UnsupportedCommand)
}

fn modal(queue: &mut CommandQueue, change: ModalChange) -> MotionResult<()> {
    push(queue, CanonicalCommand::ChangeModal(change))
}

fn whole(value: f64) -> MotionResult<u32> {
    if value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) {
        Ok(value as u32)
    } else {
        Err(MotionError::BadNumber)
    }
}

/// Translate a block into canonical commands in execution order.
/// `motion_mode` is the sticky mode left by earlier blocks.
pub fn interpret(block: &Block, motion_mode: MotionMode) -> MotionResult<CommandQueue> {
    let groups = Groups::sort(&block.g)?;
    let mut queue = CommandQueue::new();

    if let Some(code) = groups.feed_mode {
        let mode = if code == 930 { FeedMode::InverseTime } else { FeedMode::UnitsPerMinute };
        modal(&mut queue, ModalChange::FeedMode(mode))?;
    }
    if let Some(f) = block.f {
        if f < 0.0 {
            return Err(MotionError::BadNumber);
        }
        modal(&mut queue, ModalChange::FeedRate(f))?;
    }
    if let Some(s) = block.s {
        if s < 0.0 {
            return Err(MotionError::BadNumber);
        }
        modal(&mut queue, ModalChange::SpindleSpeed(s))?;
    }
    if let Some(t) = block.t {
        modal(&mut queue, ModalChange::Tool(whole(t)?))?;
    }

    let mut spindle = None;
    let mut stop = None;
    let mut coolant: heapless::Vec<CoolantChange, 3> = heapless::Vec::new();
    for &m in &block.m {
        match m {
            3 | 4 | 5 => {
                let change = match m {
                    3 => Spindle::Clockwise,
                    4 => Spindle::CounterClockwise,
                    _ => Spindle::Off,
                };
                if spindle.replace(change).is_some() {
                    return Err(MotionError::UnsupportedCommand);
                }
            }
            7 | 8 | 9 => {
                let change = match m {
                    7 => CoolantChange::Mist,
                    8 => CoolantChange::Flood,
                    _ => CoolantChange::Off,
                };
                coolant.push(change).map_err(|_| MotionError::UnsupportedCommand)?;
            }
            0 | 1 | 2 | 30 => {
                let command = match m {
                    0 => CanonicalCommand::ProgramStop { optional: false },
                    1 => CanonicalCommand::ProgramStop { optional: true },
                    _ => CanonicalCommand::ProgramEnd,
                };
                if stop.replace(command).is_some() {
                    return Err(MotionError::UnsupportedCommand);
                }
            }
            _ => return Err(MotionError::UnsupportedCommand),
        }
    }
    if let Some(change) = spindle {
        modal(&mut queue, ModalChange::Spindle(change))?;
    }
    for change in coolant {
        modal(&mut queue, ModalChange::Coolant(change))?;
    }

    if groups.non_modal == Some(40) {
        let seconds = block.p.ok_or(MotionError::BadNumber)?;
        if seconds < 0.0 {
            return Err(MotionError::BadNumber);
        }
        push(&mut queue, CanonicalCommand::Dwell { seconds })?;
    }
    if let Some(code) = groups.plane {
        let plane = match code {
            170 => Plane::Xy,
            180 => Plane::Xz,
            _ => Plane::Yz,
        };
        modal(&mut queue, ModalChange::Plane(plane))?;
    }
    if let Some(code) = groups.units {
        let units = if code == 200 { Units::Inches } else { Units::Millimeters };
        modal(&mut queue, ModalChange::Units(units))?;
    }
    if let Some(code) = groups.distance {
        let mode = if code == 900 { DistanceMode::Absolute } else { DistanceMode::Incremental };
        modal(&mut queue, ModalChange::Distance(mode))?;
    }
    if let Some(code) = groups.arc_distance {
        let mode = if code == 901 { DistanceMode::Absolute } else { DistanceMode::Incremental };
        modal(&mut queue, ModalChange::ArcDistance(mode))?;
    }
    if let Some(code) = groups.coord_system {
        let index = match code {
            591 => 6,
            592 => 7,
            593 => 8,
            c => usize::from((c - 540) / 10),
        };
        push(&mut queue, CanonicalCommand::SelectCoordSystem(index))?;
    }

    // Non-modal codes that consume the axis words.
    let mut axes_used = false;
    match groups.non_modal {
        Some(100) => {
            if block.l != Some(2.0) {
                return Err(MotionError::UnsupportedCommand);
            }
            let p = whole(block.p.ok_or(MotionError::BadNumber)?)? as usize;
            if !(1..=9).contains(&p) {
                return Err(MotionError::BadNumber);
            }
            push(
                &mut queue,
                CanonicalCommand::SetOrigin(OriginCommand::CoordOffset { system: p - 1, offsets: block.axes }),
            )?;
            axes_used = true;
        }
        Some(282) => {
            if !block.has_axis_words() {
                return Err(MotionError::UnsupportedCommand);
            }
            let mut axes = [false; AXES];
            for (flag, word) in axes.iter_mut().zip(&block.axes) {
                *flag = word.is_some();
            }
            push(&mut queue, CanonicalCommand::Home { axes })?;
            axes_used = true;
        }
        Some(283) => {
            push(&mut queue, CanonicalCommand::SetOrigin(OriginCommand::SetPosition(block.axes)))?;
            axes_used = true;
        }
        Some(920) => {
            push(&mut queue, CanonicalCommand::SetOrigin(OriginCommand::G92Set(block.axes)))?;
            axes_used = true;
        }
        Some(921) => push(&mut queue, CanonicalCommand::SetOrigin(OriginCommand::G92Reset))?,
        Some(922) => push(&mut queue, CanonicalCommand::SetOrigin(OriginCommand::G92Suspend))?,
        Some(923) => push(&mut queue, CanonicalCommand::SetOrigin(OriginCommand::G92Resume))?,
        _ => {}
    }

    let mode = match groups.motion {
        Some(0) => MotionMode::Traverse,
        Some(10) => MotionMode::Feed,
        Some(20) => MotionMode::ArcClockwise,
        Some(30) => MotionMode::ArcCounterClockwise,
        Some(_) => MotionMode::Cancelled,
        None => motion_mode,
    };
    if groups.motion.is_some() {
        if axes_used {
            return Err(MotionError::UnsupportedCommand);
        }
        modal(&mut queue, ModalChange::MotionMode(mode))?;
    }
    if block.has_axis_words() && !axes_used {
        let target = block.axes;
        let machine_coords = groups.machine_coords;
        let command = match mode {
            MotionMode::Traverse => CanonicalCommand::StraightTraverse { target, machine_coords },
            MotionMode::Feed => CanonicalCommand::StraightFeed { target, machine_coords },
            MotionMode::ArcClockwise | MotionMode::ArcCounterClockwise => {
                if machine_coords {
                    return Err(MotionError::UnsupportedCommand);
                }
                let turns = match block.p {
                    Some(p) => whole(p)?.max(1),
                    None => 1,
                };
                CanonicalCommand::ArcFeed(ArcCommand {
                    target,
                    offsets: block.offsets,
                    radius: block.r,
                    clockwise: mode == MotionMode::ArcClockwise,
                    turns,
                })
            }
            MotionMode::Cancelled => return Err(MotionError::UnsupportedCommand),
        };
        push(&mut queue, command)?;
    }

    if let Some(command) = stop {
        push(&mut queue, command)?;
    }
    Ok(queue)
}
