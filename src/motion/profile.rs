// src/motion/profile.rs - Constant-jerk velocity transitions
//! A velocity change Δv under jerk J ramps acceleration up and back down with
//! no constant-acceleration plateau. It takes `2·sqrt(Δv/J)`, covers
//! `(v0 + v1)·sqrt(Δv/J)` and peaks at `sqrt(J·Δv)`.
//!
//! Velocities are mm/min and jerk mm/min^3, so raw times come out in minutes.
//! [`Profile`] stores its phase times in seconds.

use crate::motion::EPSILON;

const BISECTION_STEPS: usize = 64;

/// Distance needed to change velocity from `v0` to `v1`.
pub fn transition_length(v0: f64, v1: f64, jerk: f64) -> f64 {
    (v0 + v1) * ((v1 - v0).abs() / jerk).sqrt()
}

/// Time in minutes to change velocity from `v0` to `v1`.
pub fn transition_time(v0: f64, v1: f64, jerk: f64) -> f64 {
    2.0 * ((v1 - v0).abs() / jerk).sqrt()
}

pub fn peak_acceleration(v0: f64, v1: f64, jerk: f64) -> f64 {
    (jerk * (v1 - v0).abs()).sqrt()
}

/// Highest velocity reachable from `v0` within `length`.
///
/// The same bound limits how fast a move may enter if it has to slow to `v0`
/// by its end. The result never overshoots: `transition_length(v0, v, jerk)`
/// is at most `length`.
pub fn reachable_velocity(v0: f64, length: f64, jerk: f64) -> f64 {
    if length <= 0.0 {
        return v0;
    }
    let mut lo = v0;
    let mut hi = v0 + (length * length * jerk).cbrt();
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if transition_length(v0, mid, jerk) > length {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    lo
}

/// Three-phase velocity plan for one move: head (entry to cruise), body at
/// cruise, tail (cruise to exit).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Profile {
    pub entry_velocity: f64,
    pub cruise_velocity: f64,
    pub exit_velocity: f64,
    pub head_length: f64,
    pub body_length: f64,
    pub tail_length: f64,
    pub t_accel: f64,
    pub t_cruise: f64,
    pub t_decel: f64,
    pub accel_peak: f64,
}

impl Profile {
    /// Fit a profile to `length`. When the move is too short to reach
    /// `cruise_max` the cruise velocity is lowered until head and tail fit.
    pub fn plan(entry: f64, exit: f64, cruise_max: f64, length: f64, jerk: f64) -> Profile {
        let cruise_max = cruise_max.max(entry).max(exit);
        let head = transition_length(entry, cruise_max, jerk);
        let tail = transition_length(cruise_max, exit, jerk);
        let cruise = if head + tail <= length {
            cruise_max
        } else {
            let mut lo = entry.max(exit);
            let mut hi = cruise_max;
            for _ in 0..BISECTION_STEPS {
                let mid = 0.5 * (lo + hi);
                if transition_length(entry, mid, jerk) + transition_length(mid, exit, jerk) > length {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            lo
        };
        let head_length = transition_length(entry, cruise, jerk);
        let tail_length = transition_length(cruise, exit, jerk);
        let body_length = (length - head_length - tail_length).max(0.0);
        let t_cruise = if cruise > EPSILON { body_length / cruise * 60.0 } else { 0.0 };
        Profile {
            entry_velocity: entry,
            cruise_velocity: cruise,
            exit_velocity: exit,
            head_length,
            body_length,
            tail_length,
            t_accel: transition_time(entry, cruise, jerk) * 60.0,
            t_cruise,
            t_decel: transition_time(cruise, exit, jerk) * 60.0,
            accel_peak: peak_acceleration(entry, cruise, jerk),
        }
    }

    /// Planned duration in seconds.
    pub fn duration(&self) -> f64 {
        self.t_accel + self.t_cruise + self.t_decel
    }

    pub fn length(&self) -> f64 {
        self.head_length + self.body_length + self.tail_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JERK: f64 = 5.0e9;

    #[test]
    fn transition_is_symmetric() {
        let up = transition_length(0.0, 600.0, JERK);
        let down = transition_length(600.0, 0.0, JERK);
        assert_eq!(up, down);
        assert!((up - 600.0 * (600.0 / JERK).sqrt()).abs() < 1e-12);
        assert!((transition_time(0.0, 600.0, JERK) - 2.0 * (600.0 / JERK).sqrt()).abs() < 1e-15);
    }

    #[test]
    fn reachable_velocity_inverts_transition_length() {
        let v = reachable_velocity(100.0, 0.3, JERK);
        let length = transition_length(100.0, v, JERK);
        assert!(length <= 0.3);
        assert!((length - 0.3).abs() < 1e-9);
        assert_eq!(reachable_velocity(250.0, 0.0, JERK), 250.0);
    }

    #[test]
    fn long_move_reaches_cruise() {
        let p = Profile::plan(0.0, 0.0, 600.0, 10.0, JERK);
        assert_eq!(p.cruise_velocity, 600.0);
        assert!(p.body_length > 9.0);
        assert!((p.length() - 10.0).abs() < 1e-9);
        assert!((p.t_accel - p.t_decel).abs() < 1e-12);
        assert!((p.accel_peak - (JERK * 600.0).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn short_move_lowers_cruise() {
        let p = Profile::plan(0.0, 0.0, 5000.0, 0.1, JERK);
        assert!(p.cruise_velocity < 5000.0);
        assert!(p.cruise_velocity > 0.0);
        assert!(p.length() <= 0.1 + 1e-9);
        assert!((p.head_length - p.tail_length).abs() < 1e-12);
    }

    #[test]
    fn entry_equal_to_cruise_has_no_head() {
        let p = Profile::plan(600.0, 600.0, 600.0, 5.0, JERK);
        assert_eq!(p.head_length, 0.0);
        assert_eq!(p.tail_length, 0.0);
        assert_eq!(p.t_decel, 0.0);
        assert!((p.t_cruise - 0.5).abs() < 1e-12);
    }
}
