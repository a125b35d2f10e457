// src/motion/arc.rs - Chord subdivision of circular and helical arcs
//! An arc is turned into a run of short lines, one per scheduler pass, so a
//! long arc never blocks line intake. The radius vector is advanced by a
//! fixed rotation and recomputed exactly every [`RENORMALIZE_EVERY`]
//! segments to keep rounding drift off the path.

use crate::error::{MotionError, MotionResult};
use crate::motion::EPSILON;
use crate::AXES;
use std::f64::consts::TAU;

/// Segments between exact recomputations of the radius vector.
pub const RENORMALIZE_EVERY: u32 = 25;

/// Start and end points closer than this are a full circle.
const FULL_CIRCLE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArcCenter {
    /// Centre relative to the start point, in the plane's two axes.
    Offset([f64; 2]),
    /// Signed radius; negative selects the arc longer than a half circle.
    Radius(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcSpec {
    pub start: [f64; AXES],
    pub target: [f64; AXES],
    pub center: ArcCenter,
    /// Axis indices spanning the arc plane, in rotation order.
    pub plane: (usize, usize),
    pub clockwise: bool,
    pub turns: u32,
    /// Path feed, mm/min.
    pub feed: f64,
    pub chord_tolerance: f64,
    /// Seconds.
    pub chord_time_max: f64,
}

#[derive(Debug, Clone)]
pub struct ArcGenerator {
    start: [f64; AXES],
    target: [f64; AXES],
    plane: (usize, usize),
    center: [f64; 2],
    radius: f64,
    /// Total swept angle, radians.
    travel: f64,
    start_angle: f64,
    /// Signed angle per segment.
    step_angle: f64,
    cos_step: f64,
    sin_step: f64,
    vector: [f64; 2],
    segments: u32,
    done: u32,
    feed: f64,
    active: bool,
}

impl ArcGenerator {
    pub fn new(spec: &ArcSpec) -> MotionResult<Self> {
        if !spec.feed.is_finite() || spec.feed <= 0.0 {
            return Err(MotionError::BadNumber);
        }
        let (a0, a1) = spec.plane;
        let start = [spec.start[a0], spec.start[a1]];
        let end = [spec.target[a0], spec.target[a1]];
        let offset = match spec.center {
            ArcCenter::Offset(offset) => offset,
            ArcCenter::Radius(r) => radius_center_offset(start, end, r, spec.clockwise)?,
        };
        let center = [start[0] + offset[0], start[1] + offset[1]];
        let radius = offset[0].hypot(offset[1]);
        if radius < EPSILON {
            return Err(MotionError::ArcGeometry);
        }
        let end_radius = (end[0] - center[0]).hypot(end[1] - center[1]);
        if (end_radius - radius).abs() > (0.001 * radius).max(0.005) {
            tracing::warn!(
                "Arc end radius {:.4} does not match start radius {:.4}",
                end_radius,
                radius
            );
            return Err(MotionError::ArcGeometry);
        }

        let start_angle = (start[1] - center[1]).atan2(start[0] - center[0]);
        let end_angle = (end[1] - center[1]).atan2(end[0] - center[0]);
        let full_circle = (end[0] - start[0]).hypot(end[1] - start[1]) < FULL_CIRCLE_EPSILON;
        let mut travel = if full_circle {
            TAU
        } else if spec.clockwise {
            (start_angle - end_angle).rem_euclid(TAU)
        } else {
            (end_angle - start_angle).rem_euclid(TAU)
        };
        travel += TAU * f64::from(spec.turns.max(1) - 1);

        let by_time = spec.chord_time_max * spec.feed / 60.0;
        let by_tolerance = radius * (2.0 * spec.chord_tolerance / radius).sqrt().min(1.0).sin();
        let chord = by_time.min(by_tolerance).max(EPSILON);
        let segments = ((travel * radius / chord).ceil() as u32).max(1);
        let step_angle = if spec.clockwise { -travel } else { travel } / f64::from(segments);

        tracing::debug!(
            "Arc r={:.4} through {:.4} rad in {} segments",
            radius,
            travel,
            segments
        );
        Ok(Self {
            start: spec.start,
            target: spec.target,
            plane: spec.plane,
            center,
            radius,
            travel,
            start_angle,
            step_angle,
            cos_step: step_angle.cos(),
            sin_step: step_angle.sin(),
            vector: [start[0] - center[0], start[1] - center[1]],
            segments,
            done: 0,
            feed: spec.feed,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn feed(&self) -> f64 {
        self.feed
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Helical path length: swept arc combined with the linear travel.
    pub fn path_length(&self) -> f64 {
        let (a0, a1) = self.plane;
        let linear: f64 = (0..AXES)
            .filter(|&i| i != a0 && i != a1)
            .map(|i| (self.target[i] - self.start[i]).powi(2))
            .sum();
        (self.radius * self.travel).hypot(linear.sqrt())
    }

    pub fn center(&self) -> [f64; 2] {
        self.center
    }

    pub fn segments(&self) -> u32 {
        self.segments
    }

    pub fn remaining(&self) -> u32 {
        self.segments - self.done
    }

    /// Endpoint of the next chord, without consuming it.
    pub fn next_point(&self) -> Option<[f64; AXES]> {
        if !self.active {
            return None;
        }
        let k = self.done + 1;
        if k >= self.segments {
            return Some(self.target);
        }
        let vector = self.vector_at(k);
        let (a0, a1) = self.plane;
        let fraction = f64::from(k) / f64::from(self.segments);
        let mut point = [0.0; AXES];
        for (i, p) in point.iter_mut().enumerate() {
            *p = self.start[i] + (self.target[i] - self.start[i]) * fraction;
        }
        point[a0] = self.center[0] + vector[0];
        point[a1] = self.center[1] + vector[1];
        Some(point)
    }

    /// Consume the chord returned by [`next_point`](Self::next_point).
    pub fn advance(&mut self) {
        if !self.active {
            return;
        }
        self.done += 1;
        if self.done >= self.segments {
            self.active = false;
        } else {
            self.vector = self.vector_at(self.done);
        }
    }

    pub fn abort(&mut self) {
        self.active = false;
    }

    fn vector_at(&self, k: u32) -> [f64; 2] {
        if k % RENORMALIZE_EVERY == 0 {
            let angle = self.start_angle + self.step_angle * f64::from(k);
            [self.radius * angle.cos(), self.radius * angle.sin()]
        } else {
            let [x, y] = self.vector;
            [
                x * self.cos_step - y * self.sin_step,
                x * self.sin_step + y * self.cos_step,
            ]
        }
    }
}

/// Centre offset for the radius form. Of the two circles through both
/// points, a positive radius picks the shorter arc.
fn radius_center_offset(start: [f64; 2], end: [f64; 2], radius: f64, clockwise: bool) -> MotionResult<[f64; 2]> {
    let x = end[0] - start[0];
    let y = end[1] - start[1];
    let chord = x.hypot(y);
    if chord < FULL_CIRCLE_EPSILON {
        return Err(MotionError::ArcGeometry);
    }
    let h_squared = 4.0 * radius * radius - x * x - y * y;
    if h_squared < 0.0 {
        return Err(MotionError::ArcGeometry);
    }
    let mut h = -h_squared.sqrt() / chord;
    if !clockwise {
        h = -h;
    }
    if radius < 0.0 {
        h = -h;
    }
    Ok([0.5 * (x - y * h), 0.5 * (y + x * h)])
}
