// src/motion/junction.rs - Corner velocity between consecutive moves
//! The corner is modelled as a circle of radius `R` tangent to both moves,
//! placed so that it passes within the junction deviation `δ` of the corner
//! point. Centripetal acceleration at `v` is `v²/R`, so the corner speed is
//! `sqrt(a·R)`. Each axis must also be able to swing its velocity component
//! across the corner within the jerk integration window.

use crate::config::MachineConfig;
use crate::motion::EPSILON;
use crate::{AXES, Axis};

/// Cosines this close to ±1 are treated as straight-through or full reversal.
const COSINE_LIMIT: f64 = 1e-6;

/// Maximum velocity (mm/min) at which a move along `prev` can hand over to one
/// along `next`. Both arguments are unit vectors. Returns `f64::INFINITY` for
/// a collinear continuation; the caller bounds the result by the moves' own
/// cruise limits.
pub fn junction_velocity(prev: &[f64; AXES], next: &[f64; AXES], config: &MachineConfig) -> f64 {
    let cos_theta = -prev.iter().zip(next).map(|(a, b)| a * b).sum::<f64>();
    if cos_theta > 1.0 - COSINE_LIMIT {
        return 0.0;
    }
    if cos_theta < -1.0 + COSINE_LIMIT {
        return f64::INFINITY;
    }

    let deviation = (weighted_deviation(prev, config) + weighted_deviation(next, config)) / 2.0;
    let sin_half = ((1.0 - cos_theta) / 2.0).sqrt();
    let radius = deviation * sin_half / (1.0 - sin_half);
    let centripetal = (config.system.junction_acceleration * radius).sqrt();

    centripetal.min(jerk_limited_velocity(prev, next, config))
}

fn weighted_deviation(unit: &[f64; AXES], config: &MachineConfig) -> f64 {
    Axis::ALL
        .iter()
        .zip(unit)
        .map(|(axis, u)| {
            let d = u * config.axis(*axis).junction_deviation;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// An axis whose unit component changes by `Δu` sees its velocity jump by
/// `v·Δu`; a constant-jerk transition of that size lasting the integration
/// window `t` needs `v·Δu ≤ J·t²/4`.
fn jerk_limited_velocity(prev: &[f64; AXES], next: &[f64; AXES], config: &MachineConfig) -> f64 {
    let window = config.junction_integration_minutes();
    let mut limit = f64::INFINITY;
    for axis in Axis::ALL {
        let i = axis.index();
        let delta = (next[i] - prev[i]).abs();
        if delta > EPSILON {
            limit = limit.min(config.jerk(axis) * window * window / (4.0 * delta));
        }
    }
    limit
}
