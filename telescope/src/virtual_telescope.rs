//! Simulated mount with no device behind it
//!
//! Always connected while running. Every step moves a fixed fraction of the
//! way towards the last goto target.

use crate::connection::{default_position, TelescopeClient};
use crate::error::ConnectionError;
use crate::interpolator::{PositionInterpolator, PositionSample};
use nalgebra::Vector3;

/// Weight of the current position against the target per step
const SLEW_INERTIA: f64 = 31.0;

pub struct VirtualTelescope {
    id: String,
    current: Vector3<f64>,
    target: Vector3<f64>,
    interpolator: PositionInterpolator,
    fov_circles: Vec<f64>,
    running: bool,
}

impl VirtualTelescope {
    pub fn new(id: &str, fov_circles: Vec<f64>) -> Self {
        Self {
            id: id.to_string(),
            current: default_position(),
            target: default_position(),
            interpolator: PositionInterpolator::new(),
            fov_circles,
            running: false,
        }
    }

    pub fn target(&self) -> Vector3<f64> {
        self.target
    }
}

/// One slew step of `current` towards `target`
pub fn slew_step(current: &Vector3<f64>, target: &Vector3<f64>) -> Vector3<f64> {
    let next = current * SLEW_INERTIA + target;
    let norm = next.norm();
    if norm > 0.0 && norm.is_finite() {
        next / norm
    } else {
        *current
    }
}

impl TelescopeClient for VirtualTelescope {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, _now: i64) -> Result<(), ConnectionError> {
        self.running = true;
        tracing::info!("{}: virtual telescope started", self.id);
        Ok(())
    }

    fn step(&mut self, now: i64) -> Result<(), ConnectionError> {
        if !self.running {
            return Ok(());
        }
        self.current = slew_step(&self.current, &self.target);
        self.interpolator
            .add(PositionSample::new(now, now, self.current, 0));
        Ok(())
    }

    fn position(&self, now: i64) -> Vector3<f64> {
        self.interpolator.get(now).unwrap_or(self.current)
    }

    fn goto(&mut self, target_j2000: Vector3<f64>, _now: i64) {
        let norm = target_j2000.norm();
        if !norm.is_finite() || norm == 0.0 {
            tracing::warn!("{}: ignoring goto to degenerate vector", self.id);
            return;
        }
        tracing::debug!("{}: slewing to {:?}", self.id, target_j2000);
        self.target = target_j2000 / norm;
    }

    fn is_connected(&self) -> bool {
        self.running
    }

    fn has_known_position(&self) -> bool {
        self.interpolator.is_known()
    }

    fn stop(&mut self) {
        self.running = false;
        self.interpolator.reset();
        tracing::info!("{}: virtual telescope stopped", self.id);
    }

    fn fov_circles(&self) -> &[f64] {
        &self.fov_circles
    }

    fn set_fov_circles(&mut self, circles: Vec<f64>) {
        self.fov_circles = circles;
    }
}
