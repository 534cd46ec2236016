//! Jitter smoothing of reported mount positions
//!
//! Mounts report positions at irregular intervals and with transport delay.
//! The interpolator keeps a short history ordered by server time and answers
//! position queries for arbitrary instants: between two samples it blends
//! linearly, past the newest it extrapolates along the last two. Results are
//! renormalized to unit length, which is close enough to a great-circle path
//! for the sub-second gaps involved.

use nalgebra::Vector3;
use std::collections::VecDeque;

/// Samples retained for lookups
pub const HISTORY_CAPACITY: usize = 16;

/// One position report from a device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    /// When the report was received locally
    pub client_micros: i64,
    /// When the device says it took the position
    pub server_micros: i64,
    /// J2000 unit vector
    pub position: Vector3<f64>,
    pub status: i32,
}

impl PositionSample {
    pub fn new(client_micros: i64, server_micros: i64, position: Vector3<f64>, status: i32) -> Self {
        Self {
            client_micros,
            server_micros,
            position,
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionInterpolator {
    history: VecDeque<PositionSample>,
}

impl Default for PositionInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionInterpolator {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Record a sample.
    ///
    /// A sample older than the newest one starts a fresh sequence; one with
    /// the same server time replaces the newest. Zero or non-finite vectors
    /// are ignored.
    pub fn add(&mut self, sample: PositionSample) {
        let norm = sample.position.norm();
        if !norm.is_finite() || norm == 0.0 {
            tracing::warn!("Ignoring degenerate position sample {:?}", sample.position);
            return;
        }
        let sample = PositionSample {
            position: sample.position / norm,
            ..sample
        };

        if let Some(newest) = self.history.back() {
            if sample.server_micros < newest.server_micros {
                tracing::debug!(
                    "Server time went back from {} to {}, restarting history",
                    newest.server_micros,
                    sample.server_micros
                );
                self.history.clear();
            } else if sample.server_micros == newest.server_micros {
                self.history.pop_back();
            }
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }

    /// Whether enough samples exist to answer queries
    pub fn is_known(&self) -> bool {
        self.history.len() >= 2
    }

    /// Forget all samples
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Most recent sample
    pub fn newest(&self) -> Option<&PositionSample> {
        self.history.back()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Estimated position at `query_micros` (server time), or `None` before
    /// two samples exist
    pub fn get(&self, query_micros: i64) -> Option<Vector3<f64>> {
        if !self.is_known() {
            return None;
        }
        let len = self.history.len();
        let oldest = &self.history[0];
        if query_micros < oldest.server_micros {
            return Some(oldest.position);
        }

        let newest = &self.history[len - 1];
        if query_micros >= newest.server_micros {
            return Some(blend(&self.history[len - 2], newest, query_micros));
        }

        // Bracketing pair; history is strictly increasing in server time
        let upper = self
            .history
            .iter()
            .position(|s| s.server_micros > query_micros)
            .unwrap_or(len - 1)
            .max(1);
        Some(blend(&self.history[upper - 1], &self.history[upper], query_micros))
    }
}

/// Linear blend (or extrapolation past `b`) along a→b, renormalized
fn blend(a: &PositionSample, b: &PositionSample, query_micros: i64) -> Vector3<f64> {
    let dt = b.server_micros - a.server_micros;
    if dt <= 0 {
        return b.position;
    }
    let fraction = (query_micros - a.server_micros) as f64 / dt as f64;
    let v = a.position + (b.position - a.position) * fraction;
    let norm = v.norm();
    if !norm.is_finite() || norm < 1e-12 {
        return b.position;
    }
    v / norm
}
