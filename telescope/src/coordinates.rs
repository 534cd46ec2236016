//! Equatorial coordinate helpers
//!
//! Sky directions are unit vectors in the equatorial frame: x towards the
//! equinox, z towards the celestial pole. J2000 and JNow (equinox of date)
//! differ by precession (IAU 1976, Lieske angles) and nutation (the dominant
//! IAU 1980 terms, good to well under an arcsecond of the full series).

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Julian date of the J2000.0 epoch
pub const J2000_JD: f64 = 2_451_545.0;
/// Julian date of the Unix epoch
pub const UNIX_EPOCH_JD: f64 = 2_440_587.5;

const ARCSEC: f64 = PI / (180.0 * 3600.0);
const MICROS_PER_DAY: f64 = 86_400e6;

/// Frame a device reports and accepts coordinates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Equinox {
    #[default]
    J2000,
    JNow,
}

/// Unit vector from right ascension and declination (radians)
pub fn spherical_to_rect(ra: f64, dec: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra.sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

/// Right ascension in [0, 2π) and declination in [-π/2, π/2] of a vector.
///
/// The vector need not be normalized. A zero vector maps to (0, 0).
pub fn rect_to_spherical(v: &Vector3<f64>) -> (f64, f64) {
    let ra = v.y.atan2(v.x).rem_euclid(TAU);
    let xy = v.x.hypot(v.y);
    let dec = v.z.atan2(xy).clamp(-FRAC_PI_2, FRAC_PI_2);
    // rem_euclid can round up to exactly TAU for tiny negative angles
    (if ra >= TAU { 0.0 } else { ra }, dec)
}

pub fn hours_to_radians(hours: f64) -> f64 {
    hours * PI / 12.0
}

pub fn radians_to_hours(radians: f64) -> f64 {
    radians * 12.0 / PI
}

/// Julian date for a Unix time in microseconds
pub fn julian_date(unix_micros: i64) -> f64 {
    unix_micros as f64 / MICROS_PER_DAY + UNIX_EPOCH_JD
}

/// Julian centuries since J2000.0
fn centuries_since_j2000(unix_micros: i64) -> f64 {
    (julian_date(unix_micros) - J2000_JD) / 36_525.0
}

/// Rotation of the frame about x
fn rot_x(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, s, 0.0, -s, c)
}

/// Rotation of the frame about y
fn rot_y(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

/// Rotation of the frame about z
fn rot_z(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0)
}

/// IAU 1976 precession matrix from J2000 to the mean equator of date
fn precession_matrix(t: f64) -> Matrix3<f64> {
    let zeta = (2306.2181 * t + 0.30188 * t * t + 0.017998 * t * t * t) * ARCSEC;
    let z = (2306.2181 * t + 1.09468 * t * t + 0.018203 * t * t * t) * ARCSEC;
    let theta = (2004.3109 * t - 0.42665 * t * t - 0.041833 * t * t * t) * ARCSEC;
    rot_z(-z) * rot_y(theta) * rot_z(-zeta)
}

/// Nutation matrix from the mean to the true equator of date
fn nutation_matrix(t: f64) -> Matrix3<f64> {
    let mean_obliquity =
        (84381.448 - 46.8150 * t - 0.00059 * t * t + 0.001813 * t * t * t) * ARCSEC;

    // Moon's ascending node, mean longitudes of Sun and Moon
    let omega = (125.04452 - 1934.136261 * t).to_radians();
    let sun = (280.4665 + 36000.7698 * t).to_radians();
    let moon = (218.3165 + 481267.8813 * t).to_radians();

    let dpsi = (-17.20 * omega.sin() - 1.32 * (2.0 * sun).sin() - 0.23 * (2.0 * moon).sin()
        + 0.21 * (2.0 * omega).sin())
        * ARCSEC;
    let deps = (9.20 * omega.cos() + 0.57 * (2.0 * sun).cos() + 0.10 * (2.0 * moon).cos()
        - 0.09 * (2.0 * omega).cos())
        * ARCSEC;

    rot_x(-(mean_obliquity + deps)) * rot_z(-dpsi) * rot_x(mean_obliquity)
}

/// Combined J2000 to JNow rotation at the given instant
pub fn j2000_to_jnow_matrix(unix_micros: i64) -> Matrix3<f64> {
    let t = centuries_since_j2000(unix_micros);
    nutation_matrix(t) * precession_matrix(t)
}

pub fn j2000_to_jnow(v: &Vector3<f64>, unix_micros: i64) -> Vector3<f64> {
    j2000_to_jnow_matrix(unix_micros) * v
}

pub fn jnow_to_j2000(v: &Vector3<f64>, unix_micros: i64) -> Vector3<f64> {
    // Rotation matrices are orthogonal
    j2000_to_jnow_matrix(unix_micros).transpose() * v
}

/// Express a J2000 vector in `equinox`
pub fn from_j2000(v: &Vector3<f64>, equinox: Equinox, unix_micros: i64) -> Vector3<f64> {
    match equinox {
        Equinox::J2000 => *v,
        Equinox::JNow => j2000_to_jnow(v, unix_micros),
    }
}

/// Convert a vector expressed in `equinox` to J2000
pub fn to_j2000(v: &Vector3<f64>, equinox: Equinox, unix_micros: i64) -> Vector3<f64> {
    match equinox {
        Equinox::J2000 => *v,
        Equinox::JNow => jnow_to_j2000(v, unix_micros),
    }
}
