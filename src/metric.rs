/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements squared distances, orientation tests, and shear projections for each metric.
//
// Created on: 18 Jun 2026     Author: Daniel Owen
//
// Copyright (c) 2026, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use glam::DVec3;
use num_complex::Complex64;

use crate::corr3::CorrError;

/// Coordinate system of a point catalog.
///
/// Positions are carried as 3-vectors in every system; flat catalogs use the
/// xy-plane with z = 0, spherical catalogs use unit vectors built from
/// (ra, dec).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordSystem {
    /// Points in the 2D plane.
    Flat,

    /// Points in 3D space.
    ThreeD,

    /// Points on the unit sphere.
    Sphere,
}

/// Distance metric used by a traversal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Metric {
    /// Straight-line distances. Valid for every coordinate system; on the
    /// sphere this measures chord lengths through the interior.
    Euclidean,

    /// Great-circle distances. Only valid for [`CoordSystem::Sphere`].
    Arc,

    /// Euclidean distances with periodic wrapping along each axis. Valid for
    /// flat and 3D catalogs; the box periods come from the binning
    /// configuration.
    Periodic,
}

/// Resolved combination of a metric and a coordinate system.
///
/// Construction validates the pairing, so the per-triangle queries can stay
/// branch-light. The three capabilities consumed by the traversal are
/// [`dist_sq`](MetricAdapter::dist_sq), [`ccw`](MetricAdapter::ccw), and
/// [`project`](MetricAdapter::project).
#[derive(Debug, Copy, Clone)]
pub struct MetricAdapter {
    metric: Metric,
    coords: CoordSystem,
    period: DVec3,
    half_period: DVec3,
}

impl MetricAdapter {
    /// Validates the metric/coordinate pairing and captures the periodic box
    /// periods (ignored unless the metric is [`Metric::Periodic`]).
    pub fn new(metric: Metric, coords: CoordSystem, period: DVec3) -> Result<Self, CorrError> {
        match (metric, coords) {
            (Metric::Arc, CoordSystem::Sphere) => {}
            (Metric::Arc, _) => return Err(CorrError::UnsupportedMetric { metric, coords }),
            (Metric::Periodic, CoordSystem::Sphere) => {
                return Err(CorrError::UnsupportedMetric { metric, coords })
            }
            (Metric::Periodic, _) => {
                let need_z = coords == CoordSystem::ThreeD;
                if period.x <= 0.0 || period.y <= 0.0 || (need_z && period.z <= 0.0) {
                    return Err(CorrError::InvalidBinning {
                        reason: "the Periodic metric requires positive box periods".to_string(),
                    });
                }
            }
            (Metric::Euclidean, _) => {}
        }

        Ok(Self {
            metric,
            coords,
            period,
            half_period: 0.5 * period,
        })
    }

    /// The coordinate system this adapter was resolved for.
    pub fn coords(&self) -> CoordSystem {
        self.coords
    }

    /// Squared distance between two cell centres.
    ///
    /// The Arc metric measures along great circles and rescales the supplied
    /// cell sizes from chord lengths to arc lengths, so the caller's pruning
    /// bounds stay valid on the sphere. Callers pass zero sizes when they
    /// have already resolved them.
    pub fn dist_sq(&self, p1: DVec3, p2: DVec3, s1: &mut f64, s2: &mut f64) -> f64 {
        match self.metric {
            Metric::Euclidean => (p1 - p2).length_squared(),
            Metric::Arc => {
                let chord_sq = (p1 - p2).length_squared();
                let chord = chord_sq.sqrt();
                let theta = 2.0 * (0.5 * chord).min(1.0).asin();
                if chord > 0.0 {
                    let scale = theta / chord;
                    *s1 *= scale;
                    *s2 *= scale;
                }
                theta * theta
            }
            Metric::Periodic => {
                let mut d = (p1 - p2).abs();
                if d.x > self.half_period.x {
                    d.x = self.period.x - d.x;
                }
                if d.y > self.half_period.y {
                    d.y = self.period.y - d.y;
                }
                if self.coords == CoordSystem::ThreeD && d.z > self.half_period.z {
                    d.z = self.period.z - d.z;
                }
                d.length_squared()
            }
        }
    }

    /// Whether the triangle (p1, p2, p3) winds counter-clockwise.
    ///
    /// In 3D the orientation is taken as seen from the origin (the observer),
    /// by dotting the triangle normal with the first vertex. Colinear
    /// triples count as counter-clockwise.
    pub fn ccw(&self, p1: DVec3, p2: DVec3, p3: DVec3) -> bool {
        match self.coords {
            CoordSystem::Flat => (p2 - p1).cross(p3 - p1).z >= 0.0,
            _ => (p2 - p1).cross(p3 - p1).dot(p1) <= 0.0,
        }
    }

    /// Rotates the three spin-2 values into the frame tied to the triangle's
    /// centroid, so their products are invariant under the coordinate choice.
    ///
    /// Each value is rotated to be measured relative to the direction from
    /// its vertex toward the centroid; a spin-2 quantity picks up the phase
    /// e^(-2i·angle).
    pub fn project(
        &self,
        p1: DVec3,
        p2: DVec3,
        p3: DVec3,
        g1: &mut Complex64,
        g2: &mut Complex64,
        g3: &mut Complex64,
    ) {
        match self.coords {
            CoordSystem::Flat => {
                let cen = (p1 + p2 + p3) / 3.0;
                rotate_flat(p1, cen, g1);
                rotate_flat(p2, cen, g2);
                rotate_flat(p3, cen, g3);
            }
            _ => {
                // Off-sphere positions project radially before the tangent
                // frame is built.
                let u1 = unit_or_zero(p1);
                let u2 = unit_or_zero(p2);
                let u3 = unit_or_zero(p3);
                let cen = unit_or_zero(u1 + u2 + u3);
                rotate_sphere(u1, cen, g1);
                rotate_sphere(u2, cen, g2);
                rotate_sphere(u3, cen, g3);
            }
        }
    }
}

fn unit_or_zero(p: DVec3) -> DVec3 {
    let len = p.length();
    if len > 0.0 {
        p / len
    } else {
        p
    }
}

/// Rotates a flat-sky shear to the frame whose first axis points from `p`
/// toward `cen`.
fn rotate_flat(p: DVec3, cen: DVec3, g: &mut Complex64) {
    let r = Complex64::new(cen.x - p.x, cen.y - p.y);
    let norm = r.norm_sqr();
    if norm > 0.0 {
        // conj(r^2)/|r|^2 = e^(-2i arg r)
        *g *= (r * r).conj() / norm;
    }
}

/// Rotates a shear measured against local north at unit vector `p` into the
/// frame whose first axis points along the great circle toward `cen`.
fn rotate_sphere(p: DVec3, cen: DVec3, g: &mut Complex64) {
    // Tangent direction at p toward cen.
    let t = cen - p * p.dot(cen);
    let tn = t.length();
    // Local east and north tangent basis.
    let e = DVec3::Z.cross(p);
    let en = e.length();
    if tn == 0.0 || en == 0.0 {
        // cen coincides with p (or its antipode), or p sits on a pole where
        // the north convention degenerates. Leave the value unrotated.
        return;
    }
    let t = t / tn;
    let e = e / en;
    let n = p.cross(e);

    let cosb = t.dot(n);
    let sinb = t.dot(e);
    // e^(-2i beta) via the double-angle forms.
    *g *= Complex64::new(cosb * cosb - sinb * sinb, -2.0 * sinb * cosb);
}
