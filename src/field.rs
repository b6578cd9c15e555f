/////////////////////////////////////////////////////////////////////////////////////////////
//
// Builds ball-tree fields over weighted point catalogs and exposes the cell view.
//
// Created on: 18 Jun 2026     Author: Daniel Owen
//
// Copyright (c) 2026, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use std::cmp::Ordering;

use faer::Mat;
use glam::DVec3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::corr3::CorrError;
use crate::kinds::{CountKind, FieldKind, ScalarKind, ShearKind};
use crate::metric::CoordSystem;

/// Parameters controlling field construction.
///
/// ### Default Values
/// - `max_top`: `10`
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct FieldParams {
    /// Number of tree levels expanded into the top-level forest. The
    /// traversal's outer parallel loop runs over the top-level cells, so a
    /// larger value exposes more parallel work; `0` keeps the whole catalog
    /// under a single root.
    pub max_top: usize,
}

impl Default for FieldParams {
    fn default() -> Self {
        FieldParams { max_top: 10 }
    }
}

/// A node of a ball tree over one catalog.
///
/// Holds the weighted centroid, the radius of the bounding ball around it,
/// the total weight and point count underneath, and the kind-dependent
/// weighted aggregate. Non-leaf cells own exactly two children; a cell is a
/// leaf iff its size is zero (a single point, or coincident duplicates).
#[derive(Debug)]
pub struct Cell<K: FieldKind> {
    pos: DVec3,
    size: f64,
    weight: f64,
    n: usize,
    kind: K::Aggregate,
    children: Option<Box<(Cell<K>, Cell<K>)>>,
}

impl<K: FieldKind> Cell<K> {
    /// Cell centre (the weighted centroid of the points underneath).
    pub fn pos(&self) -> DVec3 {
        self.pos
    }

    /// Radius of the bounding ball around [`pos`](Cell::pos).
    pub fn size(&self) -> f64 {
        self.size
    }

    /// Total weight of the points underneath.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Number of points underneath.
    pub fn count(&self) -> usize {
        self.n
    }

    /// Kind-dependent weighted aggregate (nothing for counts, sum of w·k for
    /// scalars, sum of w·g for shears).
    pub fn aggregate(&self) -> K::Aggregate {
        self.kind
    }

    pub fn left(&self) -> Option<&Cell<K>> {
        self.children.as_ref().map(|c| &c.0)
    }

    pub fn right(&self) -> Option<&Cell<K>> {
        self.children.as_ref().map(|c| &c.1)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Both children of a non-leaf cell. Cells with nonzero size always have
    /// children, which is what every caller has already established.
    pub(crate) fn kids(&self) -> (&Cell<K>, &Cell<K>) {
        let c = self
            .children
            .as_ref()
            .expect("cell with nonzero size must have children");
        (&c.0, &c.1)
    }
}

struct PointRec<K: FieldKind> {
    pos: DVec3,
    w: f64,
    value: K::Value,
}

/// A forest of ball trees over one catalog, ready for traversal.
#[derive(Debug)]
pub struct Field<K: FieldKind> {
    coords: CoordSystem,
    cells: Vec<Cell<K>>,
    n_points: usize,
}

impl<K: FieldKind> Field<K> {
    /// Coordinate system the catalog was supplied in.
    pub fn coords(&self) -> CoordSystem {
        self.coords
    }

    /// The top-level cells (roots of independently traversable subtrees).
    pub fn top_level(&self) -> &[Cell<K>] {
        &self.cells
    }

    /// Number of points in the catalog.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    fn from_records(
        mut recs: Vec<PointRec<K>>,
        coords: CoordSystem,
        params: FieldParams,
    ) -> Result<Self, CorrError> {
        if recs.is_empty() {
            return Err(CorrError::EmptyField);
        }
        let n_points = recs.len();
        let root = build_cell::<K>(&mut recs, coords);

        // Expand the first max_top levels into the top-level forest.
        let mut tops = vec![root];
        for _ in 0..params.max_top {
            if tops.iter().all(|c| c.is_leaf()) {
                break;
            }
            let mut next = Vec::with_capacity(tops.len() * 2);
            for mut cell in tops {
                match cell.children.take() {
                    Some(kids) => {
                        let (l, r) = *kids;
                        next.push(l);
                        next.push(r);
                    }
                    None => next.push(cell),
                }
            }
            tops = next;
        }

        Ok(Field {
            coords,
            cells: tops,
            n_points,
        })
    }
}

impl Field<CountKind> {
    /// Builds a count field from positions and weights.
    pub fn counts(
        points: &Mat<f64>,
        weights: &[f64],
        coords: CoordSystem,
        params: FieldParams,
    ) -> Result<Self, CorrError> {
        let recs = make_records::<CountKind>(points, weights, coords, |_| ())?;
        Self::from_records(recs, coords, params)
    }
}

impl Field<ScalarKind> {
    /// Builds a scalar field from positions, weights, and per-point values.
    pub fn scalars(
        points: &Mat<f64>,
        weights: &[f64],
        values: &[f64],
        coords: CoordSystem,
        params: FieldParams,
    ) -> Result<Self, CorrError> {
        check_len("values", values.len(), points.nrows())?;
        let recs = make_records::<ScalarKind>(points, weights, coords, |i| values[i])?;
        Self::from_records(recs, coords, params)
    }
}

impl Field<ShearKind> {
    /// Builds a spin-2 field from positions, weights, and the two shear
    /// components per point.
    pub fn shears(
        points: &Mat<f64>,
        weights: &[f64],
        g1: &[f64],
        g2: &[f64],
        coords: CoordSystem,
        params: FieldParams,
    ) -> Result<Self, CorrError> {
        check_len("g1", g1.len(), points.nrows())?;
        check_len("g2", g2.len(), points.nrows())?;
        let recs =
            make_records::<ShearKind>(points, weights, coords, |i| Complex64::new(g1[i], g2[i]))?;
        Self::from_records(recs, coords, params)
    }
}

fn check_len(name: &str, len: usize, expected: usize) -> Result<(), CorrError> {
    if len != expected {
        return Err(CorrError::InvalidCatalog {
            reason: format!("{} has {} entries but the catalog has {} points", name, len, expected),
        });
    }
    Ok(())
}

fn make_records<K: FieldKind>(
    points: &Mat<f64>,
    weights: &[f64],
    coords: CoordSystem,
    value_at: impl Fn(usize) -> K::Value,
) -> Result<Vec<PointRec<K>>, CorrError> {
    let n = points.nrows();
    check_len("weights", weights.len(), n)?;

    let expected_cols = match coords {
        CoordSystem::Flat => 2,
        CoordSystem::ThreeD => 3,
        // (ra, dec) in radians.
        CoordSystem::Sphere => 2,
    };
    if points.ncols() != expected_cols {
        return Err(CorrError::InvalidCatalog {
            reason: format!(
                "expected {} position columns for {:?} coordinates, found {}",
                expected_cols,
                coords,
                points.ncols()
            ),
        });
    }

    let mut recs = Vec::with_capacity(n);
    for i in 0..n {
        let pos = match coords {
            CoordSystem::Flat => DVec3::new(points[(i, 0)], points[(i, 1)], 0.0),
            CoordSystem::ThreeD => DVec3::new(points[(i, 0)], points[(i, 1)], points[(i, 2)]),
            CoordSystem::Sphere => {
                let (ra, dec) = (points[(i, 0)], points[(i, 1)]);
                DVec3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
            }
        };
        recs.push(PointRec {
            pos,
            w: weights[i],
            value: value_at(i),
        });
    }
    Ok(recs)
}

/// Recursively builds the ball tree over one slice of points, splitting along
/// the axis of largest extent at the coordinate mean.
fn build_cell<K: FieldKind>(pts: &mut [PointRec<K>], coords: CoordSystem) -> Cell<K> {
    let n = pts.len();
    let mut w = 0.0;
    let mut agg = K::zero_aggregate();
    let mut sum = DVec3::ZERO;
    let mut wsum = DVec3::ZERO;
    for p in pts.iter() {
        w += p.w;
        K::add_weighted(&mut agg, p.value, p.w);
        sum += p.pos;
        wsum += p.pos * p.w;
    }

    // Weighted centroid, falling back to the plain mean when the weights
    // cancel. Spherical catalogs keep their centres on the unit sphere.
    let mut pos = if w != 0.0 { wsum / w } else { sum / n as f64 };
    if coords == CoordSystem::Sphere {
        let len = pos.length();
        if len > 0.0 {
            pos /= len;
        }
    }

    let mut size_sq: f64 = 0.0;
    for p in pts.iter() {
        size_sq = size_sq.max((p.pos - pos).length_squared());
    }
    let size = size_sq.sqrt();

    if size == 0.0 {
        // A single point, or coincident duplicates no split can separate.
        return Cell {
            pos,
            size: 0.0,
            weight: w,
            n,
            kind: agg,
            children: None,
        };
    }

    let mut lo = pts[0].pos;
    let mut hi = pts[0].pos;
    for p in pts.iter().skip(1) {
        lo = lo.min(p.pos);
        hi = hi.max(p.pos);
    }
    let extent = hi - lo;
    let axis = if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    };
    let mean = sum[axis] / n as f64;

    pts.sort_unstable_by(|a, b| {
        a.pos[axis]
            .partial_cmp(&b.pos[axis])
            .unwrap_or(Ordering::Equal)
    });
    // A nonzero extent puts the mean strictly between the axis extremes, so
    // both halves are nonempty.
    let mid = pts.partition_point(|p| p.pos[axis] < mean);
    let (left, right) = pts.split_at_mut(mid);
    let lc = build_cell::<K>(left, coords);
    let rc = build_cell::<K>(right, coords);

    Cell {
        pos,
        size,
        weight: w,
        n,
        kind: agg,
        children: Some(Box::new((lc, rc))),
    }
}
