/////////////////////////////////////////////////////////////////////////////////////////////
//
// Implements the core dual-tree triangle traversal and the binned correlation accumulators.
//
// Created on: 18 Jun 2026     Author: Daniel Owen
//
// Copyright (c) 2026, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::binning::{BinningConfig, TriangleBinning};
use crate::field::{Cell, Field};
use crate::kinds::{CountKind, FieldKind, ScalarKind, ShearKind, ZetaStore};
use crate::metric::{CoordSystem, Metric, MetricAdapter};
use crate::progress::{ProgressMsg, ProgressSink};

/// Errors that can occur while configuring or running a correlation.
#[derive(Debug)]
pub enum CorrError {
    /// A field was passed to an accumulator that has already been used with
    /// a different coordinate system.
    CoordsMismatch {
        expected: CoordSystem,
        found: CoordSystem,
    },

    /// A field holds no points (or no top-level cells).
    EmptyField,

    /// The metric is not defined for the field's coordinate system.
    UnsupportedMetric {
        metric: Metric,
        coords: CoordSystem,
    },

    /// The binning configuration has a non-positive range, a zero bin
    /// count, or an out-of-order edge.
    InvalidBinning { reason: String },

    /// The correlation objects of a cross-variant call do not share one
    /// binning configuration.
    BinningMismatch,

    /// The catalog arrays passed to a field constructor are inconsistent.
    InvalidCatalog { reason: String },
}

impl fmt::Display for CorrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrError::CoordsMismatch { expected, found } => write!(
                f,
                "field uses {:?} coordinates but the accumulator was already used with {:?}",
                found, expected
            ),
            CorrError::EmptyField => write!(f, "field has no points"),
            CorrError::UnsupportedMetric { metric, coords } => write!(
                f,
                "the {:?} metric is not defined for {:?} coordinates",
                metric, coords
            ),
            CorrError::InvalidBinning { reason } => {
                write!(f, "invalid binning configuration: {}", reason)
            }
            CorrError::BinningMismatch => write!(
                f,
                "cross-correlation accumulators must share one binning configuration"
            ),
            CorrError::InvalidCatalog { reason } => write!(f, "invalid catalog: {}", reason),
        }
    }
}

impl std::error::Error for CorrError {}

/// Count-count-count correlation.
pub type NnnCorr = Corr3<CountKind>;

/// Scalar-scalar-scalar correlation.
pub type KkkCorr = Corr3<ScalarKind>;

/// Shear-shear-shear correlation.
pub type GggCorr = Corr3<ShearKind>;

/// Bin-indexed sums for one accumulator. Shadow copies of this struct are
/// what the worker threads write into.
#[derive(Debug)]
struct CorrData<K: FieldKind> {
    ntri: Vec<f64>,
    weight: Vec<f64>,
    meand1: Vec<f64>,
    meanlogd1: Vec<f64>,
    meand2: Vec<f64>,
    meanlogd2: Vec<f64>,
    meand3: Vec<f64>,
    meanlogd3: Vec<f64>,
    meanu: Vec<f64>,
    meanv: Vec<f64>,
    zeta: K::Zeta,
}

impl<K: FieldKind> CorrData<K> {
    fn new(ntot: usize) -> Self {
        Self {
            ntri: vec![0.0; ntot],
            weight: vec![0.0; ntot],
            meand1: vec![0.0; ntot],
            meanlogd1: vec![0.0; ntot],
            meand2: vec![0.0; ntot],
            meanlogd2: vec![0.0; ntot],
            meand3: vec![0.0; ntot],
            meanlogd3: vec![0.0; ntot],
            meanu: vec![0.0; ntot],
            meanv: vec![0.0; ntot],
            zeta: K::Zeta::new(ntot),
        }
    }

    fn clear(&mut self) {
        self.ntri.fill(0.0);
        self.weight.fill(0.0);
        self.meand1.fill(0.0);
        self.meanlogd1.fill(0.0);
        self.meand2.fill(0.0);
        self.meanlogd2.fill(0.0);
        self.meand3.fill(0.0);
        self.meanlogd3.fill(0.0);
        self.meanu.fill(0.0);
        self.meanv.fill(0.0);
        self.zeta.clear();
    }

    fn add(&mut self, other: &Self) {
        fn add_into(a: &mut [f64], b: &[f64]) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x += y;
            }
        }
        add_into(&mut self.ntri, &other.ntri);
        add_into(&mut self.weight, &other.weight);
        add_into(&mut self.meand1, &other.meand1);
        add_into(&mut self.meanlogd1, &other.meanlogd1);
        add_into(&mut self.meand2, &other.meand2);
        add_into(&mut self.meanlogd2, &other.meanlogd2);
        add_into(&mut self.meand3, &other.meand3);
        add_into(&mut self.meanlogd3, &other.meanlogd3);
        add_into(&mut self.meanu, &other.meanu);
        add_into(&mut self.meanv, &other.meanv);
        self.zeta.add(&other.zeta);
    }
}

/// A binned three-point correlation accumulator.
///
/// One `Corr3` owns the sums for every (d2, u, v) bin: triangle counts,
/// weights, the weighted mean side lengths and shape ratios, and the
/// kind-dependent zeta channels. Any number of traversals may add into it;
/// the caller reads the raw sums afterwards (normalising by
/// [`weight`](Corr3::weight) where a mean is wanted).
///
/// The coordinate system is locked by the first traversal; mixing flat and
/// spherical fields on one accumulator is an error.
#[derive(Debug)]
pub struct Corr3<K: FieldKind> {
    config: BinningConfig,
    binning: TriangleBinning,
    coords: Option<CoordSystem>,
    data: CorrData<K>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl<K: FieldKind> Corr3<K> {
    /// Validates the configuration and allocates a zeroed accumulator.
    pub fn new(config: &BinningConfig) -> Result<Self, CorrError> {
        let binning = TriangleBinning::new(config)?;
        let ntot = binning.ntot;
        Ok(Self {
            config: *config,
            binning,
            coords: None,
            data: CorrData::new(ntot),
            progress: None,
        })
    }

    /// Attaches a progress sink; the traversal emits one event per finished
    /// top-level cell of the first field.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// The configuration this accumulator was built from.
    pub fn config(&self) -> &BinningConfig {
        &self.config
    }

    /// Total number of bins.
    pub fn ntot(&self) -> usize {
        self.binning.ntot
    }

    /// Coordinate system locked in by the first traversal, if any.
    pub fn coords(&self) -> Option<CoordSystem> {
        self.coords
    }

    /// Sum of N(c1)·N(c2)·N(c3) per bin.
    pub fn ntri(&self) -> &[f64] {
        &self.data.ntri
    }

    /// Sum of W(c1)·W(c2)·W(c3) per bin.
    pub fn weight(&self) -> &[f64] {
        &self.data.weight
    }

    pub fn meand1(&self) -> &[f64] {
        &self.data.meand1
    }

    pub fn meanlogd1(&self) -> &[f64] {
        &self.data.meanlogd1
    }

    pub fn meand2(&self) -> &[f64] {
        &self.data.meand2
    }

    pub fn meanlogd2(&self) -> &[f64] {
        &self.data.meanlogd2
    }

    pub fn meand3(&self) -> &[f64] {
        &self.data.meand3
    }

    pub fn meanlogd3(&self) -> &[f64] {
        &self.data.meanlogd3
    }

    pub fn meanu(&self) -> &[f64] {
        &self.data.meanu
    }

    pub fn meanv(&self) -> &[f64] {
        &self.data.meanv
    }

    /// Kind-dependent zeta channels.
    pub fn zeta(&self) -> &K::Zeta {
        &self.data.zeta
    }

    /// Zeroes every bin and unlocks the coordinate system.
    pub fn clear(&mut self) {
        self.data.clear();
        self.coords = None;
    }

    fn bind_coords(&mut self, coords: CoordSystem) -> Result<(), CorrError> {
        match self.coords {
            None => {
                self.coords = Some(coords);
                Ok(())
            }
            Some(expected) if expected == coords => Ok(()),
            Some(expected) => Err(CorrError::CoordsMismatch {
                expected,
                found: coords,
            }),
        }
    }

    /// Auto-correlation: accumulates every triangle with all three points
    /// drawn from `field`.
    pub fn process_auto(&mut self, field: &Field<K>, metric: Metric) -> Result<(), CorrError> {
        let cells = field.top_level();
        let n1 = cells.len();
        if n1 == 0 {
            return Err(CorrError::EmptyField);
        }
        self.bind_coords(field.coords())?;
        let adapter = MetricAdapter::new(metric, field.coords(), self.binning.period)?;

        let bin = self.binning;
        let progress = self.progress.clone();
        let done = AtomicUsize::new(0);

        let walker = (0..n1)
            .into_par_iter()
            .fold(
                || Walker::<K>::new(&bin, &adapter, 1),
                |mut w, i| {
                    let c1 = &cells[i];
                    w.process3(c1);
                    for j in (i + 1)..n1 {
                        let c2 = &cells[j];
                        w.process12(0, 0, 0, c1, c2);
                        w.process12(0, 0, 0, c2, c1);
                        for c3 in &cells[(j + 1)..] {
                            w.process111([0; 6], c1, c2, c3, 0.0, 0.0, 0.0);
                        }
                    }
                    if let Some(sink) = &progress {
                        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
                        sink.emit(ProgressMsg::TopCellProcessed {
                            completed,
                            total: n1,
                        });
                    }
                    w
                },
            )
            .reduce(|| Walker::<K>::new(&bin, &adapter, 1), Walker::merge);

        self.data.add(&walker.shadows[0]);
        Ok(())
    }

    /// 1-2 cross-correlation: one point from `field1` and two from `field2`.
    ///
    /// `corrs` receives the three role assignments in the order
    /// `[122, 212, 221]`: `corrs[0]` collects triangles whose canonical
    /// vertex 1 came from `field1`, and so on. All three must share one
    /// binning configuration.
    pub fn process_cross12(
        corrs: &mut [Corr3<K>; 3],
        field1: &Field<K>,
        field2: &Field<K>,
        metric: Metric,
    ) -> Result<(), CorrError> {
        check_same_binning(corrs.iter())?;
        let coords = check_same_coords(field1, field2)?;
        let cells1 = field1.top_level();
        let cells2 = field2.top_level();
        if cells1.is_empty() || cells2.is_empty() {
            return Err(CorrError::EmptyField);
        }
        for corr in corrs.iter_mut() {
            corr.bind_coords(coords)?;
        }
        let adapter = MetricAdapter::new(metric, coords, corrs[0].binning.period)?;

        let bin = corrs[0].binning;
        let progress = corrs[0].progress.clone();
        let done = AtomicUsize::new(0);
        let n1 = cells1.len();
        let n2 = cells2.len();

        let walker = (0..n1)
            .into_par_iter()
            .fold(
                || Walker::<K>::new(&bin, &adapter, 3),
                |mut w, i| {
                    let c1 = &cells1[i];
                    for j in 0..n2 {
                        let c2 = &cells2[j];
                        w.process12(0, 1, 2, c1, c2);
                        for c3 in &cells2[(j + 1)..] {
                            w.process111([0, 0, 1, 2, 1, 2], c1, c2, c3, 0.0, 0.0, 0.0);
                        }
                    }
                    if let Some(sink) = &progress {
                        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
                        sink.emit(ProgressMsg::TopCellProcessed {
                            completed,
                            total: n1,
                        });
                    }
                    w
                },
            )
            .reduce(|| Walker::<K>::new(&bin, &adapter, 3), Walker::merge);

        for (corr, shadow) in corrs.iter_mut().zip(walker.shadows.iter()) {
            corr.data.add(shadow);
        }
        Ok(())
    }

    /// Full cross-correlation: one point from each of three fields.
    ///
    /// `corrs` receives the six role assignments in the order
    /// `[123, 132, 213, 231, 312, 321]`, naming which field the canonical
    /// vertices 1, 2, 3 came from. All six must share one binning
    /// configuration.
    pub fn process_cross(
        corrs: &mut [Corr3<K>; 6],
        field1: &Field<K>,
        field2: &Field<K>,
        field3: &Field<K>,
        metric: Metric,
    ) -> Result<(), CorrError> {
        check_same_binning(corrs.iter())?;
        let coords = check_same_coords(field1, field2)?;
        if field3.coords() != coords {
            return Err(CorrError::CoordsMismatch {
                expected: coords,
                found: field3.coords(),
            });
        }
        let cells1 = field1.top_level();
        let cells2 = field2.top_level();
        let cells3 = field3.top_level();
        if cells1.is_empty() || cells2.is_empty() || cells3.is_empty() {
            return Err(CorrError::EmptyField);
        }
        for corr in corrs.iter_mut() {
            corr.bind_coords(coords)?;
        }
        let adapter = MetricAdapter::new(metric, coords, corrs[0].binning.period)?;

        let bin = corrs[0].binning;
        let progress = corrs[0].progress.clone();
        let done = AtomicUsize::new(0);
        let n1 = cells1.len();

        let walker = (0..n1)
            .into_par_iter()
            .fold(
                || Walker::<K>::new(&bin, &adapter, 6),
                |mut w, i| {
                    let c1 = &cells1[i];
                    for c2 in cells2 {
                        for c3 in cells3 {
                            w.process111([0, 1, 2, 3, 4, 5], c1, c2, c3, 0.0, 0.0, 0.0);
                        }
                    }
                    if let Some(sink) = &progress {
                        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
                        sink.emit(ProgressMsg::TopCellProcessed {
                            completed,
                            total: n1,
                        });
                    }
                    w
                },
            )
            .reduce(|| Walker::<K>::new(&bin, &adapter, 6), Walker::merge);

        for (corr, shadow) in corrs.iter_mut().zip(walker.shadows.iter()) {
            corr.data.add(shadow);
        }
        Ok(())
    }
}

fn check_same_binning<'a, K: FieldKind>(
    mut corrs: impl Iterator<Item = &'a Corr3<K>>,
) -> Result<(), CorrError> {
    let first = match corrs.next() {
        Some(c) => c.config,
        None => return Ok(()),
    };
    if corrs.any(|c| c.config != first) {
        return Err(CorrError::BinningMismatch);
    }
    Ok(())
}

fn check_same_coords<K: FieldKind>(
    field1: &Field<K>,
    field2: &Field<K>,
) -> Result<CoordSystem, CorrError> {
    if field1.coords() != field2.coords() {
        return Err(CorrError::CoordsMismatch {
            expected: field1.coords(),
            found: field2.coords(),
        });
    }
    Ok(field1.coords())
}

// The six orderings of a triangle's vertices are canonicalised to
// d1 >= d2 >= d3 before binning. Each accumulator slot is addressed through
// a routing array indexed by ordering:
//
//   slot   0    1    2    3    4    5
//   order  123  132  213  231  312  321
//
// Re-sorting the vertices composes the current routing with one of the
// fixed permutations below, so the sorted code path is written once and
// still writes each ordering's contribution into its own accumulator.
const SORT_132: [usize; 6] = [1, 0, 4, 5, 2, 3];
const SORT_213: [usize; 6] = [2, 3, 0, 1, 5, 4];
const SORT_231: [usize; 6] = [3, 2, 5, 4, 0, 1];
const SORT_312: [usize; 6] = [4, 5, 1, 0, 3, 2];
const SORT_321: [usize; 6] = [5, 4, 3, 2, 1, 0];

#[inline]
fn compose(perm: [usize; 6], sort: [usize; 6]) -> [usize; 6] {
    std::array::from_fn(|s| perm[sort[s]])
}

#[inline]
fn sqr(x: f64) -> f64 {
    x * x
}

/// Decides that no triangle drawn from the three cells can land in any bin.
/// Sides arrive sorted (d1sq >= d2sq >= d3sq) with s1, s2, s3 the sizes of
/// the opposing cells. Returns d2 when the triple must be kept.
///
/// Every test errs on the side of keeping: a cell triple is only discarded
/// when the bound proves no descendant triangle can reach the range.
fn stop111(
    bin: &TriangleBinning,
    d1sq: f64,
    d2sq: f64,
    d3sq: f64,
    s1: f64,
    s2: f64,
    s3: f64,
) -> Option<f64> {
    // d2 cannot grow to min_sep: at least two sides must stay short.
    if d2sq < bin.min_sep_sq
        && s1 + s3 < bin.min_sep
        && s1 + s2 < bin.min_sep
        && (s1 + s3 == 0.0 || d2sq < sqr(bin.min_sep - s1 - s3))
        && (s1 + s2 == 0.0 || d3sq < sqr(bin.min_sep - s1 - s2))
    {
        return None;
    }

    // d2 cannot shrink below max_sep: at least two sides must stay long.
    if d2sq >= bin.max_sep_sq
        && (s1 + s3 == 0.0 || d2sq >= sqr(bin.max_sep + s1 + s3))
        && (s2 + s3 == 0.0 || d1sq >= sqr(bin.max_sep + s2 + s3))
    {
        return None;
    }

    let d2 = d2sq.sqrt();

    // u = d3/d2 cannot reach min_u. The best case from here is
    // (d3 + s1 + s2) / (d2 - s1 - s3); cross-check against d1 in case the
    // sides relabel under splitting.
    if bin.min_u > 0.0 && d3sq < bin.min_u_sq * d2sq && d2 > s1 + s3 {
        let temp = bin.min_u * (d2 - s1 - s3);
        if temp > s1 + s2 && d3sq < sqr(temp - s1 - s2) {
            let minusq_d1sq = bin.min_u_sq * d1sq;
            if d3sq < minusq_d1sq
                && d1sq > 2.0 * sqr(s2 + s3)
                && minusq_d1sq > 2.0 * d3sq + 2.0 * sqr(s1 + s2 + bin.min_u * (s2 + s3))
            {
                return None;
            }
        }
    }

    // u cannot drop to max_u. The best case is (d3 - s1 - s2)/(d2 + s1 + s3);
    // the guards make sure no other side could become the smallest.
    if bin.max_u < 1.0
        && d3sq >= bin.max_u_sq * d2sq
        && d3sq >= sqr(bin.max_u * (d2 + s1 + s3) + s1 + s2)
    {
        if d2sq > sqr(s1 + s3)
            && d1sq > sqr(s2 + s3)
            && (s2 > s3 || d3sq <= sqr(d2 - s3 + s2))
            && (s1 > s3 || d1sq >= 2.0 * d3sq + 2.0 * sqr(s3 - s1))
        {
            return None;
        }
    }

    let sums = s1 + s2 + s3;

    // |v| = (d1-d2)/d3 cannot drop to max_v. If d1 clears this bound it is
    // the largest side no matter how the cells split.
    if bin.max_v < 1.0 && d1sq > sqr((1.0 + bin.max_v) * d2 + sums + bin.max_v * (s1 + s2)) {
        return None;
    }

    // |v| cannot reach min_v. Tightest near d1 ~ d2, so bound the difference
    // of squares with d2 on the denominator.
    if bin.min_v > 0.0
        && d3sq > sqr(s1 + s2)
        && bin.min_v_sq * d3sq > sqr((d1sq - d2sq) / (2.0 * d2) + sums + bin.min_v * (s1 + s2))
    {
        return None;
    }

    // A side of exactly zero between leaves can never leave the degenerate
    // state.
    if s2 == 0.0 && s3 == 0.0 && d1sq == 0.0 {
        return None;
    }
    if s1 == 0.0 && s3 == 0.0 && d2sq == 0.0 {
        return None;
    }
    if s1 == 0.0 && s2 == 0.0 && d3sq == 0.0 {
        return None;
    }

    Some(d2)
}

/// Thread-local traversal state: the binning, the resolved metric, and one
/// shadow accumulator per routing slot. Shadows live exactly as long as the
/// parallel region and are folded together at its end.
struct Walker<'a, K: FieldKind> {
    bin: &'a TriangleBinning,
    metric: &'a MetricAdapter,
    shadows: Vec<CorrData<K>>,
}

impl<'a, K: FieldKind> Walker<'a, K> {
    fn new(bin: &'a TriangleBinning, metric: &'a MetricAdapter, n_shadows: usize) -> Self {
        Self {
            bin,
            metric,
            shadows: (0..n_shadows).map(|_| CorrData::new(bin.ntot)).collect(),
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for (mine, theirs) in self.shadows.iter_mut().zip(other.shadows.iter()) {
            mine.add(theirs);
        }
        self
    }

    /// All triangles with three points in c1.
    fn process3(&mut self, c1: &Cell<K>) {
        if c1.weight() == 0.0 {
            return;
        }
        // Triangles inside a cell this small cannot have two sides reach
        // min_sep.
        if c1.size() < self.bin.half_min_sep {
            return;
        }
        let (l, r) = c1.kids();
        self.process3(l);
        self.process3(r);
        self.process12(0, 0, 0, l, r);
        self.process12(0, 0, 0, r, l);
    }

    /// All triangles with one point in c1 and two points in c2. `i122`,
    /// `i212`, `i221` route the three role assignments to shadow slots.
    fn process12(&mut self, i122: usize, i212: usize, i221: usize, c1: &Cell<K>, c2: &Cell<K>) {
        if c1.weight() == 0.0 || c2.weight() == 0.0 {
            return;
        }
        let mut s2 = c2.size();
        if s2 == 0.0 {
            return;
        }
        // The pair inside c2 spans at most 2*s2, so d3 cannot reach
        // min_sep * min_u.
        if s2 < self.bin.half_min_d3 {
            return;
        }

        let mut s1 = c1.size();
        let dsq = self.metric.dist_sq(c1.pos(), c2.pos(), &mut s1, &mut s2);
        let s1ps2 = s1 + s2;

        // d + s1 + s2 < min_sep: no triangle can reach min_sep.
        if dsq < self.bin.min_sep_sq && s1ps2 < self.bin.min_sep && dsq < sqr(self.bin.min_sep - s1ps2)
        {
            return;
        }
        // d - s1 - s2 >= max_sep: no triangle can get below max_sep.
        if dsq >= self.bin.max_sep_sq && dsq >= sqr(self.bin.max_sep + s1ps2) {
            return;
        }
        // The largest u from here is 2*s2 / (d - s1 - s2).
        if dsq > sqr(s1 + s2)
            && self.bin.min_u_sq * dsq > sqr(2.0 * s2 + self.bin.min_u * (s1 + s2))
        {
            return;
        }

        let (l, r) = c2.kids();
        self.process12(i122, i212, i221, c1, l);
        self.process12(i122, i212, i221, c1, r);
        // Orderings 123/132 keep vertex 1 in field 1; the rest put a
        // field-2 point first.
        self.process111(
            [i122, i122, i212, i221, i212, i221],
            c1,
            l,
            r,
            0.0,
            0.0,
            0.0,
        );
    }

    /// All triangles with one point in each cell. Unknown squared sides are
    /// passed as 0 and filled in from the metric; the triple is then routed
    /// to the sorted handler with d1 >= d2 >= d3.
    fn process111(
        &mut self,
        perm: [usize; 6],
        c1: &Cell<K>,
        c2: &Cell<K>,
        c3: &Cell<K>,
        mut d1sq: f64,
        mut d2sq: f64,
        mut d3sq: f64,
    ) {
        if c1.weight() == 0.0 || c2.weight() == 0.0 || c3.weight() == 0.0 {
            return;
        }

        let (mut sa, mut sb) = (0.0, 0.0);
        if d1sq == 0.0 {
            d1sq = self.metric.dist_sq(c2.pos(), c3.pos(), &mut sa, &mut sb);
        }
        if d2sq == 0.0 {
            d2sq = self.metric.dist_sq(c1.pos(), c3.pos(), &mut sa, &mut sb);
        }
        if d3sq == 0.0 {
            d3sq = self.metric.dist_sq(c1.pos(), c2.pos(), &mut sa, &mut sb);
        }

        if d1sq > d2sq {
            if d2sq > d3sq {
                self.process111_sorted(perm, c1, c2, c3, d1sq, d2sq, d3sq);
            } else if d1sq > d3sq {
                self.process111_sorted(compose(perm, SORT_132), c1, c3, c2, d1sq, d3sq, d2sq);
            } else {
                self.process111_sorted(compose(perm, SORT_312), c3, c1, c2, d3sq, d1sq, d2sq);
            }
        } else {
            if d1sq > d3sq {
                self.process111_sorted(compose(perm, SORT_213), c2, c1, c3, d2sq, d1sq, d3sq);
            } else if d2sq > d3sq {
                self.process111_sorted(compose(perm, SORT_231), c2, c3, c1, d2sq, d3sq, d1sq);
            } else {
                self.process111_sorted(compose(perm, SORT_321), c3, c2, c1, d3sq, d2sq, d1sq);
            }
        }
    }

    fn process111_sorted(
        &mut self,
        perm: [usize; 6],
        c1: &Cell<K>,
        c2: &Cell<K>,
        c3: &Cell<K>,
        d1sq: f64,
        d2sq: f64,
        d3sq: f64,
    ) {
        debug_assert!(d1sq >= d2sq && d2sq >= d3sq);

        let s1 = c1.size();
        let s2 = c2.size();
        let s3 = c3.size();

        let Some(d2) = stop111(self.bin, d1sq, d2sq, d3sq, s1, s2, s3) else {
            return;
        };
        let bin = self.bin;

        // Set along the way; all four are valid when no split is needed.
        let mut d1 = -1.0;
        let mut d3 = -1.0;
        let mut u = -1.0;
        let mut v = -1.0;

        // Thresholds found empirically on a representative shear run; the
        // 0.7 factor balances splitting c1/c2 along with c3.
        const FACTOR2: f64 = 0.7;

        let s1ps2 = s1 + s2;
        let s1ps3 = s1 + s3;
        let mut d2split = false;

        // c3 blurs all three axes: d2 directly, u through d3, v near
        // equilateral. Check it first.
        let split3 = s3 > 0.0
            && (s3 > d2 * bin.b
                || (s1ps3 > 0.0 && s1ps3 > d2 * bin.b && {
                    d2split = true;
                    s3 >= s1
                })
                || (bin.bu < bin.b && s3 * s3 * d3sq > sqr(bin.bu * d2sq))
                || (bin.bv < bin.b && s3 > d2 * bin.bv));

        let mut split1 = false;
        let mut split2 = false;
        let mut split = split3;

        if split3 {
            // When c3 splits, usually split c1 and c2 too unless they are
            // much smaller.
            let temp = FACTOR2 * s3 * s3 * d3sq;
            split1 = s1 * s1 * d2sq > temp;
            split2 = s2 * s2 * d2sq > temp;
        } else if s1 > 0.0 || s2 > 0.0 {
            split1 = s1 > 0.0 && (d2split || s1 * s1 > d3sq);

            split2 = s2 > 0.0
                && (s2 * s2 > d3sq
                    // c2 could swap into the d2 or d1 role.
                    || (s2 > s3 && d3sq > sqr(d2 - s2 + s3))
                    || (s2 > s1 && d1sq < sqr(d2 + s2 - s1)));

            split = split1
                || split2
                || {
                    // u resolution across c1, c2.
                    d3 = d3sq.sqrt();
                    u = d3 / d2;
                    sqr(s1ps2 + s1ps3 * u) > d2sq * bin.bu_sq
                }
                || {
                    // v resolution across c1, c2.
                    d1 = d1sq.sqrt();
                    v = (d1 - d2) / d3;
                    sqr(s1ps2 * (1.0 + v)) > d3sq * bin.bv_sq
                };

            if split {
                // Splitting one of the pair: take the other along when it is
                // at least as large.
                split1 = split1 || s1 >= s2;
                split2 = split2 || s2 >= s1;
            }
        } else {
            d1 = d1sq.sqrt();
            d3 = d3sq.sqrt();
            u = d3 / d2;
            v = (d1 - d2) / d3;
        }

        if split {
            debug_assert!(!split1 || s1 > 0.0);
            debug_assert!(!split2 || s2 > 0.0);
            debug_assert!(!split3 || s3 > 0.0);

            if split3 {
                let (l3, r3) = c3.kids();
                if split2 {
                    let (l2, r2) = c2.kids();
                    if split1 {
                        let (l1, r1) = c1.kids();
                        self.process111(perm, l1, l2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, l1, l2, r3, 0.0, 0.0, 0.0);
                        self.process111(perm, l1, r2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, l1, r2, r3, 0.0, 0.0, 0.0);
                        self.process111(perm, r1, l2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, r1, l2, r3, 0.0, 0.0, 0.0);
                        self.process111(perm, r1, r2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, r1, r2, r3, 0.0, 0.0, 0.0);
                    } else {
                        self.process111(perm, c1, l2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, c1, l2, r3, 0.0, 0.0, 0.0);
                        self.process111(perm, c1, r2, l3, 0.0, 0.0, 0.0);
                        self.process111(perm, c1, r2, r3, 0.0, 0.0, 0.0);
                    }
                } else if split1 {
                    let (l1, r1) = c1.kids();
                    self.process111(perm, l1, c2, l3, 0.0, 0.0, 0.0);
                    self.process111(perm, l1, c2, r3, 0.0, 0.0, 0.0);
                    self.process111(perm, r1, c2, l3, 0.0, 0.0, 0.0);
                    self.process111(perm, r1, c2, r3, 0.0, 0.0, 0.0);
                } else {
                    // d3 joins c1 and c2, which are both kept.
                    self.process111(perm, c1, c2, l3, 0.0, 0.0, d3sq);
                    self.process111(perm, c1, c2, r3, 0.0, 0.0, d3sq);
                }
            } else if split2 {
                if split1 {
                    let (l1, r1) = c1.kids();
                    let (l2, r2) = c2.kids();
                    self.process111(perm, l1, l2, c3, 0.0, 0.0, 0.0);
                    self.process111(perm, l1, r2, c3, 0.0, 0.0, 0.0);
                    self.process111(perm, r1, l2, c3, 0.0, 0.0, 0.0);
                    self.process111(perm, r1, r2, c3, 0.0, 0.0, 0.0);
                } else {
                    // d2 joins c1 and c3, which are both kept.
                    let (l2, r2) = c2.kids();
                    self.process111(perm, c1, l2, c3, 0.0, d2sq, 0.0);
                    self.process111(perm, c1, r2, c3, 0.0, d2sq, 0.0);
                }
            } else {
                // d1 joins c2 and c3, which are both kept.
                let (l1, r1) = c1.kids();
                self.process111(perm, l1, c2, c3, d1sq, 0.0, 0.0);
                self.process111(perm, r1, c2, c3, d1sq, 0.0, 0.0);
            }
            return;
        }

        debug_assert!(d1 > 0.0);
        debug_assert!(d3 > 0.0);
        debug_assert!(u > 0.0);
        debug_assert!(v >= 0.0);

        // The final values must land inside the bin ranges; boundary
        // rounding can push them out, in which case the triple is dropped.
        if d2 < bin.min_sep || d2 >= bin.max_sep {
            return;
        }
        if u < bin.min_u || u >= bin.max_u {
            return;
        }
        if v < bin.min_v || v >= bin.max_v {
            return;
        }

        let logr = d2.ln();
        let mut kr = ((logr - bin.log_min_sep) / bin.bin_size).floor() as usize;
        // The log form can round past the edge the linear check used.
        if kr >= bin.nbins {
            kr = bin.nbins - 1;
        }
        let mut ku = ((u - bin.min_u) / bin.ubin_size).floor() as usize;
        if ku >= bin.nubins {
            ku = bin.nubins - 1;
        }
        let mut kv = ((v - bin.min_v) / bin.vbin_size).floor() as usize;
        if kv >= bin.nvbins {
            kv = bin.nvbins - 1;
        }

        // The lower half of the v axis holds clockwise triangles.
        if !self.metric.ccw(c1.pos(), c2.pos(), c3.pos()) {
            v = -v;
            kv = bin.nvbins - kv - 1;
        } else {
            kv += bin.nvbins;
        }

        let index = bin.flat_index(kr, ku, kv);
        if index >= bin.ntot {
            return;
        }

        let shadow = &mut self.shadows[perm[0]];
        let nnn = c1.count() as f64 * c2.count() as f64 * c3.count() as f64;
        shadow.ntri[index] += nnn;

        let www = c1.weight() * c2.weight() * c3.weight();
        shadow.weight[index] += www;
        shadow.meand1[index] += www * d1;
        shadow.meanlogd1[index] += www * d1.ln();
        shadow.meand2[index] += www * d2;
        shadow.meanlogd2[index] += www * logr;
        shadow.meand3[index] += www * d3;
        shadow.meanlogd3[index] += www * d3.ln();
        shadow.meanu[index] += www * u;
        shadow.meanv[index] += www * v;

        K::accumulate_zeta(&mut shadow.zeta, self.metric, c1, c2, c3, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldParams;
    use crate::progress::closure_sink;
    use faer::Mat;
    use glam::DVec3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn flat_points(coords: &[(f64, f64)]) -> Mat<f64> {
        Mat::from_fn(coords.len(), 2, |i, j| {
            if j == 0 {
                coords[i].0
            } else {
                coords[i].1
            }
        })
    }

    fn random_flat(n: usize, seed: u64, lo: f64, hi: f64) -> (Mat<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = Mat::from_fn(n, 2, |_, _| rng.random_range(lo..hi));
        let weights = (0..n).map(|_| rng.random_range(0.5..1.5)).collect();
        (points, weights)
    }

    fn assert_allclose(a: &[f64], b: &[f64], rtol: f64, atol: f64) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            let tol = atol + rtol * x.abs().max(y.abs());
            assert!(
                (x - y).abs() <= tol,
                "grids differ at {}: {} vs {}",
                i,
                x,
                y
            );
        }
    }

    struct BruteGrid {
        ntri: Vec<f64>,
        weight: Vec<f64>,
        zeta: Vec<f64>,
    }

    /// Direct triple loop over a flat catalog, binned with the same
    /// conventions as the tree traversal.
    fn brute_force_flat(
        points: &Mat<f64>,
        w: &[f64],
        values: Option<&[f64]>,
        cfg: &BinningConfig,
    ) -> BruteGrid {
        let n = points.nrows();
        let ntot = cfg.ntot();
        let mut grid = BruteGrid {
            ntri: vec![0.0; ntot],
            weight: vec![0.0; ntot],
            zeta: vec![0.0; ntot],
        };

        let bin_size = cfg.bin_size();
        let ubin = (cfg.max_u - cfg.min_u) / cfg.nubins as f64;
        let vbin = (cfg.max_v - cfg.min_v) / cfg.nvbins as f64;
        let max_u = if cfg.max_u == 1.0 { 1.0 + 1e-10 } else { cfg.max_u };
        let max_v = if cfg.max_v == 1.0 { 1.0 + 1e-10 } else { cfg.max_v };
        let log_min = cfg.min_sep.ln();
        let nvbins2 = 2 * cfg.nvbins;
        let nuv = cfg.nubins * nvbins2;

        let p = |i: usize| (points[(i, 0)], points[(i, 1)]);
        let dist = |a: (f64, f64), b: (f64, f64)| {
            let dx = a.0 - b.0;
            let dy = a.1 - b.1;
            (dx * dx + dy * dy).sqrt()
        };

        for i in 0..n {
            for j in (i + 1)..n {
                for k in (j + 1)..n {
                    let dij = dist(p(i), p(j));
                    let dik = dist(p(i), p(k));
                    let djk = dist(p(j), p(k));
                    if dij == 0.0 || dik == 0.0 || djk == 0.0 {
                        continue;
                    }
                    // Identify the vertices opposite d1 >= d2 >= d3.
                    let (d1, d2, d3, ii, jj, kk) = if dij < dik {
                        if dik < djk {
                            (djk, dik, dij, i, j, k)
                        } else if dij < djk {
                            (dik, djk, dij, j, i, k)
                        } else {
                            (dik, dij, djk, j, k, i)
                        }
                    } else {
                        if dij < djk {
                            (djk, dij, dik, i, k, j)
                        } else if dik < djk {
                            (dij, djk, dik, k, i, j)
                        } else {
                            (dij, dik, djk, k, j, i)
                        }
                    };

                    let u = d3 / d2;
                    let v = (d1 - d2) / d3;
                    if d2 < cfg.min_sep || d2 >= cfg.max_sep {
                        continue;
                    }
                    if u < cfg.min_u || u >= max_u {
                        continue;
                    }
                    if v < cfg.min_v || v >= max_v {
                        continue;
                    }

                    let a = p(ii);
                    let b = p(jj);
                    let c = p(kk);
                    let ccw = (b.0 - a.0) * (c.1 - a.1) - (c.0 - a.0) * (b.1 - a.1) >= 0.0;

                    let kr =
                        ((((d2.ln() - log_min) / bin_size).floor()) as usize).min(cfg.nbins - 1);
                    let ku = (((u - cfg.min_u) / ubin).floor() as usize).min(cfg.nubins - 1);
                    let mut kv = (((v - cfg.min_v) / vbin).floor() as usize).min(cfg.nvbins - 1);
                    kv = if ccw {
                        kv + cfg.nvbins
                    } else {
                        cfg.nvbins - kv - 1
                    };

                    let idx = kr * nuv + ku * nvbins2 + kv;
                    grid.ntri[idx] += 1.0;
                    let www = w[i] * w[j] * w[k];
                    grid.weight[idx] += www;
                    if let Some(vals) = values {
                        grid.zeta[idx] += (w[i] * vals[i]) * (w[j] * vals[j]) * (w[k] * vals[k]);
                    }
                }
            }
        }
        grid
    }

    fn scenario_config() -> BinningConfig {
        BinningConfig::builder(0.5, 3.0, 5)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .build()
    }

    #[test]
    fn colinear_triple_lands_in_the_last_u_and_v_bins() {
        // Sides (2, 1, 1): u = 1, v = 1, counter-clockwise by the colinear
        // convention, so the triangle goes to the top u bin and the top
        // positive v bin.
        let points = flat_points(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let weights = vec![1.0; 3];
        let field =
            Field::counts(&points, &weights, CoordSystem::Flat, FieldParams::default()).unwrap();

        let cfg = scenario_config();
        let mut corr = NnnCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();

        let total: f64 = corr.ntri().iter().sum();
        assert_eq!(total, 1.0);

        // kr = 1, ku = 4, kv = 5 + 4 = 9.
        let idx = 1 * (5 * 10) + 4 * 10 + 9;
        assert_eq!(corr.ntri()[idx], 1.0);
        assert_eq!(corr.weight()[idx], 1.0);
        assert_eq!(corr.meand1()[idx], 2.0);
        assert_eq!(corr.meand2()[idx], 1.0);
        assert_eq!(corr.meand3()[idx], 1.0);
        assert_eq!(corr.meanu()[idx], 1.0);
        assert_eq!(corr.meanv()[idx], 1.0);
        assert!((corr.meanlogd1()[idx] - 2.0f64.ln()).abs() < 1e-15);
        assert_eq!(corr.meanlogd2()[idx], 0.0);
    }

    #[test]
    fn equilateral_triple_hits_the_top_u_bin() {
        // d1 = d2 = d3 = 1: u = 1 and v = 0. The canonical emit order for
        // this input runs clockwise, so the triangle lands just below the
        // positive-v half.
        let h = 3.0f64.sqrt() / 2.0;
        let points = flat_points(&[(0.0, 0.0), (1.0, 0.0), (0.5, h)]);
        let weights = vec![1.0; 3];
        let field =
            Field::counts(&points, &weights, CoordSystem::Flat, FieldParams::default()).unwrap();

        let cfg = scenario_config();
        let mut corr = NnnCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();

        let total: f64 = corr.ntri().iter().sum();
        assert_eq!(total, 1.0);

        // kr = 1, ku = nubins-1 = 4, kv = nvbins-1 = 4.
        let idx = 1 * (5 * 10) + 4 * 10 + 4;
        assert_eq!(corr.ntri()[idx], 1.0);
        assert!((corr.meanu()[idx] - 1.0).abs() < 1e-12);
        assert!(corr.meanv()[idx].abs() < 1e-12);
        assert!((corr.meand2()[idx] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn single_point_field_yields_nothing() {
        let points = flat_points(&[(0.4, 0.6)]);
        let field =
            Field::counts(&points, &[1.0], CoordSystem::Flat, FieldParams::default()).unwrap();
        let mut corr = NnnCorr::new(&scenario_config()).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();
        assert!(corr.ntri().iter().all(|&x| x == 0.0));
        assert!(corr.weight().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn exact_maxsep_boundary_is_dropped() {
        // Sides (4, 2, 2): d2 sits exactly on max_sep and must be dropped,
        // but fits once the range is widened.
        let points = flat_points(&[(0.0, 0.0), (2.0, 0.0), (4.0, 0.0)]);
        let weights = vec![1.0; 3];
        let field =
            Field::counts(&points, &weights, CoordSystem::Flat, FieldParams::default()).unwrap();

        let tight = BinningConfig::builder(0.5, 2.0, 4)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .build();
        let mut corr = NnnCorr::new(&tight).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();
        assert!(corr.ntri().iter().all(|&x| x == 0.0));

        let wide = BinningConfig::builder(0.5, 5.0, 4)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .build();
        let mut corr = NnnCorr::new(&wide).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();
        let total: f64 = corr.ntri().iter().sum();
        assert_eq!(total, 1.0);
    }

    fn brute_config() -> BinningConfig {
        BinningConfig::builder(1.0, 50.0, 20)
            .u_range(0.13, 0.89, 10)
            .v_range(0.13, 0.59, 10)
            .bin_slop(0.0)
            .build()
    }

    #[test]
    fn auto_counts_match_brute_force() {
        let (points, weights) = random_flat(40, 8675309, -20.0, 20.0);
        let cfg = brute_config();
        let brute = brute_force_flat(&points, &weights, None, &cfg);

        for max_top in [0, 10] {
            let field = Field::counts(
                &points,
                &weights,
                CoordSystem::Flat,
                FieldParams { max_top },
            )
            .unwrap();
            let mut corr = NnnCorr::new(&cfg).unwrap();
            corr.process_auto(&field, Metric::Euclidean).unwrap();

            assert_eq!(corr.ntri(), brute.ntri.as_slice());
            assert_allclose(corr.weight(), &brute.weight, 1e-10, 1e-14);
        }
    }

    #[test]
    fn scalar_zeta_matches_brute_force() {
        let (points, weights) = random_flat(35, 4242, -15.0, 15.0);
        let mut rng = StdRng::seed_from_u64(99);
        let values: Vec<f64> = (0..35).map(|_| rng.random_range(-2.0..2.0)).collect();

        let cfg = brute_config();
        let brute = brute_force_flat(&points, &weights, Some(&values), &cfg);

        let field = Field::scalars(
            &points,
            &weights,
            &values,
            CoordSystem::Flat,
            FieldParams::default(),
        )
        .unwrap();
        let mut corr = KkkCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();

        assert_eq!(corr.ntri(), brute.ntri.as_slice());
        assert_allclose(corr.weight(), &brute.weight, 1e-10, 1e-14);
        assert_allclose(&corr.zeta().zeta, &brute.zeta, 1e-9, 1e-13);
    }

    #[test]
    fn cross_orderings_each_reproduce_the_auto_counts() {
        let (points, weights) = random_flat(25, 1234, 0.0, 10.0);
        let cfg = BinningConfig::builder(0.01, 30.0, 12)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .build();
        let field = Field::counts(
            &points,
            &weights,
            CoordSystem::Flat,
            FieldParams { max_top: 4 },
        )
        .unwrap();

        let mut auto = NnnCorr::new(&cfg).unwrap();
        auto.process_auto(&field, Metric::Euclidean).unwrap();

        // Each ordering of the full cross gets every triangle exactly once.
        let mut cross: [NnnCorr; 6] = std::array::from_fn(|_| NnnCorr::new(&cfg).unwrap());
        NnnCorr::process_cross(&mut cross, &field, &field, &field, Metric::Euclidean).unwrap();
        for corr in &cross {
            assert_eq!(corr.ntri(), auto.ntri());
            assert_allclose(corr.weight(), auto.weight(), 1e-10, 1e-14);
        }

        // Likewise for the three role assignments of the 1-2 cross.
        let mut cross12: [NnnCorr; 3] = std::array::from_fn(|_| NnnCorr::new(&cfg).unwrap());
        NnnCorr::process_cross12(&mut cross12, &field, &field, Metric::Euclidean).unwrap();
        for corr in &cross12 {
            assert_eq!(corr.ntri(), auto.ntri());
            assert_allclose(corr.weight(), auto.weight(), 1e-10, 1e-14);
        }
    }

    #[test]
    fn all_triangles_are_counted_once_when_everything_is_in_range() {
        let (points, _) = random_flat(30, 777, 0.0, 1.0);
        let weights = vec![1.0; 30];
        let cfg = BinningConfig::builder(1e-6, 4.0, 40).bin_slop(0.0).build();
        let field =
            Field::counts(&points, &weights, CoordSystem::Flat, FieldParams::default()).unwrap();

        let mut corr = NnnCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();

        let total: f64 = corr.ntri().iter().sum();
        // C(30, 3)
        assert_eq!(total, 4060.0);
        let total_w: f64 = corr.weight().iter().sum();
        assert!((total_w - 4060.0).abs() < 1e-9);
    }

    #[test]
    fn results_do_not_depend_on_the_thread_count() {
        let (points, weights) = random_flat(60, 31415, -5.0, 5.0);
        let cfg = BinningConfig::builder(0.05, 20.0, 15)
            .u_range(0.0, 1.0, 8)
            .v_range(0.0, 1.0, 8)
            .bin_slop(0.0)
            .build();
        let field = Field::counts(
            &points,
            &weights,
            CoordSystem::Flat,
            FieldParams { max_top: 5 },
        )
        .unwrap();

        let run = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            pool.install(|| {
                let mut corr = NnnCorr::new(&cfg).unwrap();
                corr.process_auto(&field, Metric::Euclidean).unwrap();
                corr
            })
        };

        let serial = run(1);
        let parallel = run(4);
        // Triangle counts are integer-valued sums and merge order cannot
        // change them.
        assert_eq!(serial.ntri(), parallel.ntri());
        assert_allclose(serial.weight(), parallel.weight(), 1e-12, 1e-15);
        assert_allclose(serial.meand2(), parallel.meand2(), 1e-12, 1e-15);
    }

    fn all_cells<'a>(cell: &'a Cell<CountKind>, out: &mut Vec<&'a Cell<CountKind>>) {
        out.push(cell);
        if let (Some(l), Some(r)) = (cell.left(), cell.right()) {
            all_cells(l, out);
            all_cells(r, out);
        }
    }

    fn leaf_positions(cell: &Cell<CountKind>, out: &mut Vec<DVec3>) {
        if let (Some(l), Some(r)) = (cell.left(), cell.right()) {
            leaf_positions(l, out);
            leaf_positions(r, out);
        } else {
            for _ in 0..cell.count() {
                out.push(cell.pos());
            }
        }
    }

    #[test]
    fn pruned_cell_triples_contain_no_in_range_triangles() {
        let (points, weights) = random_flat(30, 2718, 0.0, 1.0);
        let cfg = BinningConfig::builder(0.2, 1.0, 4)
            .u_range(0.2, 0.9, 4)
            .v_range(0.1, 0.8, 4)
            .build();
        let bin = TriangleBinning::new(&cfg).unwrap();
        let field = Field::counts(
            &points,
            &weights,
            CoordSystem::Flat,
            FieldParams { max_top: 0 },
        )
        .unwrap();

        let mut cells = Vec::new();
        all_cells(&field.top_level()[0], &mut cells);

        let mut rng = StdRng::seed_from_u64(5);
        let mut pruned = 0;
        for _ in 0..400 {
            let ca = cells[rng.random_range(0..cells.len())];
            let cb = cells[rng.random_range(0..cells.len())];
            let cc = cells[rng.random_range(0..cells.len())];

            let d1sq = (cb.pos() - cc.pos()).length_squared();
            let d2sq = (ca.pos() - cc.pos()).length_squared();
            let d3sq = (ca.pos() - cb.pos()).length_squared();

            // Canonicalise exactly as the traversal does.
            let (c1, c2, c3, e1, e2, e3) = if d1sq > d2sq {
                if d2sq > d3sq {
                    (ca, cb, cc, d1sq, d2sq, d3sq)
                } else if d1sq > d3sq {
                    (ca, cc, cb, d1sq, d3sq, d2sq)
                } else {
                    (cc, ca, cb, d3sq, d1sq, d2sq)
                }
            } else {
                if d1sq > d3sq {
                    (cb, ca, cc, d2sq, d1sq, d3sq)
                } else if d2sq > d3sq {
                    (cb, cc, ca, d2sq, d3sq, d1sq)
                } else {
                    (cc, cb, ca, d3sq, d2sq, d1sq)
                }
            };

            if stop111(&bin, e1, e2, e3, c1.size(), c2.size(), c3.size()).is_some() {
                continue;
            }
            pruned += 1;

            let mut pa = Vec::new();
            let mut pb = Vec::new();
            let mut pc = Vec::new();
            leaf_positions(ca, &mut pa);
            leaf_positions(cb, &mut pb);
            leaf_positions(cc, &mut pc);

            for a in &pa {
                for b in &pb {
                    for c in &pc {
                        let mut d = [
                            (*b - *c).length(),
                            (*a - *c).length(),
                            (*a - *b).length(),
                        ];
                        d.sort_by(|x, y| y.partial_cmp(x).unwrap());
                        let (d1, d2, d3) = (d[0], d[1], d[2]);
                        if d3 == 0.0 {
                            // Degenerate; out of range whenever min_u > 0.
                            continue;
                        }
                        let u = d3 / d2;
                        let v = (d1 - d2) / d3;
                        let in_range = d2 >= bin.min_sep
                            && d2 < bin.max_sep
                            && u >= bin.min_u
                            && u < bin.max_u
                            && v >= bin.min_v
                            && v < bin.max_v;
                        assert!(
                            !in_range,
                            "pruned triple contains an in-range triangle: d=({}, {}, {})",
                            d1, d2, d3
                        );
                    }
                }
            }
        }
        // The sampled triples must actually exercise the pruner.
        assert!(pruned > 10);
    }

    #[test]
    fn shear_natural_components_satisfy_the_parseval_identity() {
        let h = 3.0f64.sqrt() / 2.0;
        let points = flat_points(&[(0.0, 0.0), (1.0, 0.0), (0.5, h)]);
        let weights = vec![1.0; 3];
        let g1 = vec![1.0, 0.0, 1.0];
        let g2 = vec![0.0, 1.0, 0.0];
        let field = Field::shears(
            &points,
            &weights,
            &g1,
            &g2,
            CoordSystem::Flat,
            FieldParams::default(),
        )
        .unwrap();

        let mut corr = GggCorr::new(&scenario_config()).unwrap();
        corr.process_auto(&field, Metric::Euclidean).unwrap();

        let idx = corr
            .ntri()
            .iter()
            .position(|&x| x != 0.0)
            .expect("one triangle expected");
        let z = corr.zeta();
        let moduli = [
            z.gam0r[idx] * z.gam0r[idx] + z.gam0i[idx] * z.gam0i[idx],
            z.gam1r[idx] * z.gam1r[idx] + z.gam1i[idx] * z.gam1i[idx],
            z.gam2r[idx] * z.gam2r[idx] + z.gam2i[idx] * z.gam2i[idx],
            z.gam3r[idx] * z.gam3r[idx] + z.gam3i[idx] * z.gam3i[idx],
        ];
        // |g1 g2 g3| = 1, and the projection only rotates phases, so each
        // component keeps unit modulus and the four together carry 4x.
        for m in moduli {
            assert!((m - 1.0).abs() < 1e-10);
        }
        let total: f64 = moduli.iter().sum();
        assert!((total - 4.0).abs() < 1e-10);
    }

    #[test]
    fn arc_middle_side_matches_the_great_circle_distance() {
        // Two points near the pole, one near the equator.
        let radec = [(0.0, 1.50), (1.0, 1.45), (0.3, 0.02)];
        let points = Mat::from_fn(3, 2, |i, j| if j == 0 { radec[i].0 } else { radec[i].1 });
        let weights = vec![1.0; 3];
        let field =
            Field::counts(&points, &weights, CoordSystem::Sphere, FieldParams::default()).unwrap();

        let unit = |ra: f64, dec: f64| {
            DVec3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
        };
        let p: Vec<DVec3> = radec.iter().map(|&(ra, dec)| unit(ra, dec)).collect();
        let mut d = [
            p[0].dot(p[1]).clamp(-1.0, 1.0).acos(),
            p[0].dot(p[2]).clamp(-1.0, 1.0).acos(),
            p[1].dot(p[2]).clamp(-1.0, 1.0).acos(),
        ];
        d.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected_d2 = d[1];

        let cfg = BinningConfig::builder(0.01, 3.5, 8).bin_slop(0.0).build();
        let mut corr = NnnCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Arc).unwrap();

        let total: f64 = corr.ntri().iter().sum();
        assert_eq!(total, 1.0);
        let weight: f64 = corr.weight().iter().sum();
        let meand2: f64 = corr.meand2().iter().sum();
        assert!((meand2 / weight - expected_d2).abs() <= 1e-10 * expected_d2);
    }

    #[test]
    fn periodic_shortest_side_uses_the_wrap() {
        let points = flat_points(&[(0.1, 0.0), (0.9, 0.0), (0.5, 0.0)]);
        let weights = vec![1.0; 3];
        let field =
            Field::counts(&points, &weights, CoordSystem::Flat, FieldParams::default()).unwrap();

        let cfg = BinningConfig::builder(0.05, 0.5, 4)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .period(1.0, 1.0, 1.0)
            .build();
        let mut corr = NnnCorr::new(&cfg).unwrap();
        corr.process_auto(&field, Metric::Periodic).unwrap();

        let total: f64 = corr.ntri().iter().sum();
        assert_eq!(total, 1.0);
        let weight: f64 = corr.weight().iter().sum();
        let meand3: f64 = corr.meand3().iter().sum();
        let meanu: f64 = corr.meanu().iter().sum();
        let meanv: f64 = corr.meanv().iter().sum();
        // The wrapped 0.1 <-> 0.9 separation is 0.2, not 0.8.
        assert!((meand3 / weight - 0.2).abs() < 1e-12);
        assert!((meanu / weight - 0.5).abs() < 1e-12);
        assert!((meanv / weight).abs() < 1e-12);
    }

    #[test]
    fn mixing_coordinate_systems_is_rejected() {
        let flat = Field::counts(
            &flat_points(&[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]),
            &[1.0; 3],
            CoordSystem::Flat,
            FieldParams::default(),
        )
        .unwrap();
        let sphere_points = Mat::from_fn(3, 2, |i, j| 0.1 * (i + j) as f64);
        let sphere = Field::counts(
            &sphere_points,
            &[1.0; 3],
            CoordSystem::Sphere,
            FieldParams::default(),
        )
        .unwrap();

        let mut corr = NnnCorr::new(&scenario_config()).unwrap();
        corr.process_auto(&flat, Metric::Euclidean).unwrap();
        assert!(matches!(
            corr.process_auto(&sphere, Metric::Euclidean),
            Err(CorrError::CoordsMismatch { .. })
        ));

        // clear() unlocks the coordinate system again.
        corr.clear();
        assert_eq!(corr.coords(), None);
        assert!(corr.ntri().iter().all(|&x| x == 0.0));
        corr.process_auto(&sphere, Metric::Euclidean).unwrap();
        assert_eq!(corr.coords(), Some(CoordSystem::Sphere));
    }

    #[test]
    fn cross_variants_require_one_shared_binning() {
        let field = Field::counts(
            &flat_points(&[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]),
            &[1.0; 3],
            CoordSystem::Flat,
            FieldParams::default(),
        )
        .unwrap();

        let other = BinningConfig::builder(0.5, 4.0, 5)
            .u_range(0.0, 1.0, 5)
            .v_range(0.0, 1.0, 5)
            .bin_slop(0.0)
            .build();
        let mut corrs = [
            NnnCorr::new(&scenario_config()).unwrap(),
            NnnCorr::new(&other).unwrap(),
            NnnCorr::new(&scenario_config()).unwrap(),
        ];
        assert!(matches!(
            NnnCorr::process_cross12(&mut corrs, &field, &field, Metric::Euclidean),
            Err(CorrError::BinningMismatch)
        ));
    }

    #[test]
    fn progress_sink_sees_every_top_level_cell() {
        let (points, weights) = random_flat(20, 606, 0.0, 1.0);
        let field = Field::counts(
            &points,
            &weights,
            CoordSystem::Flat,
            FieldParams { max_top: 2 },
        )
        .unwrap();
        let n_top = field.top_level().len();

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let (sink, handle) = closure_sink(64, move |msg| {
            if let ProgressMsg::TopCellProcessed { total, .. } = msg {
                seen.fetch_add(1, Ordering::Relaxed);
                assert_eq!(total, n_top);
            }
        });

        let cfg = BinningConfig::builder(0.01, 2.0, 5).bin_slop(0.0).build();
        let mut corr = NnnCorr::new(&cfg).unwrap().with_progress(sink);
        corr.process_auto(&field, Metric::Euclidean).unwrap();
        drop(corr);
        handle.join().unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), n_top);
    }
}
