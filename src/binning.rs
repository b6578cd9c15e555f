/////////////////////////////////////////////////////////////////////////////////////////////
//
// Declares the triangle binning configuration and the derived binning descriptor.
//
// Created on: 18 Jun 2026     Author: Daniel Owen
//
// Copyright (c) 2026, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::corr3::CorrError;

/// Binning of triangles over (d2, u, v).
///
/// Triangles with sides d1 >= d2 >= d3 are binned logarithmically in the
/// middle side d2 over `[min_sep, max_sep)`, and linearly in the shape
/// ratios u = d3/d2 over `[min_u, max_u)` and v = (d1-d2)/d3 over
/// `[-max_v, -min_v) ∪ [min_v, max_v)`. The v axis is doubled so the sign
/// (triangle winding) is kept.
///
/// `bin_slop` scales how far a cell pair may blur across a bin edge before
/// the traversal refines it: the per-axis tolerances are
/// `b = bin_size * bin_slop`, `bu = ubin_size * bin_slop`, and
/// `bv = vbin_size * bin_slop`. A slop of zero forces the traversal all the
/// way to the leaves (exact binning).
///
/// Instances are created through [`BinningConfig::builder`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinningConfig {
    /// Smallest d2 separation included (exclusive upper edge is `max_sep`).
    pub min_sep: f64,

    /// Largest d2 separation (excluded).
    pub max_sep: f64,

    /// Number of logarithmic bins between `min_sep` and `max_sep`.
    pub nbins: usize,

    /// Lower edge of the u axis.
    pub min_u: f64,

    /// Upper edge of the u axis (at most 1).
    pub max_u: f64,

    /// Number of linear bins in u.
    pub nubins: usize,

    /// Lower edge of the |v| axis.
    pub min_v: f64,

    /// Upper edge of the |v| axis (at most 1).
    pub max_v: f64,

    /// Number of linear bins in |v| (the stored axis has twice this many,
    /// to keep both windings).
    pub nvbins: usize,

    /// Fractional blur allowed on each axis before a cell must be split.
    pub bin_slop: f64,

    /// Box periods (x, y, z) for the Periodic metric; unused otherwise.
    pub period: [f64; 3],
}

impl BinningConfig {
    /// Returns a new [`BinningConfigBuilder`] for the given d2 axis.
    pub fn builder(min_sep: f64, max_sep: f64, nbins: usize) -> BinningConfigBuilder {
        BinningConfigBuilder::new(min_sep, max_sep, nbins)
    }

    /// Width of one logarithmic d2 bin.
    pub fn bin_size(&self) -> f64 {
        (self.max_sep / self.min_sep).ln() / self.nbins as f64
    }

    /// Total number of (d2, u, v) bins, with the doubled v axis.
    pub fn ntot(&self) -> usize {
        self.nbins * self.nubins * 2 * self.nvbins
    }
}

/// A convenience builder for constructing a [`BinningConfig`] instance.
///
/// The builder should be called via the [`BinningConfig::builder`] method.
///
/// See [`BinningConfig`] for details on each field.
#[derive(Debug, Clone)]
pub struct BinningConfigBuilder {
    min_sep: f64,
    max_sep: f64,
    nbins: usize,
    u_range: Option<(f64, f64, usize)>,
    v_range: Option<(f64, f64, usize)>,
    bin_slop: f64,
    period: [f64; 3],
}

impl BinningConfigBuilder {
    fn new(min_sep: f64, max_sep: f64, nbins: usize) -> Self {
        Self {
            min_sep,
            max_sep,
            nbins,
            u_range: None,
            v_range: None,
            bin_slop: 1.0,
            period: [0.0; 3],
        }
    }

    /// Sets the u axis range and bin count.
    pub fn u_range(mut self, min_u: f64, max_u: f64, nubins: usize) -> Self {
        self.u_range = Some((min_u, max_u, nubins));
        self
    }

    /// Sets the |v| axis range and bin count.
    pub fn v_range(mut self, min_v: f64, max_v: f64, nvbins: usize) -> Self {
        self.v_range = Some((min_v, max_v, nvbins));
        self
    }

    /// Sets the bin slop (default 1.0).
    pub fn bin_slop(mut self, bin_slop: f64) -> Self {
        self.bin_slop = bin_slop;
        self
    }

    /// Sets the box periods used by the Periodic metric.
    pub fn period(mut self, xp: f64, yp: f64, zp: f64) -> Self {
        self.period = [xp, yp, zp];
        self
    }

    /// Builds the configuration. When the u or v axis was not given, it
    /// covers the full range with bins matching the d2 bin width.
    pub fn build(self) -> BinningConfig {
        let bin_size = if self.min_sep > 0.0 && self.max_sep > self.min_sep && self.nbins > 0 {
            (self.max_sep / self.min_sep).ln() / self.nbins as f64
        } else {
            // Invalid d2 axes are caught when the descriptor is derived;
            // keep the default bin counts finite in the meantime.
            1.0
        };
        let default_bins = |lo: f64, hi: f64| ((hi - lo) / bin_size).ceil().max(1.0) as usize;

        let (min_u, max_u, nubins) = self.u_range.unwrap_or((0.0, 1.0, default_bins(0.0, 1.0)));
        let (min_v, max_v, nvbins) = self.v_range.unwrap_or((0.0, 1.0, default_bins(0.0, 1.0)));

        BinningConfig {
            min_sep: self.min_sep,
            max_sep: self.max_sep,
            nbins: self.nbins,
            min_u,
            max_u,
            nubins,
            min_v,
            max_v,
            nvbins,
            bin_slop: self.bin_slop,
            period: self.period,
        }
    }
}

/// Immutable binning descriptor with every derived constant the pruner,
/// splitter, and emit site consume.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TriangleBinning {
    pub min_sep: f64,
    pub max_sep: f64,
    pub nbins: usize,
    pub bin_size: f64,
    pub b: f64,

    pub min_u: f64,
    pub max_u: f64,
    pub nubins: usize,
    pub ubin_size: f64,
    pub bu: f64,

    pub min_v: f64,
    pub max_v: f64,
    pub nvbins: usize,
    pub vbin_size: f64,
    pub bv: f64,

    pub log_min_sep: f64,
    pub half_min_sep: f64,
    pub half_min_d3: f64,
    pub min_sep_sq: f64,
    pub max_sep_sq: f64,
    pub min_u_sq: f64,
    pub max_u_sq: f64,
    pub min_v_sq: f64,
    #[allow(dead_code)]
    pub max_v_sq: f64,
    #[allow(dead_code)]
    // b_sq, max_v_sq, and sqrt_two_bv are not consumed by the current prune
    // and split checks, but belong with the other derived tolerances.
    pub b_sq: f64,
    pub bu_sq: f64,
    pub bv_sq: f64,
    #[allow(dead_code)]
    pub sqrt_two_bv: f64,

    pub nvbins2: usize,
    pub nuv: usize,
    pub ntot: usize,

    pub period: DVec3,
}

impl TriangleBinning {
    pub fn new(config: &BinningConfig) -> Result<Self, CorrError> {
        let invalid = |reason: &str| CorrError::InvalidBinning {
            reason: reason.to_string(),
        };

        if !(config.min_sep > 0.0) || !(config.max_sep > config.min_sep) {
            return Err(invalid("need 0 < min_sep < max_sep"));
        }
        if config.nbins == 0 || config.nubins == 0 || config.nvbins == 0 {
            return Err(invalid("bin counts must be at least 1"));
        }
        if !(config.min_u >= 0.0 && config.min_u < config.max_u && config.max_u <= 1.0) {
            return Err(invalid("need 0 <= min_u < max_u <= 1"));
        }
        if !(config.min_v >= 0.0 && config.min_v < config.max_v && config.max_v <= 1.0) {
            return Err(invalid("need 0 <= min_v < max_v <= 1"));
        }
        if !(config.bin_slop >= 0.0) {
            return Err(invalid("bin_slop must be non-negative"));
        }

        // Degenerate triangles have v = 1 exactly and equilateral ones
        // u = 1 exactly; widen a full-range top edge so those land in the
        // last bin instead of falling off it.
        let max_u = if config.max_u == 1.0 { 1.0 + 1e-10 } else { config.max_u };
        let max_v = if config.max_v == 1.0 { 1.0 + 1e-10 } else { config.max_v };

        let bin_size = (config.max_sep / config.min_sep).ln() / config.nbins as f64;
        let ubin_size = (config.max_u - config.min_u) / config.nubins as f64;
        let vbin_size = (config.max_v - config.min_v) / config.nvbins as f64;
        let b = bin_size * config.bin_slop;
        let bu = ubin_size * config.bin_slop;
        let bv = vbin_size * config.bin_slop;

        let nvbins2 = config.nvbins * 2;
        let nuv = config.nubins * nvbins2;

        Ok(TriangleBinning {
            min_sep: config.min_sep,
            max_sep: config.max_sep,
            nbins: config.nbins,
            bin_size,
            b,
            min_u: config.min_u,
            max_u,
            nubins: config.nubins,
            ubin_size,
            bu,
            min_v: config.min_v,
            max_v,
            nvbins: config.nvbins,
            vbin_size,
            bv,
            log_min_sep: config.min_sep.ln(),
            half_min_sep: 0.5 * config.min_sep,
            half_min_d3: 0.5 * config.min_sep * config.min_u,
            min_sep_sq: config.min_sep * config.min_sep,
            max_sep_sq: config.max_sep * config.max_sep,
            min_u_sq: config.min_u * config.min_u,
            max_u_sq: max_u * max_u,
            min_v_sq: config.min_v * config.min_v,
            max_v_sq: max_v * max_v,
            b_sq: b * b,
            bu_sq: bu * bu,
            bv_sq: bv * bv,
            sqrt_two_bv: (2.0 * bv).sqrt(),
            nvbins2,
            nuv,
            ntot: config.nbins * nuv,
            period: DVec3::new(config.period[0], config.period[1], config.period[2]),
        })
    }

    /// Flat index of the (d2, u, signed-v) bin triple.
    #[inline]
    pub fn flat_index(&self, kr: usize, ku: usize, kv: usize) -> usize {
        kr * self.nuv + ku * self.nvbins2 + kv
    }
}
