/////////////////////////////////////////////////////////////////////////////////////////////
//
// Exposes the public API and high-level documentation for three-point correlation functions.
//
// Created on: 18 Jun 2026     Author: Daniel Owen
//
// Copyright (c) 2026, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Fast three-point correlation functions for point catalogs.
//!
//! Measuring the three-point correlation function of a catalog by direct
//! enumeration costs **O(N³)** triangle visits, which is hopeless beyond a
//! few thousand points. This crate implements the dual-tree alternative:
//! each catalog is organised into a ball tree, and a pruned recursion over
//! *triples of tree cells* visits whole blocks of triangles at once,
//! discarding every block that provably cannot reach the binning range and
//! subdividing only until a block fits inside one bin to the requested
//! tolerance. With the usual logarithmic binning this brings the cost to
//! roughly **O(N log³ N)**.
//!
//! Triangles are binned in the (d2, u, v) parameterisation of their side
//! lengths d1 >= d2 >= d3: logarithmically in the middle side d2, and
//! linearly in u = d3/d2 and v = ±(d1-d2)/d3, with the sign of v recording
//! the triangle's winding.
//!
//! # Features
//! - Count (NNN), scalar (KKK), and spin-2 shear (GGG) correlations over
//!   one, two, or three catalogs (auto, 1-2 cross, and full cross variants)
//! - Flat, 3D, and spherical coordinates with Euclidean, great-circle (Arc),
//!   and periodic-box metrics
//! - Shear triangles are projected into the frame of the triangle centroid
//!   before the four natural components are accumulated
//! - Parallel traversal built on [`rayon`], with per-thread shadow
//!   accumulators merged once at the end; the worker count follows the
//!   ambient rayon pool (`RAYON_NUM_THREADS`, or whatever pool the caller
//!   installs)
//! - Catalogs enter as [`faer`](https://docs.rs/faer/latest/faer/) matrices
//!   of positions, one row per point
//!
//! # Example
//!
//! ```
//! use tricorr::{BinningConfig, CoordSystem, Field, FieldParams, Metric, NnnCorr};
//! use faer::Mat;
//!
//! // Three colinear points with unit weights.
//! let mut points = Mat::<f64>::zeros(3, 2);
//! points[(1, 0)] = 1.0;
//! points[(2, 0)] = 2.0;
//! let weights = vec![1.0; 3];
//!
//! let field = Field::counts(&points, &weights, CoordSystem::Flat,
//!                           FieldParams::default()).unwrap();
//!
//! // Bin d2 in [0.5, 3.0) with exact (slop-free) placement.
//! let config = BinningConfig::builder(0.5, 3.0, 5)
//!     .u_range(0.0, 1.0, 5)
//!     .v_range(0.0, 1.0, 5)
//!     .bin_slop(0.0)
//!     .build();
//!
//! let mut nnn = NnnCorr::new(&config).unwrap();
//! nnn.process_auto(&field, Metric::Euclidean).unwrap();
//!
//! // The catalog holds exactly one triangle, with sides (2, 1, 1).
//! let total: f64 = nnn.ntri().iter().sum();
//! assert_eq!(total, 1.0);
//! ```
//!
//! # References
//! 1.  M. Jarvis, G. Bernstein, and B. Jain. The skewness of the aperture mass
//!     statistic. MNRAS, 352(1):338-352, 2004.
//! 2.  P. Schneider and M. Lombardi. The three-point correlation function of
//!     cosmic shear: I. The natural components. A&A, 397:809-818, 2003.
//! 3.  W. B. March, A. G. Gray. Multi-tree algorithms for computing three-point
//!     correlation functions. SDM workshop on high-performance analytics, 2012.

mod binning;

mod corr3;

mod field;

mod kinds;

mod metric;

pub mod progress;

pub use {
    binning::{BinningConfig, BinningConfigBuilder},
    corr3::{Corr3, CorrError, GggCorr, KkkCorr, NnnCorr},
    field::{Cell, Field, FieldParams},
    kinds::{
        CountKind, FieldKind, NoZeta, ScalarKind, ScalarZeta, ShearKind, ShearZeta, ZetaStore,
    },
    metric::{CoordSystem, Metric, MetricAdapter},
};
