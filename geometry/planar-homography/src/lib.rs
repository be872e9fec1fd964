//! Planar homography between the image plane and a world (plan view) plane.
//!
//! A [HomographyEngine] holds two ordered lists of markers, one in pixel
//! coordinates and one in world coordinates, where `pixel[i]` and `world[i]`
//! are the same physical location. [HomographyEngine::estimate] computes the
//! 3x3 [HomographyMatrix] relating them, after which points and images can be
//! transformed.
//!
//! ```rust
//! use nalgebra::Point2;
//! use planar_homography::HomographyEngine;
//!
//! let pixel = vec![
//!     Point2::new(0.0, 0.0),
//!     Point2::new(1.0, 0.0),
//!     Point2::new(1.0, 1.0),
//!     Point2::new(0.0, 1.0),
//! ];
//! let world: Vec<_> = pixel.iter().map(|p| Point2::from(p.coords * 2.0)).collect();
//!
//! let mut engine = HomographyEngine::with_markers(pixel, world);
//! engine.estimate()?;
//!
//! let out = engine.transform(&[Point2::new(0.5, 0.5)])?;
//! assert!((out[0] - Point2::new(1.0, 1.0)).norm() < 1e-6);
//! # Ok::<(), planar_homography::Error>(())
//! ```
//!
//! Image warping is delegated to an implementation of [ImageWarp].
#![deny(rust_2018_idioms)]

use std::path::{Path, PathBuf};

use nalgebra::Point2;

mod markers;
mod matrix;

pub use markers::{read_markers, read_markers_path};
pub use matrix::{
    Degeneracy, EstimateOptions, HomographyMatrix, MIN_CORRESPONDENCES, PROJECTION_EPSILON,
    PointSpace,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("homography has not been estimated")]
    NotEstimated,
    #[error("{got} correspondences given, at least {required} required")]
    InsufficientCorrespondences { got: usize, required: usize },
    #[error("{pixel} pixel markers but {world} world markers")]
    CorrespondenceLengthMismatch { pixel: usize, world: usize },
    #[error("degenerate correspondences: {0}")]
    DegenerateCorrespondence(Degeneracy),
    #[error("could not open marker file \"{}\"", path.display())]
    OpenMarkers {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read markers")]
    ReadMarkers(#[source] csv::Error),
    #[error("malformed marker at line {line}")]
    MalformedMarker {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("image warp failed")]
    Warp(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("image warp returned {got:?} image, expected {expected:?}")]
    WarpSizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resample a raster through a homography.
///
/// Implementations produce an image of exactly `width` x `height` pixels in
/// which the pixel at `(x, y)` shows the source location that `matrix` maps
/// onto `(x, y)`.
pub trait ImageWarp {
    type Image;
    type Error: std::error::Error + Send + Sync + 'static;

    fn warp(
        &self,
        image: &Self::Image,
        matrix: &HomographyMatrix,
        width: u32,
        height: u32,
    ) -> std::result::Result<Self::Image, Self::Error>;

    /// Width and height of `image`.
    fn dimensions(image: &Self::Image) -> (u32, u32);
}

/// Estimates and applies one pixel-to-world homography.
///
/// The matrix is replaced, never modified, by a later successful
/// [HomographyEngine::estimate]. A failed estimate leaves the previous matrix
/// in place.
#[derive(Debug, Clone, Default)]
pub struct HomographyEngine {
    pixel_points: Vec<Point2<f64>>,
    world_points: Vec<Point2<f64>>,
    options: EstimateOptions,
    matrix: Option<HomographyMatrix>,
}

impl HomographyEngine {
    /// An engine with no markers. Use [HomographyEngine::estimate_from].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_markers(pixel_points: Vec<Point2<f64>>, world_points: Vec<Point2<f64>>) -> Self {
        Self {
            pixel_points,
            world_points,
            ..Default::default()
        }
    }

    /// Load pixel and world markers from two tab-delimited files.
    pub fn from_marker_files<P1, P2>(pixel_path: P1, world_path: P2) -> Result<Self>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        let pixel_points = read_markers_path(pixel_path)?;
        let world_points = read_markers_path(world_path)?;
        Ok(Self::with_markers(pixel_points, world_points))
    }

    pub fn with_options(mut self, options: EstimateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn pixel_points(&self) -> &[Point2<f64>] {
        &self.pixel_points
    }

    pub fn world_points(&self) -> &[Point2<f64>] {
        &self.world_points
    }

    /// Estimate the homography from the stored markers.
    pub fn estimate(&mut self) -> Result<&HomographyMatrix> {
        let h = HomographyMatrix::estimate_with(
            &self.pixel_points,
            &self.world_points,
            &self.options,
        )?;
        self.log_fit(&h, &self.pixel_points, &self.world_points);
        Ok(self.matrix.insert(h))
    }

    /// Estimate the homography from the given correspondences. The stored
    /// markers are not changed.
    pub fn estimate_from(
        &mut self,
        pixel_points: &[Point2<f64>],
        world_points: &[Point2<f64>],
    ) -> Result<&HomographyMatrix> {
        let h = HomographyMatrix::estimate_with(pixel_points, world_points, &self.options)?;
        self.log_fit(&h, pixel_points, world_points);
        Ok(self.matrix.insert(h))
    }

    fn log_fit(&self, h: &HomographyMatrix, pixel: &[Point2<f64>], world: &[Point2<f64>]) {
        if let Ok(errors) = h.reprojection_errors(pixel, world) {
            let max = errors.iter().copied().fold(0.0, f64::max);
            tracing::debug!(
                n_markers = pixel.len(),
                max_reprojection_error = max,
                "estimated homography"
            );
        }
    }

    pub fn is_estimated(&self) -> bool {
        self.matrix.is_some()
    }

    pub fn matrix(&self) -> Result<&HomographyMatrix> {
        self.matrix.as_ref().ok_or(Error::NotEstimated)
    }

    /// Map pixel points to world points, in order.
    pub fn transform(&self, points: &[Point2<f64>]) -> Result<Vec<Point2<f64>>> {
        Ok(self.matrix()?.project_all(points))
    }

    /// Map world points back to pixel points, in order.
    pub fn inverse_transform(&self, points: &[Point2<f64>]) -> Result<Vec<Point2<f64>>> {
        Ok(self.matrix()?.inverse()?.project_all(points))
    }

    /// Warp `image` into world coordinates with a `width` x `height` result.
    pub fn transform_image<W: ImageWarp>(
        &self,
        warper: &W,
        image: &W::Image,
        width: u32,
        height: u32,
    ) -> Result<W::Image> {
        let matrix = self.matrix()?;
        let warped = warper
            .warp(image, matrix, width, height)
            .map_err(|e| Error::Warp(Box::new(e)))?;
        let got = W::dimensions(&warped);
        if got != (width, height) {
            return Err(Error::WarpSizeMismatch {
                expected: (width, height),
                got,
            });
        }
        Ok(warped)
    }
}
