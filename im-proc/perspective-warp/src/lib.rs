//! Resample 8-bit images through a [HomographyMatrix].
//!
//! Every output pixel `(x, y)` is filled by projecting it through the inverse
//! homography into the source image and sampling there, using
//! [imageproc::geometric_transformations]. Output pixels whose source location
//! lies outside the input image get [WarpOptions::fill].
#![deny(rust_2018_idioms)]

use std::marker::PhantomData;

use image::{ImageBuffer, Pixel};
use imageproc::geometric_transformations::{self as geom, Projection};
use serde::{Deserialize, Serialize};

use planar_homography::{HomographyMatrix, ImageWarp};

#[derive(thiserror::Error, Debug)]
pub enum WarpError {
    #[error("homography cannot be inverted")]
    NotInvertible(#[source] planar_homography::Error),
    #[error("homography cannot be represented in single precision")]
    Precision,
    #[error("cannot warp into an empty {width}x{height} image")]
    EmptyTarget { width: u32, height: u32 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl From<Interpolation> for geom::Interpolation {
    fn from(interpolation: Interpolation) -> Self {
        match interpolation {
            Interpolation::Nearest => geom::Interpolation::Nearest,
            Interpolation::Bilinear => geom::Interpolation::Bilinear,
            Interpolation::Bicubic => geom::Interpolation::Bicubic,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpOptions {
    pub interpolation: Interpolation,
    /// Value of every channel outside the source image.
    pub fill: u8,
}

/// [ImageWarp] for [ImageBuffer]s with `u8` channels.
#[derive(Debug, Clone, Copy)]
pub struct PerspectiveWarp<P> {
    options: WarpOptions,
    pixel: PhantomData<fn() -> P>,
}

impl<P> Default for PerspectiveWarp<P> {
    fn default() -> Self {
        Self::new(WarpOptions::default())
    }
}

impl<P> PerspectiveWarp<P> {
    pub fn new(options: WarpOptions) -> Self {
        Self {
            options,
            pixel: PhantomData,
        }
    }

    pub fn options(&self) -> &WarpOptions {
        &self.options
    }
}

// Row-major single precision matrix, as taken by [Projection::from_matrix].
fn projection(matrix: &HomographyMatrix) -> Result<Projection, WarpError> {
    let rows = matrix.rows();
    let mut m = [0.0f32; 9];
    for (dst, src) in m.iter_mut().zip(rows.iter().flatten()) {
        *dst = *src as f32;
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(WarpError::Precision);
    }
    Projection::from_matrix(m).ok_or(WarpError::Precision)
}

impl<P> ImageWarp for PerspectiveWarp<P>
where
    P: Pixel<Subpixel = u8> + Send + Sync,
{
    type Image = ImageBuffer<P, Vec<u8>>;
    type Error = WarpError;

    fn warp(
        &self,
        image: &Self::Image,
        matrix: &HomographyMatrix,
        width: u32,
        height: u32,
    ) -> Result<Self::Image, Self::Error> {
        if width == 0 || height == 0 {
            return Err(WarpError::EmptyTarget { width, height });
        }
        matrix.inverse().map_err(WarpError::NotInvertible)?;
        let projection = projection(matrix)?;

        let channels = vec![self.options.fill; usize::from(P::CHANNEL_COUNT)];
        let fill = *P::from_slice(&channels);
        tracing::debug!(
            src_width = image.width(),
            src_height = image.height(),
            width,
            height,
            interpolation = ?self.options.interpolation,
            "warping image"
        );
        let mut out = ImageBuffer::new(width, height);
        geom::warp_into(
            image,
            &projection,
            self.options.interpolation.into(),
            fill,
            &mut out,
        );
        Ok(out)
    }

    fn dimensions(image: &Self::Image) -> (u32, u32) {
        image.dimensions()
    }
}
