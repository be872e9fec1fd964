//! Glue between the annotation stream, the homography engine and the image
//! warp, as used by the `perspective-transform` binary.
#![deny(rust_2018_idioms)]

use std::io::{Read, Write};

use camino::Utf8Path;
use eyre::{Context, Result};
use image::Rgb;
use serde::Serialize;

use annotation_stream::{AnnotationRecord, AnnotationStream, PointWriter};
use perspective_warp::{PerspectiveWarp, WarpOptions};
use planar_homography::{HomographyEngine, HomographyMatrix};

/// Load both marker files and estimate the homography.
pub fn load_engine(pixel_markers: &Utf8Path, world_markers: &Utf8Path) -> Result<HomographyEngine> {
    let mut engine = HomographyEngine::from_marker_files(pixel_markers, world_markers)
        .with_context(|| format!("loading markers {pixel_markers} and {world_markers}"))?;
    engine
        .estimate()
        .with_context(|| format!("estimating homography from {pixel_markers} and {world_markers}"))?;
    Ok(engine)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub frames: u64,
    pub records: u64,
}

/// Transform the anchor point of every detection and write the world points
/// as a tab-separated table to `out`.
///
/// The stream is closed when this returns successfully.
pub fn transform_annotations<S: Read, W: Write>(
    stream: &mut AnnotationStream<AnnotationRecord, S>,
    engine: &HomographyEngine,
    out: W,
) -> Result<TransformSummary> {
    let mut wtr = PointWriter::new(out)?;
    let mut summary = TransformSummary::default();
    while let Some(batch) = stream.pull()? {
        let frame_no = batch.frame_no;
        let anchors = batch.anchors();
        let world = engine
            .transform(&anchors.points)
            .with_context(|| format!("transforming frame {frame_no}"))?;
        wtr.write_frame(frame_no, &anchors.class_nos, &world)?;
        summary.frames += 1;
        summary.records += world.len() as u64;
        tracing::trace!(frame_no, n = world.len(), "transformed frame");
    }
    wtr.flush()?;
    stream.close();
    Ok(summary)
}

/// Like [transform_annotations], reading from the file at `annotations`.
pub fn transform_annotations_path<W: Write>(
    annotations: &Utf8Path,
    engine: &HomographyEngine,
    out: W,
) -> Result<TransformSummary> {
    let mut stream = AnnotationStream::<AnnotationRecord>::open(annotations)?;
    let summary = transform_annotations(&mut stream, engine, out)
        .with_context(|| format!("transforming annotations in {annotations}"))?;
    tracing::info!(
        "transformed {} detections in {} frames from {annotations}",
        summary.records,
        summary.frames
    );
    Ok(summary)
}

/// Warp the image at `input` into plan view and save it to `output`.
///
/// The output format follows the extension of `output`.
pub fn warp_image(
    engine: &HomographyEngine,
    input: &Utf8Path,
    output: &Utf8Path,
    width: u32,
    height: u32,
    options: WarpOptions,
) -> Result<()> {
    let src = image::open(input)
        .with_context(|| format!("reading image {input}"))?
        .into_rgb8();
    let warper = PerspectiveWarp::<Rgb<u8>>::new(options);
    let warped = engine
        .transform_image(&warper, &src, width, height)
        .with_context(|| format!("warping {input} to {width}x{height}"))?;
    warped
        .save(output)
        .with_context(|| format!("saving image {output}"))?;
    tracing::info!("saved {width}x{height} plan view to {output}");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkerFit {
    pub index: usize,
    pub pixel: [f64; 2],
    pub world: [f64; 2],
    pub reprojection_error: f64,
}

/// The estimated matrix along with how well it reproduces each marker.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixReport {
    pub matrix: HomographyMatrix,
    pub markers: Vec<MarkerFit>,
}

pub fn matrix_report(engine: &HomographyEngine) -> Result<MatrixReport> {
    let matrix = *engine.matrix()?;
    let pixel = engine.pixel_points();
    let world = engine.world_points();
    let errors = matrix.reprojection_errors(pixel, world)?;
    let markers = pixel
        .iter()
        .zip(world.iter())
        .zip(errors)
        .enumerate()
        .map(|(index, ((p, w), reprojection_error))| MarkerFit {
            index,
            pixel: [p.x, p.y],
            world: [w.x, w.y],
            reprojection_error,
        })
        .collect();
    Ok(MatrixReport { matrix, markers })
}
