use std::{fs::File, io::Read, path::Path};

use nalgebra::Point2;
use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct MarkerRow {
    x: f64,
    y: f64,
}

/// Read marker coordinates from a tab-delimited source with a header line.
///
/// Each row holds `x` and `y` in its first two columns; further columns are
/// not read. Row order is preserved, as it pairs pixel and world markers.
pub fn read_markers<R: Read>(rdr: R) -> Result<Vec<Point2<f64>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .quoting(false)
        .from_reader(rdr);

    let mut markers = Vec::new();
    let mut row = csv::StringRecord::new();
    while rdr.read_record(&mut row).map_err(Error::ReadMarkers)? {
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        let xy: csv::StringRecord = row.iter().take(2).collect();
        let marker: MarkerRow = xy
            .deserialize(None)
            .map_err(|source| Error::MalformedMarker { line, source })?;
        markers.push(Point2::new(marker.x, marker.y));
    }
    Ok(markers)
}

/// Read marker coordinates from a file. See [read_markers].
pub fn read_markers_path<P: AsRef<Path>>(path: P) -> Result<Vec<Point2<f64>>> {
    let path = path.as_ref();
    let fd = File::open(path).map_err(|source| Error::OpenMarkers {
        path: path.to_path_buf(),
        source,
    })?;
    let markers = read_markers(fd)?;
    tracing::debug!("read {} markers from \"{}\"", markers.len(), path.display());
    Ok(markers)
}
