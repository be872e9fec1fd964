use nalgebra::Point2;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A row of an annotation file which belongs to a single video frame.
///
/// Rows are deserialized positionally, so the field order of the implementing
/// type must match the column order of the file.
pub trait FrameRecord: DeserializeOwned {
    /// The frame this row belongs to.
    fn frame_no(&self) -> u64;
}

/// One detection in pixel coordinates.
///
/// Columns: `frame_no, class_no, xmin, ymin, xmax, ymax`. Box corners are not
/// validated; an inverted box passes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub frame_no: u64,
    pub class_no: u32,
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl AnnotationRecord {
    /// Bottom-center of the bounding box, where the object touches the ground.
    pub fn anchor(&self) -> Point2<f64> {
        Point2::new((self.xmin + self.xmax) / 2.0, self.ymax)
    }

    /// `true` if `xmin <= xmax` and `ymin <= ymax`.
    pub fn is_well_formed(&self) -> bool {
        self.xmin <= self.xmax && self.ymin <= self.ymax
    }
}

impl FrameRecord for AnnotationRecord {
    fn frame_no(&self) -> u64 {
        self.frame_no
    }
}

/// One detection reduced to a single point, typically in world coordinates.
///
/// Columns: `frame_no, class_no, x, y`. This is the row type written by
/// [crate::PointWriter].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub frame_no: u64,
    pub class_no: u32,
    pub x: f64,
    pub y: f64,
}

impl PointRecord {
    pub fn new(frame_no: u64, class_no: u32, point: &Point2<f64>) -> Self {
        Self {
            frame_no,
            class_no,
            x: point.x,
            y: point.y,
        }
    }

    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

impl FrameRecord for PointRecord {
    fn frame_no(&self) -> u64 {
        self.frame_no
    }
}

/// All rows sharing one frame number, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch<R> {
    pub frame_no: u64,
    pub records: Vec<R>,
}

impl<R> FrameBatch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.records.iter()
    }
}

impl FrameBatch<AnnotationRecord> {
    /// Class labels and anchor points of every record, in record order.
    pub fn anchors(&self) -> Anchors {
        let mut anchors = Anchors {
            class_nos: Vec::with_capacity(self.records.len()),
            points: Vec::with_capacity(self.records.len()),
        };
        for record in self.records.iter() {
            if !record.is_well_formed() {
                tracing::warn!(
                    frame_no = record.frame_no,
                    "inverted bounding box ({}, {}, {}, {})",
                    record.xmin,
                    record.ymin,
                    record.xmax,
                    record.ymax
                );
            }
            anchors.class_nos.push(record.class_no);
            anchors.points.push(record.anchor());
        }
        anchors
    }
}

impl FrameBatch<PointRecord> {
    pub fn points(&self) -> Vec<Point2<f64>> {
        self.records.iter().map(PointRecord::point).collect()
    }
}

impl<'a, R> IntoIterator for &'a FrameBatch<R> {
    type Item = &'a R;
    type IntoIter = std::slice::Iter<'a, R>;
    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Parallel sequences of class labels and anchor points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Anchors {
    pub class_nos: Vec<u32>,
    pub points: Vec<Point2<f64>>,
}

impl Anchors {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(frame_no: u64, class_no: u32, bbox: [f64; 4]) -> AnnotationRecord {
        AnnotationRecord {
            frame_no,
            class_no,
            xmin: bbox[0],
            ymin: bbox[1],
            xmax: bbox[2],
            ymax: bbox[3],
        }
    }

    #[test]
    fn anchor_is_bottom_center() {
        let batch = FrameBatch {
            frame_no: 0,
            records: vec![rec(0, 0, [0.0, 10.0, 10.0, 20.0])],
        };
        let anchors = batch.anchors();
        assert_eq!(anchors.class_nos, vec![0]);
        assert_eq!(anchors.points, vec![Point2::new(5.0, 20.0)]);
    }

    #[test]
    fn anchors_keep_record_order() {
        let batch = FrameBatch {
            frame_no: 3,
            records: vec![
                rec(3, 2, [10.0, 0.0, 20.0, 5.0]),
                rec(3, 0, [0.0, 0.0, 2.0, 8.0]),
                rec(3, 4, [-4.0, 1.0, 4.0, 1.5]),
            ],
        };
        let anchors = batch.anchors();
        assert_eq!(anchors.len(), 3);
        assert_eq!(anchors.class_nos, vec![2, 0, 4]);
        assert_eq!(
            anchors.points,
            vec![
                Point2::new(15.0, 5.0),
                Point2::new(1.0, 8.0),
                Point2::new(0.0, 1.5)
            ]
        );
    }

    #[test]
    fn inverted_box_passes_through() {
        let r = rec(1, 1, [10.0, 20.0, 0.0, 5.0]);
        assert!(!r.is_well_formed());
        assert_eq!(r.anchor(), Point2::new(5.0, 5.0));
    }
}
