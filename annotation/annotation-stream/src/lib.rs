//! Read tab-delimited detection records grouped by frame.
//!
//! An annotation file has a header line followed by one detection per line:
//!
//! ```text
//! frame_no	class_no	xmin	ymin	xmax	ymax
//! 0	1	140.0	50.0	160.0	150.0
//! 0	2	200.0	80.0	230.0	190.0
//! 1	1	141.0	51.0	161.0	151.0
//! ```
//!
//! Rows are sorted by frame number. [AnnotationStream] reads the file lazily
//! and returns one [FrameBatch] per distinct frame number. A batch is complete
//! only once the first row of the following frame (or the end of the file) has
//! been read, so exactly one row is held back between calls.
//!
//! ```rust
//! use annotation_stream::{AnnotationRecord, AnnotationStream};
//!
//! let data = "frame_no\tclass_no\txmin\tymin\txmax\tymax\n\
//!             0\t0\t0\t10\t10\t20\n\
//!             0\t1\t4\t4\t8\t12\n\
//!             2\t0\t1\t11\t11\t21\n";
//! let mut stream = AnnotationStream::<AnnotationRecord, _>::from_reader(data.as_bytes())?;
//!
//! let batch = stream.pull()?.unwrap();
//! assert_eq!(batch.frame_no, 0);
//! assert_eq!(batch.len(), 2);
//! let anchors = stream.current_anchors().unwrap();
//! assert_eq!(anchors.points[0], nalgebra::Point2::new(5.0, 20.0));
//!
//! assert_eq!(stream.pull()?.unwrap().frame_no, 2);
//! assert!(stream.pull()?.is_none());
//! # Ok::<(), annotation_stream::Error>(())
//! ```
#![deny(rust_2018_idioms)]

use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use nalgebra::Point2;

mod record;
pub use record::{AnnotationRecord, Anchors, FrameBatch, FrameRecord, PointRecord};

/// Column names written by [PointWriter].
pub const POINT_COLUMNS: [&str; 4] = ["frame_no", "class_no", "x", "y"];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open annotation file \"{}\"", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read annotation data near line {line}")]
    Read {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("malformed record at line {line}")]
    MalformedRecord {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("frame number decreased at line {line}: frame {found} follows frame {previous}")]
    NonMonotonicFrame { line: u64, previous: u64, found: u64 },
    #[error("annotation stream aborted by an earlier error")]
    Aborted,
    #[error("{classes} class labels but {points} points for frame {frame_no}")]
    RowCountMismatch {
        frame_no: u64,
        classes: usize,
        points: usize,
    },
    #[error("could not write transformed annotation")]
    Write(#[source] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

enum State<S> {
    Open(csv::Reader<S>),
    /// The source ran out. The handle has been released.
    Exhausted,
    /// A read or parse error occurred. The handle has been released.
    Failed,
    Closed,
}

/// Forward-only reader returning one [FrameBatch] per frame number.
///
/// The stream cannot be restarted. Any read or parse error is fatal: after it
/// has been returned, [AnnotationStream::pull] returns [Error::Aborted] and the
/// [Iterator] implementation returns `None`.
pub struct AnnotationStream<R, S = File> {
    state: State<S>,
    /// First row of the next batch.
    pending: Option<R>,
    /// Batch returned by the most recent [AnnotationStream::pull].
    current: Option<FrameBatch<R>>,
    row: csv::StringRecord,
    line: u64,
    records_read: u64,
}

impl<R: FrameRecord> AnnotationStream<R, File> {
    /// Open an annotation file, skip its header and read the first record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fd = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("opened annotation file \"{}\"", path.display());
        Self::from_reader(fd)
    }
}

impl<R: FrameRecord, S: Read> AnnotationStream<R, S> {
    /// Wrap a source, skip its header and read the first record.
    ///
    /// A source with no data rows gives a stream without batches.
    pub fn from_reader(rdr: S) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .quoting(false)
            .trim(csv::Trim::All)
            .from_reader(rdr);
        let mut stream = Self {
            state: State::Open(reader),
            pending: None,
            current: None,
            row: csv::StringRecord::new(),
            line: 0,
            records_read: 0,
        };
        match stream.read_next()? {
            Some(first) => stream.pending = Some(first),
            None => {
                tracing::debug!("annotation source has no records");
                stream.state = State::Exhausted;
            }
        }
        Ok(stream)
    }

    /// Read the next batch and keep it as the current batch.
    ///
    /// Returns `Ok(None)` once the source is exhausted or the stream was
    /// closed.
    pub fn pull(&mut self) -> Result<Option<&FrameBatch<R>>> {
        self.current = None;
        self.current = self.read_batch()?;
        Ok(self.current.as_ref())
    }

    fn read_batch(&mut self) -> Result<Option<FrameBatch<R>>> {
        match self.state {
            State::Failed => return Err(Error::Aborted),
            State::Closed => return Ok(None),
            State::Open(_) | State::Exhausted => {}
        }
        let Some(first) = self.pending.take() else {
            return Ok(None);
        };

        let frame_no = first.frame_no();
        let mut records = vec![first];
        loop {
            match self.read_next()? {
                None => {
                    self.state = State::Exhausted;
                    break;
                }
                Some(record) => {
                    let found = record.frame_no();
                    if found == frame_no {
                        records.push(record);
                    } else if found > frame_no {
                        self.pending = Some(record);
                        break;
                    } else {
                        return Err(self.fail(Error::NonMonotonicFrame {
                            line: self.line,
                            previous: frame_no,
                            found,
                        }));
                    }
                }
            }
        }

        tracing::debug!(frame_no, records = records.len(), "frame batch complete");
        Ok(Some(FrameBatch { frame_no, records }))
    }

    // Read and parse a single data row.
    fn read_next(&mut self) -> Result<Option<R>> {
        let State::Open(reader) = &mut self.state else {
            return Ok(None);
        };
        match reader.read_record(&mut self.row) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(source) => {
                // Undecodable rows (e.g. invalid UTF-8) carry their own
                // position; I/O failures only tell us where we stopped.
                let line = source.position().map(|p| p.line()).unwrap_or(self.line + 1);
                let e = if source.is_io_error() {
                    Error::Read { line, source }
                } else {
                    Error::MalformedRecord { line, source }
                };
                return Err(self.fail(e));
            }
        }
        self.line = self.row.position().map(|p| p.line()).unwrap_or(self.line);
        match self.row.deserialize::<R>(None) {
            Ok(record) => {
                self.records_read += 1;
                tracing::trace!(line = self.line, frame_no = record.frame_no(), "record");
                Ok(Some(record))
            }
            Err(source) => Err(self.fail(Error::MalformedRecord {
                line: self.line,
                source,
            })),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.state = State::Failed;
        self.pending = None;
        e
    }
}

impl<R, S> AnnotationStream<R, S> {
    /// The batch returned by the most recent successful pull.
    pub fn current(&self) -> Option<&FrameBatch<R>> {
        self.current.as_ref()
    }

    /// Number of data rows parsed so far, including the held-back row.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// `true` while the underlying source is still held open.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// Release the underlying source. Calling this again does nothing.
    pub fn close(&mut self) {
        if matches!(self.state, State::Closed) {
            return;
        }
        tracing::debug!(records_read = self.records_read, "closing annotation stream");
        self.state = State::Closed;
        self.pending = None;
    }
}

impl<S> AnnotationStream<AnnotationRecord, S> {
    /// Class labels and anchor points of the current batch.
    ///
    /// Reads the batch returned by the most recent pull and returns `None` if
    /// there is none.
    pub fn current_anchors(&self) -> Option<Anchors> {
        self.current.as_ref().map(FrameBatch::anchors)
    }
}

impl<R: FrameRecord, S: Read> Iterator for AnnotationStream<R, S> {
    type Item = Result<FrameBatch<R>>;
    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, State::Failed) {
            return None;
        }
        self.current = None;
        self.read_batch().transpose()
    }
}

impl<R: FrameRecord, S: Read> std::iter::FusedIterator for AnnotationStream<R, S> {}

/// Write `frame_no, class_no, x, y` rows, tab separated, after a header line.
pub struct PointWriter<W: Write> {
    wtr: csv::Writer<W>,
    rows_written: u64,
}

impl<W: Write> PointWriter<W> {
    /// Create the writer and emit the header line.
    pub fn new(wtr: W) -> Result<Self> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(wtr);
        wtr.write_record(POINT_COLUMNS).map_err(Error::Write)?;
        Ok(Self {
            wtr,
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &PointRecord) -> Result<()> {
        self.wtr.serialize(row).map_err(Error::Write)?;
        self.rows_written += 1;
        Ok(())
    }

    /// Write one row per point of a frame. `class_nos` and `points` are
    /// parallel.
    pub fn write_frame(
        &mut self,
        frame_no: u64,
        class_nos: &[u32],
        points: &[Point2<f64>],
    ) -> Result<()> {
        if class_nos.len() != points.len() {
            return Err(Error::RowCountMismatch {
                frame_no,
                classes: class_nos.len(),
                points: points.len(),
            });
        }
        for (class_no, point) in class_nos.iter().zip(points.iter()) {
            self.write_row(&PointRecord::new(frame_no, *class_no, point))?;
        }
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.wtr
            .flush()
            .map_err(|e| Error::Write(csv::Error::from(e)))
    }

    /// Flush and return the inner writer.
    pub fn into_inner(self) -> Result<W> {
        self.wtr
            .into_inner()
            .map_err(|e| Error::Write(csv::Error::from(e.into_error())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    const HEADER: &str = "frame_no\tclass_no\txmin\tymin\txmax\tymax\n";

    fn stream(body: &str) -> AnnotationStream<AnnotationRecord, std::io::Cursor<Vec<u8>>> {
        let data = format!("{HEADER}{body}");
        AnnotationStream::from_reader(std::io::Cursor::new(data.into_bytes())).unwrap()
    }

    #[test]
    fn groups_by_frame_in_order() {
        let mut s = stream(
            "0\t0\t0\t0\t10\t10\n\
             0\t1\t1\t1\t11\t11\n\
             3\t2\t2\t2\t12\t12\n\
             7\t0\t3\t3\t13\t13\n\
             7\t1\t4\t4\t14\t14\n\
             7\t2\t5\t5\t15\t15\n",
        );
        let mut got = Vec::new();
        while let Some(batch) = s.pull().unwrap() {
            let classes: Vec<u32> = batch.iter().map(|r| r.class_no).collect();
            got.push((batch.frame_no, classes));
        }
        assert_eq!(
            got,
            vec![(0, vec![0, 1]), (3, vec![2]), (7, vec![0, 1, 2])]
        );
        assert!(s.pull().unwrap().is_none());
    }

    #[test]
    fn lookahead_reads_one_record_past_boundary() {
        let mut s = stream(
            "0\t0\t0\t0\t1\t1\n\
             0\t0\t0\t0\t1\t1\n\
             1\t0\t0\t0\t1\t1\n\
             2\t0\t0\t0\t1\t1\n",
        );
        // construction reads the first record
        assert_eq!(s.records_read(), 1);
        assert_eq!(s.pull().unwrap().unwrap().frame_no, 0);
        // both frame 0 rows plus the first row of frame 1
        assert_eq!(s.records_read(), 3);
        assert_eq!(s.pull().unwrap().unwrap().frame_no, 1);
        assert_eq!(s.records_read(), 4);
        assert!(s.is_open());
        assert_eq!(s.pull().unwrap().unwrap().frame_no, 2);
        assert_eq!(s.records_read(), 4);
        assert!(!s.is_open());
        assert!(s.pull().unwrap().is_none());
    }

    #[test]
    fn header_only_source_has_no_batches() {
        let mut s = stream("");
        assert_eq!(s.records_read(), 0);
        assert!(s.pull().unwrap().is_none());
        assert!(s.current_anchors().is_none());
    }

    #[test]
    fn malformed_record_aborts_stream() {
        let mut s = stream(
            "0\t0\t0\t0\t1\t1\n\
             1\tperson\t0\t0\t1\t1\n\
             2\t0\t0\t0\t1\t1\n",
        );
        match s.pull() {
            Err(Error::MalformedRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
        assert!(matches!(s.pull(), Err(Error::Aborted)));
        assert!(s.current().is_none());
    }

    #[test]
    fn malformed_first_record_fails_construction() {
        let data = format!("{HEADER}x\t0\t0\t0\t1\t1\n");
        let result = AnnotationStream::<AnnotationRecord, _>::from_reader(data.as_bytes());
        assert!(matches!(
            result,
            Err(Error::MalformedRecord { line: 2, .. })
        ));
    }

    #[test]
    fn undecodable_row_reports_its_line() {
        let mut data = format!("{HEADER}0\t0\t0\t0\t1\t1\n").into_bytes();
        data.extend_from_slice(b"1\t0\t\xff\xfe\t0\t1\t1\n");
        let mut s = AnnotationStream::<AnnotationRecord, _>::from_reader(data.as_slice()).unwrap();
        match s.pull() {
            Err(Error::MalformedRecord { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected MalformedRecord, got {other:?}"),
        }
        assert!(matches!(s.pull(), Err(Error::Aborted)));
    }

    #[test]
    fn io_failure_reports_next_line() {
        struct Broken(std::io::Cursor<Vec<u8>>);
        impl Read for Broken {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                match self.0.read(buf)? {
                    0 => Err(std::io::Error::other("disk gone")),
                    n => Ok(n),
                }
            }
        }
        let data = format!("{HEADER}0\t0\t0\t0\t1\t1\n").into_bytes();
        let mut s = AnnotationStream::<AnnotationRecord, _>::from_reader(Broken(
            std::io::Cursor::new(data),
        ))
        .unwrap();
        match s.pull() {
            Err(Error::Read { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected Read, got {other:?}"),
        }
    }

    #[test]
    fn negative_frame_number_is_malformed() {
        let data = format!("{HEADER}-1\t0\t0\t0\t1\t1\n");
        let result = AnnotationStream::<AnnotationRecord, _>::from_reader(data.as_bytes());
        assert!(matches!(result, Err(Error::MalformedRecord { .. })));
    }

    #[test]
    fn decreasing_frame_number_is_rejected() {
        let mut s = stream(
            "5\t0\t0\t0\t1\t1\n\
             4\t0\t0\t0\t1\t1\n",
        );
        match s.pull() {
            Err(Error::NonMonotonicFrame {
                line,
                previous,
                found,
            }) => {
                assert_eq!((line, previous, found), (3, 5, 4));
            }
            other => panic!("expected NonMonotonicFrame, got {other:?}"),
        }
    }

    #[test]
    fn current_anchors_follow_last_pull() {
        let mut s = stream(
            "0\t0\t0\t0\t10\t20\n\
             1\t3\t10\t10\t30\t40\n",
        );
        assert!(s.current_anchors().is_none());
        s.pull().unwrap();
        let anchors = s.current_anchors().unwrap();
        assert_eq!(anchors.class_nos, vec![0]);
        assert_eq!(anchors.points, vec![Point2::new(5.0, 20.0)]);
        // calling again reads the same snapshot
        assert_eq!(s.current_anchors().unwrap(), anchors);

        s.pull().unwrap();
        let anchors = s.current_anchors().unwrap();
        assert_eq!(anchors.class_nos, vec![3]);
        assert_eq!(anchors.points, vec![Point2::new(20.0, 40.0)]);
    }

    #[test]
    fn close_twice_is_noop() {
        let mut s = stream("0\t0\t0\t0\t1\t1\n1\t0\t0\t0\t1\t1\n");
        assert!(s.is_open());
        s.close();
        assert!(!s.is_open());
        s.close();
        assert!(s.pull().unwrap().is_none());
    }

    #[test]
    fn iterator_is_fused_after_error() {
        let s = stream(
            "0\t0\t0\t0\t1\t1\n\
             1\t0\t0\t0\t1\t1\n\
             2\t0\t0\tnan?\t1\t1\n\
             3\t0\t0\t0\t1\t1\n",
        );
        let results: Vec<_> = s.collect();
        // frame 1 is never completed because its boundary could not be read
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().frame_no, 0);
        assert!(matches!(results[1], Err(Error::MalformedRecord { line: 4, .. })));
    }

    #[test]
    fn reads_point_records_with_crlf() {
        let data = "frame_no\tclass_no\tx\ty\r\n0\t1\t1.5\t2.5\r\n0\t2\t3\t4\r\n";
        let s = AnnotationStream::<PointRecord, _>::from_reader(data.as_bytes()).unwrap();
        let batches: Vec<_> = s.collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].points(),
            vec![Point2::new(1.5, 2.5), Point2::new(3.0, 4.0)]
        );
    }

    #[test]
    fn point_writer_emits_header_and_rows() {
        let mut w = PointWriter::new(Vec::new()).unwrap();
        w.write_frame(4, &[1, 2], &[Point2::new(0.5, 1.0), Point2::new(-2.0, 3.25)])
            .unwrap();
        assert_eq!(w.rows_written(), 2);
        let buf = String::from_utf8(w.into_inner().unwrap()).unwrap();
        assert_eq!(buf, "frame_no\tclass_no\tx\ty\n4\t1\t0.5\t1.0\n4\t2\t-2.0\t3.25\n");
    }

    #[test]
    fn point_writer_rejects_mismatched_rows() {
        let mut w = PointWriter::new(Vec::new()).unwrap();
        let result = w.write_frame(0, &[1, 2], &[Point2::new(0.0, 0.0)]);
        assert!(matches!(
            result,
            Err(Error::RowCountMismatch {
                classes: 2,
                points: 1,
                ..
            })
        ));
    }

    #[test]
    fn empty_writer_still_has_header() {
        let w = PointWriter::new(Vec::new()).unwrap();
        let buf = String::from_utf8(w.into_inner().unwrap()).unwrap();
        assert_eq!(buf, "frame_no\tclass_no\tx\ty\n");
    }
}
