use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Similarity2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Added to the homogeneous scale before the perspective divide so that
/// points mapped to infinity do not divide by zero.
pub const PROJECTION_EPSILON: f64 = 1e-8;

/// Fewest point pairs which determine a homography.
pub const MIN_CORRESPONDENCES: usize = 4;

/// Which side of the correspondences a marker index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointSpace {
    Pixel,
    World,
}

impl std::fmt::Display for PointSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointSpace::Pixel => write!(f, "pixel"),
            PointSpace::World => write!(f, "world"),
        }
    }
}

/// Why a set of correspondences does not determine a homography.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degeneracy {
    /// Three of the four markers lie on a line (or coincide).
    Collinear {
        space: PointSpace,
        markers: [usize; 3],
    },
    /// The linear system has more than one solution.
    RankDeficient,
    /// The solved matrix is singular or not finite.
    Singular,
}

impl std::fmt::Display for Degeneracy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degeneracy::Collinear { space, markers } => write!(
                f,
                "{space} markers {}, {} and {} are collinear",
                markers[0], markers[1], markers[2]
            ),
            Degeneracy::RankDeficient => write!(f, "correspondences are rank deficient"),
            Degeneracy::Singular => write!(f, "estimated matrix is singular"),
        }
    }
}

/// Tuning for [HomographyMatrix::estimate_with].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateOptions {
    /// Relative threshold below which triangle areas and singular value
    /// ratios count as zero.
    pub degeneracy_tolerance: f64,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self {
            degeneracy_tolerance: 1e-10,
        }
    }
}

/// A 3x3 planar projective transform, normalized so that `h33 == 1` when
/// possible.
///
/// Serialized as three rows of three numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[[f64; 3]; 3]", from = "[[f64; 3]; 3]")]
pub struct HomographyMatrix(Matrix3<f64>);

impl HomographyMatrix {
    /// Estimate the transform taking `pixel[i]` to `world[i]`.
    ///
    /// With exactly four pairs the result is the exact solution. With more,
    /// it is the least-squares fit of the normalized direct linear transform.
    pub fn estimate(pixel: &[Point2<f64>], world: &[Point2<f64>]) -> Result<Self> {
        Self::estimate_with(pixel, world, &EstimateOptions::default())
    }

    pub fn estimate_with(
        pixel: &[Point2<f64>],
        world: &[Point2<f64>],
        opts: &EstimateOptions,
    ) -> Result<Self> {
        if pixel.len() != world.len() {
            return Err(Error::CorrespondenceLengthMismatch {
                pixel: pixel.len(),
                world: world.len(),
            });
        }
        if pixel.len() < MIN_CORRESPONDENCES {
            return Err(Error::InsufficientCorrespondences {
                got: pixel.len(),
                required: MIN_CORRESPONDENCES,
            });
        }

        // Solve and check in normalized coordinates so that the result does
        // not depend on the units or origin of either point set.
        let t_pixel = normalizing_transform(pixel)?;
        let t_world = normalizing_transform(world)?;
        let h_norm = if pixel.len() == MIN_CORRESPONDENCES {
            solve_exact(pixel, world, &t_pixel, &t_world, opts.degeneracy_tolerance)?
        } else {
            solve_least_squares(pixel, world, &t_pixel, &t_world, opts.degeneracy_tolerance)?
        };
        check_conditioning(&h_norm, opts.degeneracy_tolerance)?;
        let h = t_world.inverse().to_homogeneous() * h_norm * t_pixel.to_homogeneous();
        Ok(Self(normalize(h)))
    }

    /// Apply the transform with the perspective divide `x'/(w'+ε), y'/(w'+ε)`.
    pub fn project(&self, pt: &Point2<f64>) -> Point2<f64> {
        let v = self.0 * Vector3::new(pt.x, pt.y, 1.0);
        let w = v.z + PROJECTION_EPSILON;
        Point2::new(v.x / w, v.y / w)
    }

    pub fn project_all(&self, pts: &[Point2<f64>]) -> Vec<Point2<f64>> {
        pts.iter().map(|p| self.project(p)).collect()
    }

    /// The transform in the opposite direction.
    pub fn inverse(&self) -> Result<Self> {
        let inv = self
            .0
            .try_inverse()
            .ok_or(Error::DegenerateCorrespondence(Degeneracy::Singular))?;
        Ok(Self(normalize(inv)))
    }

    /// Distance between `project(pixel[i])` and `world[i]` for every pair.
    pub fn reprojection_errors(
        &self,
        pixel: &[Point2<f64>],
        world: &[Point2<f64>],
    ) -> Result<Vec<f64>> {
        if pixel.len() != world.len() {
            return Err(Error::CorrespondenceLengthMismatch {
                pixel: pixel.len(),
                world: world.len(),
            });
        }
        Ok(pixel
            .iter()
            .zip(world.iter())
            .map(|(p, w)| (self.project(p) - w).norm())
            .collect())
    }

    pub fn as_matrix(&self) -> &Matrix3<f64> {
        &self.0
    }

    pub fn rows(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }
}

impl From<[[f64; 3]; 3]> for HomographyMatrix {
    fn from(rows: [[f64; 3]; 3]) -> Self {
        Self(Matrix3::from_fn(|r, c| rows[r][c]))
    }
}

impl From<HomographyMatrix> for [[f64; 3]; 3] {
    fn from(h: HomographyMatrix) -> Self {
        h.rows()
    }
}

impl std::fmt::Display for HomographyMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Solve the 8x8 system for h11..h32 with h33 fixed at 1, in normalized
// coordinates.
fn solve_exact(
    pixel: &[Point2<f64>],
    world: &[Point2<f64>],
    t_pixel: &Similarity2<f64>,
    t_world: &Similarity2<f64>,
    tol: f64,
) -> Result<Matrix3<f64>> {
    for (space, pts) in [(PointSpace::Pixel, pixel), (PointSpace::World, world)] {
        if let Some(markers) = find_collinear_triple(pts, tol) {
            return Err(Error::DegenerateCorrespondence(Degeneracy::Collinear {
                space,
                markers,
            }));
        }
    }

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (i, (p, w)) in pixel.iter().zip(world.iter()).enumerate() {
        let p = t_pixel.transform_point(p);
        let w = t_world.transform_point(w);
        let (x, y, u, v) = (p.x, p.y, w.x, w.y);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u]);
        a.row_mut(r + 1)
            .copy_from_slice(&[0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v]);
        b[r] = u;
        b[r + 1] = v;
    }

    let h = a
        .lu()
        .solve(&b)
        .ok_or(Error::DegenerateCorrespondence(Degeneracy::Singular))?;
    Ok(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

// Direct linear transform in normalized coordinates, solved by SVD.
fn solve_least_squares(
    pixel: &[Point2<f64>],
    world: &[Point2<f64>],
    t_pixel: &Similarity2<f64>,
    t_world: &Similarity2<f64>,
    tol: f64,
) -> Result<Matrix3<f64>> {
    let n = pixel.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (p, w)) in pixel.iter().zip(world.iter()).enumerate() {
        let p = t_pixel.transform_point(p);
        let w = t_world.transform_point(w);
        let (x, y, u, v) = (p.x, p.y, w.x, w.y);
        for (c, val) in [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]
            .into_iter()
            .enumerate()
        {
            a[(2 * i, c)] = val;
        }
        for (c, val) in [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]
            .into_iter()
            .enumerate()
        {
            a[(2 * i + 1, c)] = val;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(Error::DegenerateCorrespondence(Degeneracy::RankDeficient))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&i, &j| svd.singular_values[i].total_cmp(&svd.singular_values[j]));
    let smallest = order[0];
    let second = svd.singular_values[order[1]];
    let largest = svd.singular_values[order[order.len() - 1]];
    if !(second > tol * largest) {
        return Err(Error::DegenerateCorrespondence(Degeneracy::RankDeficient));
    }

    let h = v_t.row(smallest);
    Ok(Matrix3::new(
        h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8],
    ))
}

// Similarity which moves the centroid to the origin and scales the mean
// distance from it to sqrt(2).
fn normalizing_transform(pts: &[Point2<f64>]) -> Result<Similarity2<f64>> {
    let n = pts.len() as f64;
    let centroid = pts
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;
    let mean_dist = pts.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    if !(mean_dist > 0.0) || !mean_dist.is_finite() {
        return Err(Error::DegenerateCorrespondence(Degeneracy::RankDeficient));
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Similarity2::new(-centroid * scale, 0.0, scale))
}

/// Find three points (by index) which lie on a common line.
fn find_collinear_triple(pts: &[Point2<f64>], tol: f64) -> Option<[usize; 3]> {
    let n = pts.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let ab = pts[j] - pts[i];
                let ac = pts[k] - pts[i];
                let bc = pts[k] - pts[j];
                let cross = ab.x * ac.y - ab.y * ac.x;
                let scale = ab
                    .norm_squared()
                    .max(ac.norm_squared())
                    .max(bc.norm_squared());
                if cross.abs() <= tol * scale {
                    return Some([i, j, k]);
                }
            }
        }
    }
    None
}

// `h` maps normalized pixel coordinates to normalized world coordinates, so
// the ratio of its singular values does not depend on units or origin.
fn check_conditioning(h: &Matrix3<f64>, tol: f64) -> Result<()> {
    let sv = h.singular_values();
    let max = sv.max();
    let min = sv.min();
    if !max.is_finite() || !(min > tol * max) {
        return Err(Error::DegenerateCorrespondence(Degeneracy::Singular));
    }
    Ok(())
}

fn normalize(h: Matrix3<f64>) -> Matrix3<f64> {
    let h33 = h[(2, 2)];
    if h33.abs() > f64::EPSILON * h.norm() {
        h / h33
    } else {
        h / h.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pts(v: &[(f64, f64)]) -> Vec<Point2<f64>> {
        v.iter().map(|&(x, y)| Point2::new(x, y)).collect()
    }

    #[test]
    fn unit_square_scaled() {
        let pixel = pts(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        let world = pts(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)]);
        let h = HomographyMatrix::estimate(&pixel, &world).unwrap();
        let p = h.project(&Point2::new(0.5, 0.5));
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 1.0, epsilon = 1e-6);
        assert_relative_eq!(h.as_matrix()[(2, 2)], 1.0);
    }

    #[test]
    fn collinear_triple_detected() {
        let p = pts(&[(0.0, 0.0), (3.0, 1.0), (1.0, 0.0), (2.0, 0.0)]);
        assert_eq!(find_collinear_triple(&p, 1e-10), Some([0, 2, 3]));
        let p = pts(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        assert_eq!(find_collinear_triple(&p, 1e-10), None);
    }

    #[test]
    fn duplicate_marker_is_collinear() {
        let pixel = pts(&[(0.0, 0.0), (1.0, 0.0), (1.0, 0.0), (0.0, 1.0)]);
        let world = pts(&[(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)]);
        let err = HomographyMatrix::estimate(&pixel, &world).unwrap_err();
        assert!(matches!(
            err,
            Error::DegenerateCorrespondence(Degeneracy::Collinear {
                space: PointSpace::Pixel,
                ..
            })
        ));
    }

    #[test]
    fn collinear_world_markers_rejected() {
        let pixel = pts(&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]);
        let world = pts(&[(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (5.0, 0.0)]);
        let err = HomographyMatrix::estimate(&pixel, &world).unwrap_err();
        match err {
            Error::DegenerateCorrespondence(Degeneracy::Collinear { space, markers }) => {
                assert_eq!(space, PointSpace::World);
                assert_eq!(markers, [0, 1, 2]);
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn rows_roundtrip_through_serde_form() {
        let rows = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 1.0]];
        let h = HomographyMatrix::from(rows);
        assert_eq!(h.as_matrix()[(0, 1)], 2.0);
        assert_eq!(h.as_matrix()[(2, 0)], 7.0);
        assert_eq!(<[[f64; 3]; 3]>::from(h), rows);
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let h = HomographyMatrix::from([[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]);
        assert!(matches!(
            h.inverse(),
            Err(Error::DegenerateCorrespondence(Degeneracy::Singular))
        ));
    }
}
