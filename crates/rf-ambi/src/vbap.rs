//! Convex-hull triangulation and vector-base amplitude panning (VBAP)
//!
//! Directions are triangulated by an incremental 3-D convex hull. Each hull
//! face gets a precomputed 3x3 inverse so panning gains for any target are a
//! single matrix-vector product.

use nalgebra::{Matrix3, Vector3};

use crate::error::{AmbiError, AmbiResult};
use crate::position::Direction;

/// Plane distance below which a point counts as on the hull
const HULL_EPSILON: f64 = 1e-7;

/// Gain tolerance for "target inside triangle"
const INSIDE_EPSILON: f64 = 1e-6;

/// Faces with |det| below this pass through the origin and cannot pan
const DEGENERATE_DET: f64 = 1e-6;

// ============ Convex Hull ============

/// Triangulate points on (or around) the unit sphere
///
/// Returns outward-oriented faces as index triples. Points strictly inside
/// the hull, and duplicates, belong to no face.
pub fn convex_hull(points: &[Vector3<f64>]) -> AmbiResult<Vec<[usize; 3]>> {
    let n = points.len();
    if n < 4 {
        return Err(AmbiError::Triangulation(format!("{} points, need at least 4", n)));
    }

    // Initial tetrahedron from extreme points
    let i0 = 0;
    let i1 = argmax(n, |i| (points[i] - points[i0]).norm());
    if (points[i1] - points[i0]).norm() < HULL_EPSILON {
        return Err(AmbiError::Triangulation("all points coincide".into()));
    }
    let edge = points[i1] - points[i0];
    let i2 = argmax(n, |i| edge.cross(&(points[i] - points[i0])).norm());
    let normal = edge.cross(&(points[i2] - points[i0]));
    if normal.norm() < HULL_EPSILON {
        return Err(AmbiError::Triangulation("all points are collinear".into()));
    }
    let unit_normal = normal.normalize();
    let i3 = argmax(n, |i| unit_normal.dot(&(points[i] - points[i0])).abs());
    if unit_normal.dot(&(points[i3] - points[i0])).abs() < HULL_EPSILON {
        return Err(AmbiError::Triangulation("all points are coplanar".into()));
    }

    let interior = (points[i0] + points[i1] + points[i2] + points[i3]) / 4.0;
    let orient = |[a, b, c]: [usize; 3]| -> [usize; 3] {
        let nrm = (points[b] - points[a]).cross(&(points[c] - points[a]));
        if nrm.dot(&(points[a] - interior)) >= 0.0 {
            [a, b, c]
        } else {
            [a, c, b]
        }
    };

    let mut faces: Vec<[usize; 3]> = vec![
        orient([i0, i1, i2]),
        orient([i0, i1, i3]),
        orient([i0, i2, i3]),
        orient([i1, i2, i3]),
    ];

    let mut visible = Vec::new();
    let mut edges = Vec::new();

    for p in 0..n {
        if p == i0 || p == i1 || p == i2 || p == i3 {
            continue;
        }

        visible.clear();
        visible.extend(faces.iter().map(|face| plane_distance(points, face, &points[p]) > HULL_EPSILON));
        if !visible.iter().any(|&v| v) {
            continue;
        }

        edges.clear();
        for (face, _) in faces.iter().zip(&visible).filter(|(_, v)| **v) {
            edges.push((face[0], face[1]));
            edges.push((face[1], face[2]));
            edges.push((face[2], face[0]));
        }

        let mut index = 0;
        faces.retain(|_| {
            let keep = !visible[index];
            index += 1;
            keep
        });

        for &(a, b) in &edges {
            if !edges.contains(&(b, a)) {
                faces.push([a, b, p]);
            }
        }
    }

    Ok(faces)
}

fn argmax(n: usize, score: impl Fn(usize) -> f64) -> usize {
    (0..n)
        .max_by(|&a, &b| score(a).total_cmp(&score(b)))
        .unwrap_or(0)
}

fn plane_distance(points: &[Vector3<f64>], face: &[usize; 3], p: &Vector3<f64>) -> f64 {
    let a = points[face[0]];
    let normal = (points[face[1]] - a).cross(&(points[face[2]] - a));
    let norm = normal.norm();
    if norm < 1e-15 {
        return 0.0;
    }
    normal.dot(&(p - a)) / norm
}

/// Spherical integration weight of every point
///
/// Each point receives a third of the solid angle of every hull triangle it
/// belongs to. Weights are normalized to sum to 1.
pub fn area_weights(points: &[Vector3<f64>], faces: &[[usize; 3]]) -> Vec<f64> {
    let mut weights = vec![0.0f64; points.len()];

    for face in faces {
        let a = points[face[0]].normalize();
        let b = points[face[1]].normalize();
        let c = points[face[2]].normalize();

        // Van Oosterom & Strackee solid angle
        let triple = a.dot(&b.cross(&c)).abs();
        let denom = 1.0 + a.dot(&b) + b.dot(&c) + c.dot(&a);
        let solid_angle = 2.0 * triple.atan2(denom);

        for &v in face {
            weights[v] += solid_angle / 3.0;
        }
    }

    let total: f64 = weights.iter().sum();
    if total > 1e-12 {
        for w in &mut weights {
            *w /= total;
        }
    } else if !weights.is_empty() {
        let uniform = 1.0 / weights.len() as f64;
        weights.fill(uniform);
    }
    weights
}

// ============ VBAP ============

/// Gain normalization applied to a VBAP triplet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainNorm {
    /// Sum of gains = 1 (interpolation weights)
    L1,
    /// Sum of squared gains = 1 (loudspeaker panning)
    L2,
}

/// Triangulated set of directions ready for panning
#[derive(Debug, Clone)]
pub struct Vbap {
    faces: Vec<[usize; 3]>,
    /// Transposed inverse of each face's base matrix (None when degenerate)
    inverses: Vec<Option<Matrix3<f64>>>,
    points: Vec<Vector3<f64>>,
}

impl Vbap {
    /// Triangulate `directions`
    pub fn new(directions: &[Direction]) -> AmbiResult<Self> {
        let points: Vec<Vector3<f64>> = directions.iter().map(|d| d.to_vector()).collect();
        Self::from_points(points)
    }

    pub fn from_points(points: Vec<Vector3<f64>>) -> AmbiResult<Self> {
        let faces = convex_hull(&points)?;

        let inverses: Vec<Option<Matrix3<f64>>> = faces
            .iter()
            .map(|face| {
                let base = Matrix3::from_rows(&[
                    points[face[0]].transpose(),
                    points[face[1]].transpose(),
                    points[face[2]].transpose(),
                ]);
                if base.determinant().abs() < DEGENERATE_DET {
                    return None;
                }
                base.try_inverse().map(|inv| inv.transpose())
            })
            .collect();

        if inverses.iter().all(|inv| inv.is_none()) {
            return Err(AmbiError::Triangulation("no usable triangles".into()));
        }

        Ok(Self {
            faces,
            inverses,
            points,
        })
    }

    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    /// Area weights of the triangulated points
    pub fn area_weights(&self) -> Vec<f64> {
        area_weights(&self.points, &self.faces)
    }

    /// Raw non-negative gains of the triangle enclosing `target`
    ///
    /// When no triangle strictly encloses the target (gaps left by
    /// degenerate faces), the triangle with the largest minimum gain is used
    /// and its negative gains are clamped to zero.
    pub fn triplet(&self, target: &Vector3<f64>) -> Option<([usize; 3], [f64; 3])> {
        let mut best: Option<(usize, Vector3<f64>, f64)> = None;

        for (index, inv) in self.inverses.iter().enumerate() {
            let Some(inv) = inv else { continue };
            let g = inv * target;
            let min = g.min();
            if min >= -INSIDE_EPSILON {
                return Some((self.faces[index], [g.x.max(0.0), g.y.max(0.0), g.z.max(0.0)]));
            }
            if g.max() > 0.0 && best.as_ref().is_none_or(|(_, _, m)| min > *m) {
                best = Some((index, g, min));
            }
        }

        best.map(|(index, g, _)| (self.faces[index], [g.x.max(0.0), g.y.max(0.0), g.z.max(0.0)]))
    }

    /// Normalized gains for `target` as (point index, gain) triples
    pub fn gains(&self, target: &Vector3<f64>, norm: GainNorm) -> Option<[(usize, f64); 3]> {
        let (face, mut g) = self.triplet(target)?;

        let total = match norm {
            GainNorm::L1 => g.iter().sum::<f64>(),
            GainNorm::L2 => g.iter().map(|x| x * x).sum::<f64>().sqrt(),
        };
        if total < 1e-12 {
            return None;
        }
        for x in &mut g {
            *x /= total;
        }

        Some([(face[0], g[0]), (face[1], g[1]), (face[2], g[2])])
    }
}
