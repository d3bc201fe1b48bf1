//! Random-projection pre-filter.
//!
//! Each embedding service gets a fixed set of [`PROJECTION_K`] orthonormal
//! vectors, generated once and persisted. Every stored embedding is mapped
//! to its eight dot products against them, and search prunes candidates
//! whose projected image is further than a squared-distance threshold from
//! the query's image. The filter is an upper bound on acceptance only: a
//! generous default threshold avoids false negatives, and tightening it
//! trades recall for throughput.

use rand::Rng;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};

/// Number of projection vectors per service.
pub const PROJECTION_K: usize = 8;

/// Default upper bound on squared distance between query and stored
/// projections. Chosen generous to keep the pre-filter sound in practice.
pub const DEFAULT_PROJECTION_THRESHOLD: f64 = 2.0;

/// Pairwise-orthogonality and unit-norm tolerance of generated vectors.
const ORTHO_TOLERANCE: f64 = 1e-4;

/// The per-service set of projection vectors. Immutable once generated.
#[derive(Debug, Clone)]
pub struct ProjectionMatrix {
    vectors: Vec<Vec<f32>>,
}

impl ProjectionMatrix {
    /// Generate [`PROJECTION_K`] orthonormal vectors of length
    /// `dimensions` by Gram–Schmidt over uniform [-1, 1] draws.
    pub fn generate(dimensions: usize) -> Result<Self> {
        Self::generate_with(dimensions, &mut rand::thread_rng())
    }

    /// As [`generate`](Self::generate), with a caller-supplied RNG so
    /// tests can be deterministic.
    pub fn generate_with(dimensions: usize, rng: &mut impl Rng) -> Result<Self> {
        if dimensions < PROJECTION_K {
            return Err(Error::Validation(format!(
                "projection requires at least {} dimensions, service has {}",
                PROJECTION_K, dimensions
            )));
        }

        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(PROJECTION_K);
        for _ in 0..PROJECTION_K {
            // Redraw when a candidate lands (numerically) inside the span
            // of the existing basis.
            loop {
                let mut v: Vec<f64> = (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect();
                for u in &basis {
                    let scale = dot(&v, u) / dot(u, u);
                    for (vi, ui) in v.iter_mut().zip(u.iter()) {
                        *vi -= scale * ui;
                    }
                }
                if dot(&v, &v).sqrt() > 1e-6 {
                    basis.push(v);
                    break;
                }
            }
        }

        let vectors = basis
            .into_iter()
            .map(|v| {
                let norm = dot(&v, &v).sqrt();
                v.into_iter().map(|x| (x / norm) as f32).collect()
            })
            .collect();

        Ok(Self { vectors })
    }

    pub fn from_vectors(vectors: Vec<Vec<f32>>) -> Result<Self> {
        if vectors.len() != PROJECTION_K {
            return Err(Error::Validation(format!(
                "expected {} projection vectors, got {}",
                PROJECTION_K,
                vectors.len()
            )));
        }
        Ok(Self { vectors })
    }

    pub fn dimensions(&self) -> usize {
        self.vectors[0].len()
    }

    /// Map an embedding to its eight dot products against the basis.
    pub fn project(&self, vec: &[f32]) -> Result<[f64; PROJECTION_K]> {
        let mut image = [0.0f64; PROJECTION_K];
        for (out, basis_vec) in image.iter_mut().zip(self.vectors.iter()) {
            if vec.len() != basis_vec.len() {
                return Err(Error::Validation(format!(
                    "vector dimension mismatch: {} vs {}",
                    vec.len(),
                    basis_vec.len()
                )));
            }
            *out = vec
                .iter()
                .zip(basis_vec.iter())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum();
        }
        Ok(image)
    }

    /// Serialize each basis vector through the f32 BLOB codec, in order.
    pub fn to_blobs(&self) -> Vec<Vec<u8>> {
        self.vectors.iter().map(|v| vec_to_blob(v)).collect()
    }

    pub fn from_blobs(blobs: &[Vec<u8>]) -> Result<Self> {
        Self::from_vectors(blobs.iter().map(|b| blob_to_vec(b)).collect())
    }

    /// Verify unit norms and pairwise orthogonality to tolerance. Used by
    /// tests and by debug assertions after generation.
    pub fn is_orthonormal(&self) -> bool {
        for (i, u) in self.vectors.iter().enumerate() {
            let u64s: Vec<f64> = u.iter().map(|x| *x as f64).collect();
            if (dot(&u64s, &u64s).sqrt() - 1.0).abs() >= ORTHO_TOLERANCE {
                return false;
            }
            for v in &self.vectors[i + 1..] {
                let v64s: Vec<f64> = v.iter().map(|x| *x as f64).collect();
                if dot(&u64s, &v64s).abs() >= ORTHO_TOLERANCE {
                    return false;
                }
            }
        }
        true
    }
}

/// Squared Euclidean distance between two projection images.
pub fn distance_sq(a: &[f64; PROJECTION_K], b: &[f64; PROJECTION_K]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
