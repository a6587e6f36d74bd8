//! Distance functions for the supported spaces.
//!
//! All three return a dissimilarity where lower = closer:
//! - **L2**: squared Euclidean distance
//! - **Cosine**: `1 - (a · b) / (|a| |b|)`
//! - **InnerProduct**: `-(a · b)`
//!
//! The loops are written in chunks of four so release builds auto-vectorize them.

use crate::config::Space;
use crate::error::{Error, Result};

/// Distance strategy resolved once from a [`Space`].
///
/// Holds a plain function pointer so the graph's inner loop never matches on the
/// space per call.
#[derive(Clone, Copy)]
pub struct Distance {
    space: Space,
    dim: usize,
    func: fn(&[f32], &[f32]) -> f32,
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distance")
            .field("space", &self.space)
            .field("dim", &self.dim)
            .finish()
    }
}

impl Distance {
    /// Resolve the strategy for `space` over vectors of length `dim`.
    pub fn new(space: Space, dim: usize) -> Self {
        let func: fn(&[f32], &[f32]) -> f32 = match space {
            Space::L2 => l2_squared,
            Space::Cosine => cosine_distance,
            Space::InnerProduct => negative_inner_product,
        };
        Self { space, dim, func }
    }

    /// The space this strategy computes.
    pub fn space(&self) -> Space {
        self.space
    }

    /// Vector length this strategy accepts.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Compute the distance between two vectors, checking both lengths.
    pub fn compute(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        self.check(a)?;
        self.check(b)?;
        Ok((self.func)(a, b))
    }

    /// Fail with `DimensionMismatch` unless `v` has the configured length.
    pub fn check(&self, v: &[f32]) -> Result<()> {
        if v.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: v.len(),
            });
        }
        Ok(())
    }

    /// Unchecked evaluation for vectors already validated at the API boundary.
    #[inline(always)]
    pub(crate) fn eval(&self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), self.dim);
        debug_assert_eq!(b.len(), self.dim);
        (self.func)(a, b)
    }
}

/// Squared Euclidean distance: sum((a[i] - b[i])^2).
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];
        sum += d0 * d0 + d1 * d1 + d2 * d2 + d3 * d3;
    }

    for i in (chunks * 4)..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }

    sum
}

/// Dot product of two vectors.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        sum += a[base] * b[base]
            + a[base + 1] * b[base + 1]
            + a[base + 2] * b[base + 2]
            + a[base + 3] * b[base + 3];
    }

    for i in (chunks * 4)..a.len() {
        sum += a[i] * b[i];
    }

    sum
}

/// Negated dot product, so that a larger inner product ranks closer.
#[inline]
pub fn negative_inner_product(a: &[f32], b: &[f32]) -> f32 {
    -inner_product(a, b)
}

/// Cosine distance in [0, 2]. Zero vectors are treated as orthogonal to everything,
/// except that two identical vectors are always at distance 0.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a, norm_b) = dot_and_norms(a, b);

    let denom = (norm_a * norm_b).sqrt();
    if denom < f32::EPSILON {
        return if a == b { 0.0 } else { 1.0 };
    }

    let similarity = (dot / denom).clamp(-1.0, 1.0);
    (1.0 - similarity).max(0.0)
}

/// Dot product and squared norms in a single pass.
#[inline]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    (dot, norm_a, norm_b)
}
