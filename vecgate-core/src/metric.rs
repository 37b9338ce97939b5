//! Similarity metrics understood by the native engine.
//!
//! The engine reports L2 results as *squared* distances and inner-product
//! results as raw dot products. The helpers here compute the same values so
//! the in-process engine and tests agree with the native one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Distance metric of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MetricType {
    /// Inner product. Higher is more similar.
    InnerProduct,
    /// Squared Euclidean distance. Lower is more similar.
    #[default]
    L2,
}

impl MetricType {
    /// Native enum value passed across the boundary.
    #[inline]
    pub fn native_code(self) -> i32 {
        match self {
            MetricType::InnerProduct => 0,
            MetricType::L2 => 1,
        }
    }

    /// Maps a native enum value back to a metric.
    pub fn from_native(code: i32) -> Option<Self> {
        match code {
            0 => Some(MetricType::InnerProduct),
            1 => Some(MetricType::L2),
            _ => None,
        }
    }

    /// Computes the score between two vectors the way the engine reports it.
    #[inline]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");
        match self {
            MetricType::L2 => l2_squared(a, b),
            MetricType::InnerProduct => inner_product(a, b),
        }
    }

    /// Returns true if `a` ranks ahead of `b` under this metric.
    #[inline]
    pub fn is_better(self, a: f32, b: f32) -> bool {
        match self {
            MetricType::L2 => a < b,
            MetricType::InnerProduct => a > b,
        }
    }

    /// Distance reported for a missing neighbor slot.
    #[inline]
    pub fn sentinel(self) -> f32 {
        match self {
            MetricType::L2 => f32::INFINITY,
            MetricType::InnerProduct => f32::NEG_INFINITY,
        }
    }

    /// Returns true if `score` falls inside a range search of `radius`.
    #[inline]
    pub fn within_radius(self, score: f32, radius: f32) -> bool {
        match self {
            MetricType::L2 => score < radius,
            MetricType::InnerProduct => score > radius,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::InnerProduct => f.write_str("InnerProduct"),
            MetricType::L2 => f.write_str("L2"),
        }
    }
}

/// Squared Euclidean distance.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Dot product.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Hamming distance between two packed bit codes.
#[inline]
pub fn hamming(a: &[u8], b: &[u8]) -> i32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones() as i32)
        .sum()
}
