use std::collections::HashSet;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistanceError {
    #[error("buffer lengths differ: {left} != {right}")]
    LengthMismatch { left: usize, right: usize },
}

fn check_lengths(a: &[u8], b: &[u8]) -> Result<(), DistanceError> {
    if a.len() != b.len() {
        return Err(DistanceError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

/// Distance between two sparse position vectors: the count of indices
/// present in exactly one of them.
pub fn vector_compare(v1: &[usize], v2: &[usize]) -> u64 {
    let s1: HashSet<usize> = v1.iter().copied().collect();
    let s2: HashSet<usize> = v2.iter().copied().collect();
    s1.symmetric_difference(&s2).count() as u64
}

/// Indices of the bytes that differ between two equal-length buffers,
/// in ascending order.
pub fn differing_positions(a: &[u8], b: &[u8]) -> Result<Vec<usize>, DistanceError> {
    check_lengths(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .enumerate()
        .filter(|(_, (x, y))| x != y)
        .map(|(idx, _)| idx)
        .collect())
}

/// Byte-wise Hamming distance: how many byte positions differ.
pub fn bytewise_hamming(a: &[u8], b: &[u8]) -> Result<u64, DistanceError> {
    Ok(differing_positions(a, b)?.len() as u64)
}

/// Bit-wise Hamming distance: how many bits differ across the whole buffer.
pub fn bitwise_hamming(a: &[u8], b: &[u8]) -> Result<u64, DistanceError> {
    check_lengths(a, b)?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| u64::from((x ^ y).count_ones()))
        .sum())
}

/// Which of the two Hamming variants a minimization run measures progress in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Bytewise,
    Bitwise,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[u8], b: &[u8]) -> Result<u64, DistanceError> {
        match self {
            DistanceMetric::Bytewise => bytewise_hamming(a, b),
            DistanceMetric::Bitwise => bitwise_hamming(a, b),
        }
    }
}
