//! HyperLogLog distinct-count sketch
//!
//! A versioned, fixed-size byte encoding of a register array, built so the
//! whole sketch can live inside a shared aggregation buffer and be updated
//! in place through the raw-region helpers. Layout:
//!
//! ```text
//! byte 0        version (currently 1)
//! bytes 1..1025 one register per byte, 1024 registers
//! ```
//!
//! Each register holds the maximum observed rank (leading-zero count + 1)
//! of hashes routed to its bucket, so updates are monotonic and re-inserting
//! a previously seen value is a no-op. Merging two sketches is a
//! register-wise maximum: commutative, associative, and the empty sketch is
//! its identity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current encoding version
pub const VERSION: u8 = 1;

/// Bits of the hash used to select a register
const INDEX_BITS: u32 = 10;

/// Number of registers (2^INDEX_BITS)
pub const NUM_REGISTERS: usize = 1 << INDEX_BITS;

/// Total encoded size in bytes: version byte plus one byte per register
pub const NUM_BYTES: usize = 1 + NUM_REGISTERS;

/// Errors from sketch decoding and merging
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchError {
    /// Encodings with different versions cannot be combined
    #[error("Mismatched sketch version: expected {expected}, got {actual}")]
    MismatchedVersion {
        /// Version this sketch carries
        expected: u8,
        /// Version encountered
        actual: u8,
    },

    /// Encoding has the wrong length
    #[error("Mismatched sketch length: expected {expected} bytes, got {actual}")]
    MismatchedLength {
        /// Expected encoded length
        expected: usize,
        /// Length encountered
        actual: usize,
    },
}

// ============================================================================
// Raw-region operations
// ============================================================================
//
// These operate on a caller-owned byte region so buffer-resident aggregators
// can update sketch state in place with no per-row allocation.

/// Write the empty sketch encoding into a region of exactly [`NUM_BYTES`]
pub fn write_empty_into(region: &mut [u8]) {
    region[0] = VERSION;
    region[1..NUM_BYTES].fill(0);
}

/// Fold one hash into the sketch encoded in `region`
pub fn add_hash_into(region: &mut [u8], hash: u64) {
    let index = (hash >> (64 - INDEX_BITS)) as usize;
    let remainder = hash << INDEX_BITS;
    let rank = if remainder == 0 {
        (64 - INDEX_BITS + 1) as u8
    } else {
        (remainder.leading_zeros() + 1) as u8
    };
    let register = &mut region[1 + index];
    if rank > *register {
        *register = rank;
    }
}

/// Register-wise maximum of `other` into `region`
pub fn merge_into(region: &mut [u8], other: &[u8]) -> Result<(), SketchError> {
    if other.len() != NUM_BYTES {
        return Err(SketchError::MismatchedLength {
            expected: NUM_BYTES,
            actual: other.len(),
        });
    }
    if other[0] != region[0] {
        return Err(SketchError::MismatchedVersion {
            expected: region[0],
            actual: other[0],
        });
    }
    for (dst, src) in region[1..NUM_BYTES].iter_mut().zip(&other[1..NUM_BYTES]) {
        if *src > *dst {
            *dst = *src;
        }
    }
    Ok(())
}

/// Estimate the distinct count encoded in `region`.
///
/// Bias-corrected harmonic mean over registers, with the linear-counting
/// correction near zero. Never negative.
pub fn estimate_region(region: &[u8]) -> f64 {
    let m = NUM_REGISTERS as f64;
    let alpha = 0.7213 / (1.0 + 1.079 / m);

    let mut harmonic_sum = 0.0;
    let mut zero_registers = 0usize;
    for &register in &region[1..NUM_BYTES] {
        harmonic_sum += 2f64.powi(-i32::from(register));
        if register == 0 {
            zero_registers += 1;
        }
    }

    let raw = alpha * m * m / harmonic_sum;
    let estimate = if raw <= 2.5 * m && zero_registers > 0 {
        m * (m / zero_registers as f64).ln()
    } else {
        raw
    };
    estimate.max(0.0)
}

// ============================================================================
// HllSketch
// ============================================================================

/// Owned distinct-count sketch.
///
/// Always exactly [`NUM_BYTES`] long; decoding from a shared buffer copies
/// the bytes into a fresh allocation so the result outlives the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HllSketch {
    data: Vec<u8>,
}

impl HllSketch {
    /// Empty sketch (identity element for merge)
    pub fn new() -> Self {
        let mut data = vec![0u8; NUM_BYTES];
        write_empty_into(&mut data);
        Self { data }
    }

    /// Decode a sketch, validating version and length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SketchError> {
        if bytes.len() != NUM_BYTES {
            return Err(SketchError::MismatchedLength {
                expected: NUM_BYTES,
                actual: bytes.len(),
            });
        }
        if bytes[0] != VERSION {
            return Err(SketchError::MismatchedVersion {
                expected: VERSION,
                actual: bytes[0],
            });
        }
        Ok(Self {
            data: bytes.to_vec(),
        })
    }

    /// Copy a sketch out of a buffer region sized by the aggregator protocol.
    ///
    /// The region was written by [`write_empty_into`], so only length is
    /// asserted; the copy is what lets the value escape the shared buffer.
    pub fn copy_from_region(region: &[u8]) -> Self {
        debug_assert_eq!(region.len(), NUM_BYTES);
        Self {
            data: region.to_vec(),
        }
    }

    /// Raw encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Fold one 64-bit hash into the sketch
    pub fn add_hash(&mut self, hash: u64) {
        add_hash_into(&mut self.data, hash);
    }

    /// Merge another sketch into this one
    pub fn merge(&mut self, other: &HllSketch) -> Result<(), SketchError> {
        merge_into(&mut self.data, &other.data)
    }

    /// Estimated distinct count
    pub fn estimate(&self) -> f64 {
        estimate_region(&self.data)
    }

    /// Whether no hash has ever been added
    pub fn is_empty(&self) -> bool {
        self.data[1..].iter().all(|&r| r == 0)
    }
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xxhash_rust::xxh3::xxh3_64;

    fn sketch_of(items: impl IntoIterator<Item = String>) -> HllSketch {
        let mut sketch = HllSketch::new();
        for item in items {
            sketch.add_hash(xxh3_64(item.as_bytes()));
        }
        sketch
    }

    #[test]
    fn test_empty_estimates_zero() {
        assert_eq!(HllSketch::new().estimate(), 0.0);
    }

    #[test]
    fn test_add_hash_idempotent() {
        let mut sketch = HllSketch::new();
        sketch.add_hash(xxh3_64(b"item"));
        let snapshot = sketch.clone();
        sketch.add_hash(xxh3_64(b"item"));
        assert_eq!(sketch, snapshot);
    }

    #[test]
    fn test_merge_identity() {
        let sketch = sketch_of((0..100).map(|i| format!("item_{i}")));
        let mut merged = sketch.clone();
        merged.merge(&HllSketch::new()).unwrap();
        assert_eq!(merged, sketch);
    }

    #[test]
    fn test_merge_commutative_associative() {
        let a = sketch_of((0..300).map(|i| format!("a_{i}")));
        let b = sketch_of((0..300).map(|i| format!("b_{i}")));
        let c = sketch_of((0..300).map(|i| format!("c_{i}")));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c).unwrap();
        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();
        assert_eq!(ab_c, a_bc);
    }

    #[test]
    fn test_estimate_small_range_close_to_exact() {
        // Linear counting keeps small cardinalities nearly exact.
        let sketch = sketch_of((0..100).map(|i| format!("item_{i}")));
        let estimate = sketch.estimate();
        assert!(estimate > 95.0 && estimate < 105.0, "estimate {estimate}");
    }

    #[test]
    fn test_estimate_within_relative_error_bound() {
        // Standard error for 1024 registers is ~3.25%; allow 3 sigma.
        for trial in 0..3 {
            let n = 50_000;
            let sketch = sketch_of((0..n).map(|i| format!("trial{trial}_item_{i}")));
            let estimate = sketch.estimate();
            let relative = (estimate - n as f64).abs() / n as f64;
            assert!(relative < 0.10, "trial {trial}: relative error {relative}");
        }
    }

    #[test]
    fn test_merge_equals_union() {
        let left = sketch_of((0..1000).map(|i| format!("item_{i}")));
        let right = sketch_of((500..1500).map(|i| format!("item_{i}")));
        let mut merged = left.clone();
        merged.merge(&right).unwrap();

        let union = sketch_of((0..1500).map(|i| format!("item_{i}")));
        assert_eq!(merged, union);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = vec![0u8; NUM_BYTES];
        bytes[0] = 9;
        assert!(matches!(
            HllSketch::from_bytes(&bytes),
            Err(SketchError::MismatchedVersion { actual: 9, .. })
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(matches!(
            HllSketch::from_bytes(&[VERSION, 0, 0]),
            Err(SketchError::MismatchedLength { actual: 3, .. })
        ));
    }

    #[test]
    fn test_region_roundtrip() {
        let mut region = vec![0u8; NUM_BYTES];
        write_empty_into(&mut region);
        add_hash_into(&mut region, xxh3_64(b"x"));
        add_hash_into(&mut region, xxh3_64(b"y"));

        let copy = HllSketch::copy_from_region(&region);
        // Mutating the region after the copy must not affect the sketch.
        add_hash_into(&mut region, xxh3_64(b"z"));
        assert!(copy.estimate() >= 1.0 && copy.estimate() < 4.0);
    }
}
