use cairn_core::error::{CairnError, ErrorKind};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use thiserror::Error;

const TRUST_CACHE_CAPACITY: usize = 8_192;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VectorInvalid {
    #[error("dimension {got} outside [{min}, {max}]")]
    Dimension { got: usize, min: usize, max: usize },
    #[error("non-finite value at index {0}")]
    NonFinite(usize),
    #[error("l2 norm {norm} outside [{min}, {max}]")]
    Norm { norm: f32, min: f32, max: f32 },
    #[error("zero ratio {0} exceeds threshold")]
    ZeroRatio(f32),
    #[error("value entropy {0} bits below threshold")]
    LowEntropy(f32),
    #[error("variance {0} below threshold")]
    LowVariance(f32),
    #[error("spike ratio {0} exceeds threshold")]
    SpikeRatio(f32),
    #[error("{0} outliers exceed threshold")]
    Outliers(usize),
    #[error("repeated window pattern detected")]
    RepeatedPattern,
}

impl CairnError for VectorInvalid {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorPolicy {
    pub min_dim: usize,
    pub max_dim: usize,
    pub min_norm: f32,
    pub max_norm: f32,
    pub max_zero_ratio: f32,
    pub min_entropy_bits: f32,
    pub min_variance: f32,
    /// Spikes are values more than `spike_sigma` standard deviations
    /// from the mean.
    pub spike_sigma: f32,
    pub max_spike_ratio: f32,
    pub max_outliers: usize,
    pub pattern_window: usize,
}

impl Default for VectorPolicy {
    fn default() -> Self {
        Self {
            min_dim: 8,
            max_dim: 4_096,
            min_norm: 1e-3,
            max_norm: 1e3,
            max_zero_ratio: 0.5,
            min_entropy_bits: 1.0,
            min_variance: 1e-8,
            spike_sigma: 4.0,
            max_spike_ratio: 0.1,
            max_outliers: 16,
            pattern_window: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorStats {
    pub mean: f32,
    pub variance: f32,
    pub norm: f32,
    pub entropy_bits: f32,
    pub zero_ratio: f32,
    pub spike_ratio: f32,
    pub outliers: usize,
}

/// Statistical gate in front of the vector index: dimension and
/// finiteness first, then distribution checks that catch padded, crafted,
/// or degenerate embeddings. Exact duplicates of previously accepted
/// vectors short-circuit through a hash trust cache.
pub struct VectorValidator {
    policy: VectorPolicy,
    trusted: Mutex<LruCache<[u8; 32], ()>>,
}

impl VectorValidator {
    pub fn new(policy: VectorPolicy) -> Self {
        Self {
            policy,
            trusted: Mutex::new(LruCache::new(
                NonZeroUsize::new(TRUST_CACHE_CAPACITY).expect("non-zero cache size"),
            )),
        }
    }

    pub fn stats(&self, vector: &[f32]) -> VectorStats {
        compute_stats(vector, &self.policy)
    }

    pub fn validate(&self, vector: &[f32]) -> Result<(), VectorInvalid> {
        let fingerprint = fingerprint(vector);
        if self.trusted.lock().unwrap().get(&fingerprint).is_some() {
            return Ok(());
        }

        self.validate_uncached(vector)?;
        self.trusted.lock().unwrap().put(fingerprint, ());
        Ok(())
    }

    pub fn validate_all(&self, vectors: &[Vec<f32>]) -> Result<(), VectorInvalid> {
        for vector in vectors {
            self.validate(vector)?;
        }
        Ok(())
    }

    fn validate_uncached(&self, vector: &[f32]) -> Result<(), VectorInvalid> {
        let policy = &self.policy;

        if vector.len() < policy.min_dim || vector.len() > policy.max_dim {
            return Err(VectorInvalid::Dimension {
                got: vector.len(),
                min: policy.min_dim,
                max: policy.max_dim,
            });
        }
        if let Some(position) = vector.iter().position(|v| !v.is_finite()) {
            return Err(VectorInvalid::NonFinite(position));
        }

        let stats = compute_stats(vector, policy);

        if stats.norm < policy.min_norm || stats.norm > policy.max_norm {
            return Err(VectorInvalid::Norm {
                norm: stats.norm,
                min: policy.min_norm,
                max: policy.max_norm,
            });
        }
        if stats.zero_ratio > policy.max_zero_ratio {
            return Err(VectorInvalid::ZeroRatio(stats.zero_ratio));
        }
        if stats.variance < policy.min_variance {
            return Err(VectorInvalid::LowVariance(stats.variance));
        }
        if stats.entropy_bits < policy.min_entropy_bits {
            return Err(VectorInvalid::LowEntropy(stats.entropy_bits));
        }
        if stats.spike_ratio > policy.max_spike_ratio {
            return Err(VectorInvalid::SpikeRatio(stats.spike_ratio));
        }
        if stats.outliers > policy.max_outliers {
            return Err(VectorInvalid::Outliers(stats.outliers));
        }
        if has_repeated_windows(vector, policy.pattern_window) {
            return Err(VectorInvalid::RepeatedPattern);
        }
        Ok(())
    }
}

fn fingerprint(vector: &[f32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    hasher.finalize().into()
}

fn compute_stats(vector: &[f32], policy: &VectorPolicy) -> VectorStats {
    let n = vector.len().max(1) as f32;
    let mean = vector.iter().sum::<f32>() / n;
    let variance = vector.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let sigma = variance.sqrt();
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    let zero_ratio = vector.iter().filter(|v| v.abs() < 1e-6).count() as f32 / n;

    let spike_ratio = if sigma > 0.0 {
        vector
            .iter()
            .filter(|v| (*v - mean).abs() > policy.spike_sigma * sigma)
            .count() as f32
            / n
    } else {
        0.0
    };

    // Outliers are gross excursions regardless of distribution shape.
    let outliers = vector
        .iter()
        .filter(|v| (*v - mean).abs() > 6.0 * sigma.max(1e-6))
        .count();

    VectorStats {
        mean,
        variance,
        norm,
        entropy_bits: value_entropy_bits(vector),
        zero_ratio,
        spike_ratio,
        outliers,
    }
}

/// Shannon entropy over values quantized to 3 decimals.
fn value_entropy_bits(vector: &[f32]) -> f32 {
    if vector.is_empty() {
        return 0.0;
    }
    let mut histogram: HashMap<i64, usize> = HashMap::new();
    for value in vector {
        *histogram.entry((value * 1_000.0).round() as i64).or_insert(0) += 1;
    }
    let n = vector.len() as f32;
    histogram
        .values()
        .map(|count| {
            let p = *count as f32 / n;
            -p * p.log2()
        })
        .sum()
}

/// A vector stitched from one repeating block is a padded or crafted
/// embedding, not a model output.
fn has_repeated_windows(vector: &[f32], window: usize) -> bool {
    if window == 0 || vector.len() < window * 4 {
        return false;
    }
    let mut windows: HashMap<Vec<u32>, usize> = HashMap::new();
    let mut total = 0usize;
    for chunk in vector.chunks_exact(window) {
        let key: Vec<u32> = chunk.iter().map(|v| v.to_bits()).collect();
        *windows.entry(key).or_insert(0) += 1;
        total += 1;
    }
    windows.len() <= total / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::embedding::deterministic_embedding;

    fn validator() -> VectorValidator {
        VectorValidator::new(VectorPolicy::default())
    }

    #[test]
    fn accepts_model_shaped_vectors() {
        let vector = deterministic_embedding("some text", "m1", 384);
        validator().validate(&vector).unwrap();
    }

    #[test]
    fn rejects_wrong_dimension() {
        let result = validator().validate(&[1.0, 2.0]);
        assert!(matches!(result, Err(VectorInvalid::Dimension { got: 2, .. })));
    }

    #[test]
    fn rejects_nan_and_infinity() {
        let mut vector = deterministic_embedding("t", "m1", 64);
        vector[10] = f32::NAN;
        assert!(matches!(
            validator().validate(&vector),
            Err(VectorInvalid::NonFinite(10))
        ));

        let mut vector = deterministic_embedding("t", "m1", 64);
        vector[3] = f32::INFINITY;
        assert!(matches!(
            validator().validate(&vector),
            Err(VectorInvalid::NonFinite(3))
        ));
    }

    #[test]
    fn rejects_all_zero_vectors() {
        let vector = vec![0.0f32; 64];
        // all-zero fails the norm gate before the zero-ratio gate
        assert!(matches!(
            validator().validate(&vector),
            Err(VectorInvalid::Norm { .. })
        ));
    }

    #[test]
    fn rejects_mostly_zero_vectors() {
        let mut vector = vec![0.0f32; 64];
        vector[0] = 1.0;
        vector[1] = -1.0;
        let result = validator().validate(&vector);
        assert!(matches!(result, Err(VectorInvalid::ZeroRatio(_))));
    }

    #[test]
    fn rejects_constant_vectors() {
        let vector = vec![0.25f32; 64];
        let result = validator().validate(&vector);
        assert!(matches!(
            result,
            Err(VectorInvalid::LowVariance(_)) | Err(VectorInvalid::LowEntropy(_))
        ));
    }

    #[test]
    fn rejects_oversized_norm() {
        let vector: Vec<f32> = (0..64).map(|i| (i as f32 + 1.0) * 1_000.0).collect();
        assert!(matches!(
            validator().validate(&vector),
            Err(VectorInvalid::Norm { .. })
        ));
    }

    #[test]
    fn rejects_repeating_block_padding() {
        let block: Vec<f32> = deterministic_embedding("block", "m1", 8);
        let mut vector = Vec::new();
        for _ in 0..8 {
            vector.extend_from_slice(&block);
        }
        assert!(matches!(
            validator().validate(&vector),
            Err(VectorInvalid::RepeatedPattern)
        ));
    }

    #[test]
    fn trust_cache_short_circuits_duplicates() {
        let validator = validator();
        let vector = deterministic_embedding("cached", "m1", 128);

        validator.validate(&vector).unwrap();
        // second pass hits the trust cache
        validator.validate(&vector).unwrap();
        assert!(validator
            .trusted
            .lock()
            .unwrap()
            .get(&fingerprint(&vector))
            .is_some());
    }

    #[test]
    fn validate_all_stops_at_the_first_bad_vector() {
        let validator = validator();
        let good = deterministic_embedding("good", "m1", 64);
        let bad = vec![0.0f32; 64];
        let result = validator.validate_all(&[good, bad]);
        assert!(result.is_err());
    }

    #[test]
    fn stats_report_reasonable_values() {
        let vector = deterministic_embedding("text", "m1", 256);
        let stats = validator().stats(&vector);
        assert!(stats.norm > 0.0);
        assert!(stats.variance > 0.0);
        assert!(stats.entropy_bits > 1.0);
        assert!(stats.zero_ratio < 0.1);
    }
}
