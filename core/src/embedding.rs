use sha2::{Digest, Sha256};

/// Deterministic embedding used by the `local` provider and by tests.
/// Each 32-value block re-seeds the digest with a block counter so the
/// output has no repeating period for the validator to flag.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut out = Vec::with_capacity(dims);
    let mut block: u32 = 0;
    while out.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();

        for byte in digest.iter() {
            if out.len() == dims {
                break;
            }
            out.push((*byte as f32 / 127.5) - 1.0);
        }
        block += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embedding_is_reproducible_for_same_inputs() {
        let a = deterministic_embedding("hello", "local-v1", 8);
        let b = deterministic_embedding("hello", "local-v1", 8);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_embedding_changes_when_model_changes() {
        let a = deterministic_embedding("hello", "local-v1", 8);
        let b = deterministic_embedding("hello", "local-v2", 8);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic_embedding_has_no_32_value_period() {
        let v = deterministic_embedding("hello", "local-v1", 96);
        assert_ne!(&v[..32], &v[32..64]);
        assert_ne!(&v[32..64], &v[64..96]);
    }
}
