use rand::Rng;

/// A Vose alias table for O(1) weighted sampling over a fixed set of
/// indices. Construction is O(n); each draw is one uniform index pick
/// plus one uniform threshold compare.
///
/// Weights are clamped to >= 1 before normalization, matching the pool's
/// invariant that a configured backend is never given zero probability.
#[derive(Debug, Clone)]
pub struct AliasTable {
    probability: Vec<f64>,
    alias: Vec<usize>,
    /// Maps table slot -> original index into the caller's backend list.
    indices: Vec<usize>,
}

impl AliasTable {
    pub fn new(weights: &[u32], original_indices: &[usize]) -> Option<Self> {
        let n = weights.len();
        if n == 0 || n != original_indices.len() {
            return None;
        }
        let clamped: Vec<f64> = weights.iter().map(|w| (*w).max(1) as f64).collect();
        let total: f64 = clamped.iter().sum();
        if n == 1 {
            return Some(AliasTable {
                probability: vec![1.0],
                alias: vec![0],
                indices: original_indices.to_vec(),
            });
        }

        let mut scaled: Vec<f64> = clamped.iter().map(|w| w * n as f64 / total).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, p) in scaled.iter().enumerate() {
            if *p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        let mut probability = vec![0.0; n];
        let mut alias = vec![0usize; n];

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            probability[s] = scaled[s];
            alias[s] = l;
            scaled[l] = scaled[l] + scaled[s] - 1.0;
            if scaled[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }
        for l in large {
            probability[l] = 1.0;
        }
        for s in small {
            probability[s] = 1.0;
        }

        Some(AliasTable {
            probability,
            alias,
            indices: original_indices.to_vec(),
        })
    }

    /// Draw one sample, returning the original index it was built from.
    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        let n = self.probability.len();
        let slot = rng.gen_range(0..n);
        let coin: f64 = rng.gen();
        let chosen = if coin < self.probability[slot] {
            slot
        } else {
            self.alias[slot]
        };
        self.indices[chosen]
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_single_entry_always_selected() {
        let table = AliasTable::new(&[5], &[0]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(table.sample(&mut rng), 0);
        }
    }

    #[test]
    fn test_zero_weight_clamped_to_one() {
        let table = AliasTable::new(&[0, 1], &[0, 1]).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let mut counts = [0u32; 2];
        for _ in 0..10_000 {
            counts[table.sample(&mut rng)] += 1;
        }
        assert!(counts[0] > 0, "zero-weight entry must still be reachable");
    }

    #[test]
    fn test_long_run_frequency_converges_to_weight_ratio() {
        let weights = [1u32, 3, 6];
        let table = AliasTable::new(&weights, &[0, 1, 2]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 3];
        let draws = 200_000;
        for _ in 0..draws {
            counts[table.sample(&mut rng)] += 1;
        }
        let total: f64 = weights.iter().sum::<u32>() as f64;
        for (i, w) in weights.iter().enumerate() {
            let expected = *w as f64 / total;
            let observed = counts[i] as f64 / draws as f64;
            assert!(
                (expected - observed).abs() < 0.02,
                "weight {i}: expected {expected}, observed {observed}"
            );
        }
    }

    #[test]
    fn test_empty_weights_returns_none() {
        assert!(AliasTable::new(&[], &[]).is_none());
    }
}
