//! Seeded validation/test split

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::TaggedDataset;

/// Fraction of rows drawn into the validation subset by default
pub const DEFAULT_VALIDATION_FRACTION: f64 = 0.2;

/// Default sampling seed
pub const DEFAULT_SPLIT_SEED: u64 = 42;

/// Split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Fraction of rows sampled into validation (0.0-1.0)
    pub validation_fraction: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: DEFAULT_VALIDATION_FRACTION,
            seed: DEFAULT_SPLIT_SEED,
        }
    }
}

/// Row indices of the two subsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    /// Sampled indices, in sampling order
    pub validation: Vec<usize>,
    /// Remaining indices, ascending
    pub test: Vec<usize>,
}

/// Sample `floor(n * fraction)` indices into validation; the rest go to test
pub fn split_validation_test(n: usize, config: &SplitConfig) -> Result<SplitIndices> {
    let fraction = config.validation_fraction;
    if !(0.0..=1.0).contains(&fraction) {
        anyhow::bail!(
            "Validation fraction must be between 0 and 1, got {}",
            fraction
        );
    }

    let amount = (n as f64 * fraction).floor() as usize;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let validation = rand::seq::index::sample(&mut rng, n, amount).into_vec();

    let sampled: HashSet<usize> = validation.iter().copied().collect();
    let test = (0..n).filter(|idx| !sampled.contains(idx)).collect();

    tracing::debug!(
        "Split {} rows into {} validation / {} test (seed {})",
        n,
        amount,
        n - amount,
        config.seed
    );

    Ok(SplitIndices { validation, test })
}

impl TaggedDataset {
    /// Split into `(validation, test)` datasets
    pub fn split_validation_test(&self, config: &SplitConfig) -> Result<(Self, Self)> {
        let indices = split_validation_test(self.len(), config)?;
        Ok((self.select(&indices.validation)?, self.select(&indices.test)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Sentence;

    #[test]
    fn test_split_covers_all_indices_without_overlap() {
        for n in [0, 1, 4, 5, 17, 100, 1001] {
            let split = split_validation_test(n, &SplitConfig::default()).unwrap();

            assert_eq!(split.validation.len(), (n as f64 * 0.2).floor() as usize);
            assert_eq!(split.validation.len() + split.test.len(), n);

            let val: HashSet<_> = split.validation.iter().copied().collect();
            let test: HashSet<_> = split.test.iter().copied().collect();
            assert!(val.is_disjoint(&test));
            assert_eq!(val.len(), split.validation.len(), "duplicate validation index");

            let all: HashSet<_> = val.union(&test).copied().collect();
            assert_eq!(all, (0..n).collect::<HashSet<_>>());
        }
    }

    #[test]
    fn test_split_is_deterministic_for_seed() {
        let config = SplitConfig::default();
        let a = split_validation_test(250, &config).unwrap();
        let b = split_validation_test(250, &config).unwrap();
        assert_eq!(a, b);

        let other = SplitConfig {
            seed: 7,
            ..Default::default()
        };
        let c = split_validation_test(250, &other).unwrap();
        assert_ne!(a.validation, c.validation);
    }

    #[test]
    fn test_split_test_indices_are_ascending() {
        let split = split_validation_test(50, &SplitConfig::default()).unwrap();
        assert!(split.test.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_split_rejects_bad_fraction() {
        let config = SplitConfig {
            validation_fraction: 1.5,
            ..Default::default()
        };
        assert!(split_validation_test(10, &config).is_err());
    }

    #[test]
    fn test_dataset_split() {
        let rows = (0..10)
            .map(|i| Sentence {
                tokens: vec![format!("tok{}", i)],
                ner_tags: vec!["O".to_string()],
            })
            .collect();
        let dataset = TaggedDataset::from_sentences(rows);

        let (val, test) = dataset
            .split_validation_test(&SplitConfig::default())
            .unwrap();
        assert_eq!(val.len(), 2);
        assert_eq!(test.len(), 8);
        for row in val.sentences() {
            assert!(!test.sentences().contains(row));
        }
    }
}
