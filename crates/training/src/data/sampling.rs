use parallel_data::LanguagePair;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::TrainingError;

/// Temperature-smoothed categorical distribution over language pairs:
/// `p_i = n_i^(1/T) / Σ_j n_j^(1/T)`. Computed once per run.
#[derive(Debug, Clone)]
pub struct SamplingDistribution {
    pairs: Vec<LanguagePair>,
    probabilities: Vec<f64>,
    index: WeightedIndex<f64>,
}

impl SamplingDistribution {
    pub fn from_counts(
        counts: &[(LanguagePair, usize)],
        temperature: f64,
    ) -> Result<Self, TrainingError> {
        if !(temperature > 0.0) || !temperature.is_finite() {
            return Err(TrainingError::initialization(format!(
                "sampling temperature must be positive and finite (got {temperature})"
            )));
        }
        if counts.is_empty() {
            return Err(TrainingError::initialization(
                "sampling distribution needs at least one language pair",
            ));
        }
        if let Some((pair, _)) = counts.iter().find(|(_, count)| *count == 0) {
            return Err(TrainingError::initialization(format!(
                "language pair {pair} has no training examples"
            )));
        }

        // Raw proportions first keep the power well-conditioned for large corpora.
        let total: f64 = counts.iter().map(|(_, count)| *count as f64).sum();
        let smoothed: Vec<f64> = counts
            .iter()
            .map(|(_, count)| (*count as f64 / total).powf(1.0 / temperature))
            .collect();
        let norm: f64 = smoothed.iter().sum();
        let probabilities: Vec<f64> = smoothed.iter().map(|weight| weight / norm).collect();

        let index = WeightedIndex::new(&probabilities).map_err(|err| {
            TrainingError::initialization(format!("invalid sampling weights: {err}"))
        })?;

        Ok(Self {
            pairs: counts.iter().map(|(pair, _)| pair.clone()).collect(),
            probabilities,
            index,
        })
    }

    pub fn pairs(&self) -> &[LanguagePair] {
        &self.pairs
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn probability(&self, pair: &LanguagePair) -> Option<f64> {
        self.pairs
            .iter()
            .position(|candidate| candidate == pair)
            .map(|idx| self.probabilities[idx])
    }

    /// Index into [`Self::pairs`]; draws are independent (with replacement).
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        self.index.sample(rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn pairs(counts: &[(&str, usize)]) -> Vec<(LanguagePair, usize)> {
        counts
            .iter()
            .map(|(id, count)| {
                let (src, tgt) = id.split_once('-').unwrap();
                (LanguagePair::new(src, tgt), *count)
            })
            .collect()
    }

    #[test]
    fn probabilities_sum_to_one() {
        let counts = pairs(&[("en-hi", 1000), ("en-ta", 100), ("hi-hi", 7), ("en-bn", 31_337)]);
        for temperature in [0.5, 1.0, 2.0, 5.0, 100.0] {
            let dist = SamplingDistribution::from_counts(&counts, temperature).unwrap();
            let sum: f64 = dist.probabilities().iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "T={temperature} sum={sum}");
        }
    }

    #[test]
    fn unit_temperature_is_proportional() {
        let counts = pairs(&[("en-hi", 300), ("en-ta", 100)]);
        let dist = SamplingDistribution::from_counts(&counts, 1.0).unwrap();
        assert!((dist.probabilities()[0] - 0.75).abs() < 1e-12);
        assert!((dist.probabilities()[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn high_temperature_approaches_uniform() {
        let counts = pairs(&[("en-hi", 1_000_000), ("en-ta", 10)]);
        let dist = SamplingDistribution::from_counts(&counts, 1e6).unwrap();
        for p in dist.probabilities() {
            assert!((p - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn temperature_upsamples_small_pairs() {
        let counts = pairs(&[("en-hi", 1000), ("en-ta", 100)]);
        let small = LanguagePair::new("en", "ta");
        let raw_share = 100.0 / 1100.0;

        let flat = SamplingDistribution::from_counts(&counts, 5.0).unwrap();
        let sharp = SamplingDistribution::from_counts(&counts, 2.0).unwrap();
        let p5 = flat.probability(&small).unwrap();
        let p2 = sharp.probability(&small).unwrap();

        assert!(p5 > raw_share);
        assert!(p5 > p2);
        assert!(p2 > raw_share);
    }

    #[test]
    fn empirical_draws_match_probabilities() {
        let counts = pairs(&[("en-hi", 1000), ("en-ta", 100)]);
        let dist = SamplingDistribution::from_counts(&counts, 5.0).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let draws = 20_000;
        let hits = (0..draws).filter(|_| dist.sample(&mut rng) == 1).count();
        let observed = hits as f64 / draws as f64;
        assert!((observed - dist.probabilities()[1]).abs() < 0.02);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let counts = pairs(&[("en-hi", 10)]);
        assert!(SamplingDistribution::from_counts(&counts, 0.0).is_err());
        assert!(SamplingDistribution::from_counts(&[], 1.0).is_err());
        let with_empty = pairs(&[("en-hi", 10), ("en-ta", 0)]);
        assert!(SamplingDistribution::from_counts(&with_empty, 1.0).is_err());
    }
}
