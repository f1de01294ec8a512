use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Fraction of a sentence to mask: fixed, or drawn uniformly per sentence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaskRatio {
    Fixed(f64),
    Range(f64, f64),
}

impl MaskRatio {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            MaskRatio::Fixed(ratio) => ratio,
            MaskRatio::Range(low, high) if high > low => rng.gen_range(low..high),
            MaskRatio::Range(low, _) => low,
        }
    }

    /// Lower bound of the ratio; bilingual masking draws below it.
    pub fn low(&self) -> f64 {
        match *self {
            MaskRatio::Fixed(ratio) => ratio,
            MaskRatio::Range(low, _) => low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskOutcome {
    /// Original tokens replaced by placeholders.
    pub masked_tokens: usize,
    pub spans: usize,
}

/// Text-infilling noise: contiguous runs of whitespace tokens collapse into a
/// single placeholder, with run lengths drawn from Poisson(λ).
#[derive(Debug, Clone)]
pub struct SpanMasker {
    span_lengths: Poisson<f64>,
    candidate_pool: usize,
    mask_token: String,
}

impl SpanMasker {
    pub fn new(
        span_lambda: f64,
        candidate_pool: usize,
        mask_token: impl Into<String>,
    ) -> Result<Self, TrainingError> {
        let span_lengths = Poisson::new(span_lambda).map_err(|err| {
            TrainingError::initialization(format!("invalid span length lambda {span_lambda}: {err}"))
        })?;
        if candidate_pool == 0 {
            return Err(TrainingError::initialization(
                "span masking needs a non-empty candidate pool",
            ));
        }
        Ok(Self {
            span_lengths,
            candidate_pool,
            mask_token: mask_token.into(),
        })
    }

    pub fn mask_token(&self) -> &str {
        &self.mask_token
    }

    /// Masks `tokens` in place so that at most `floor(ratio * len)` original
    /// tokens are replaced. Stops early once the candidate pool runs dry or no
    /// placement fits; partial masking is a normal outcome.
    pub fn mask<R: Rng + ?Sized>(
        &self,
        tokens: &mut Vec<String>,
        ratio: f64,
        rng: &mut R,
    ) -> MaskOutcome {
        let mut outcome = MaskOutcome::default();
        let budget = (ratio.max(0.0) * tokens.len() as f64).floor() as usize;
        if budget == 0 {
            return outcome;
        }

        let candidates: Vec<usize> = (0..self.candidate_pool)
            .map(|_| self.span_lengths.sample(rng) as usize)
            .collect();

        for span in candidates {
            if outcome.masked_tokens >= budget {
                break;
            }
            if span == 0 || span > budget - outcome.masked_tokens {
                continue;
            }

            let current_len = tokens.len();
            if span > current_len {
                break;
            }

            let start = rng.gen_range(0..=current_len - span);
            let end = start + span;
            if tokens[start..end].iter().any(|token| *token == self.mask_token) {
                continue;
            }

            tokens.splice(start..end, std::iter::once(self.mask_token.clone()));
            outcome.masked_tokens += span;
            outcome.spans += 1;
        }

        outcome
    }

    pub fn mask_sentence<R: Rng + ?Sized>(
        &self,
        sentence: &str,
        ratio: f64,
        rng: &mut R,
    ) -> (String, MaskOutcome) {
        let mut tokens: Vec<String> = sentence.split_whitespace().map(str::to_string).collect();
        let outcome = self.mask(&mut tokens, ratio, rng);
        (tokens.join(" "), outcome)
    }
}
