use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Scores a set of hypotheses against one reference each.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, hypotheses: &[String], references: &[String]) -> Result<f64, TrainingError>;
}

/// Corpus-level BLEU-4 with brevity penalty and exponential smoothing of
/// empty n-gram orders, on a 0-100 scale.
#[derive(Debug, Clone, Copy)]
pub struct Bleu {
    pub max_order: usize,
}

impl Default for Bleu {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

/// Mean sentence-level ROUGE-L F1, on a 0-1 scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct RougeL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Bleu,
    RougeL,
}

impl Metric {
    pub fn for_task(is_summarization: bool) -> Self {
        if is_summarization {
            Metric::RougeL
        } else {
            Metric::Bleu
        }
    }

    pub fn scorer(self) -> Box<dyn Scorer> {
        match self {
            Metric::Bleu => Box::new(Bleu::default()),
            Metric::RougeL => Box::new(RougeL),
        }
    }
}

impl Scorer for Bleu {
    fn name(&self) -> &'static str {
        "bleu"
    }

    fn score(&self, hypotheses: &[String], references: &[String]) -> Result<f64, TrainingError> {
        ensure_aligned(hypotheses, references)?;
        let order = self.max_order.max(1);
        let mut matches = vec![0usize; order];
        let mut totals = vec![0usize; order];
        let mut hypothesis_length = 0usize;
        let mut reference_length = 0usize;

        for (hypothesis, reference) in hypotheses.iter().zip(references) {
            let hyp = tokenize_13a(hypothesis);
            let reference = tokenize_13a(reference);
            hypothesis_length += hyp.len();
            reference_length += reference.len();

            for n in 1..=order {
                let hyp_counts = ngram_counts(&hyp, n);
                let ref_counts = ngram_counts(&reference, n);
                totals[n - 1] += hyp.len().saturating_sub(n - 1);
                matches[n - 1] += hyp_counts
                    .iter()
                    .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
                    .sum::<usize>();
            }
        }

        if hypothesis_length == 0 || matches.iter().all(|&m| m == 0) {
            return Ok(0.0);
        }

        // Exponential smoothing: the k-th order with no matches counts as
        // 1 / (2^k * total) instead of zero.
        let mut smoothing = 1.0f64;
        let mut log_precision = 0.0f64;
        for (&m, &t) in matches.iter().zip(&totals) {
            if t == 0 {
                return Ok(0.0);
            }
            let precision = if m == 0 {
                smoothing *= 2.0;
                1.0 / (smoothing * t as f64)
            } else {
                m as f64 / t as f64
            };
            log_precision += precision.ln();
        }
        let log_precision = log_precision / order as f64;
        let brevity = if hypothesis_length < reference_length {
            (1.0 - reference_length as f64 / hypothesis_length as f64).exp()
        } else {
            1.0
        };
        Ok(100.0 * brevity * log_precision.exp())
    }
}

impl Scorer for RougeL {
    fn name(&self) -> &'static str {
        "rouge_l"
    }

    fn score(&self, hypotheses: &[String], references: &[String]) -> Result<f64, TrainingError> {
        ensure_aligned(hypotheses, references)?;
        if hypotheses.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = hypotheses
            .iter()
            .zip(references)
            .map(|(hypothesis, reference)| rouge_l_f1(reference, hypothesis))
            .sum();
        Ok(total / hypotheses.len() as f64)
    }
}

/// ROUGE-L F-measure of one hypothesis against one reference.
pub fn rouge_l_f1(reference: &str, hypothesis: &str) -> f64 {
    let reference = rouge_tokens(reference);
    let hypothesis = rouge_tokens(hypothesis);
    if reference.is_empty() || hypothesis.is_empty() {
        return 0.0;
    }
    let lcs = longest_common_subsequence(&reference, &hypothesis) as f64;
    if lcs == 0.0 {
        return 0.0;
    }
    let precision = lcs / hypothesis.len() as f64;
    let recall = lcs / reference.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

fn ensure_aligned(hypotheses: &[String], references: &[String]) -> Result<(), TrainingError> {
    if hypotheses.len() != references.len() {
        return Err(TrainingError::runtime(format!(
            "{} hypotheses but {} references",
            hypotheses.len(),
            references.len()
        )));
    }
    Ok(())
}

/// Whitespace tokens with punctuation split off, close to the `13a` tokenizer.
fn tokenize_13a(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split_whitespace() {
        let mut current = String::new();
        for ch in word.chars() {
            if ch.is_ascii_punctuation() {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(ch.to_string());
            } else {
                current.push(ch);
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

fn rouge_tokens(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() < n {
        return counts;
    }
    for window in tokens.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
    }
    counts
}

fn longest_common_subsequence(a: &[String], b: &[String]) -> usize {
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for left in a {
        for (j, right) in b.iter().enumerate() {
            current[j + 1] = if left == right {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_corpus_scores_full_bleu() {
        let refs = strings(&["the cat sat on the mat .", "a quick brown fox jumps"]);
        let score = Bleu::default().score(&refs, &refs).unwrap();
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bleu_penalises_short_and_wrong_output() {
        let refs = strings(&["the cat sat on the mat"]);
        let short = strings(&["the cat sat on"]);
        let unrelated = strings(&["dogs bark loudly at night"]);
        let bleu = Bleu::default();
        let short_score = bleu.score(&short, &refs).unwrap();
        assert!(short_score > 0.0 && short_score < 100.0);
        assert_eq!(bleu.score(&unrelated, &refs).unwrap(), 0.0);
    }

    #[test]
    fn missing_higher_order_matches_are_smoothed() {
        // Precisions 4/5, 2/4, 1/3 and a smoothed 1/(2*2); brevity exp(-0.2).
        let bleu = Bleu::default();
        let score = bleu
            .score(&strings(&["the cat sat on mat"]), &strings(&["the cat sat in a mat"]))
            .unwrap();
        let expected = 100.0 * (-0.2f64).exp() * (0.8 * 0.5 / 3.0 * 0.25f64).powf(0.25);
        assert!((score - expected).abs() < 1e-9, "{score} vs {expected}");
        assert!((score - 34.98).abs() < 0.01);
    }

    #[test]
    fn hypotheses_shorter_than_the_max_order_score_zero() {
        let bleu = Bleu::default();
        let score = bleu
            .score(&strings(&["the cat sat"]), &strings(&["the cat sat"]))
            .unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn rouge_l_matches_hand_computation() {
        // LCS = "the cat the mat" (4); precision 4/5, recall 4/6.
        let f1 = rouge_l_f1("the cat sat on the mat", "the cat and the mat");
        let expected = 2.0 * 0.8 * (4.0 / 6.0) / (0.8 + 4.0 / 6.0);
        assert!((f1 - expected).abs() < 1e-12);
        assert_eq!(rouge_l_f1("abc", ""), 0.0);
    }

    #[test]
    fn metric_follows_task() {
        assert_eq!(Metric::for_task(false), Metric::Bleu);
        assert_eq!(Metric::for_task(true).scorer().name(), "rouge_l");
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let err = RougeL
            .score(&strings(&["a"]), &strings(&["a", "b"]))
            .unwrap_err();
        assert!(err.to_string().contains("1 hypotheses but 2 references"));
    }
}
