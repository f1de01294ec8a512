use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use candle_core::{DType, IndexOp, Tensor};

use crate::config::DecodingOptions;
use crate::error::{to_runtime_error, TrainingError};
use crate::model::Seq2SeqModel;
use crate::tokenizer::SpecialTokens;

/// Everything `generate` needs to know about one decoding run.
#[derive(Debug, Clone)]
pub struct DecodingConfig {
    /// `1` decodes greedily.
    pub beam_size: usize,
    /// Upper bound on generated tokens, the start token excluded.
    pub max_length: usize,
    pub min_length: usize,
    pub early_stopping: bool,
    pub length_penalty: f64,
    pub repetition_penalty: f64,
    pub no_repeat_ngram_size: usize,
    pub encoder_no_repeat_ngram_size: usize,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub bos_token_id: u32,
    /// First decoder token, normally the target-language tag.
    pub decoder_start_token_id: u32,
}

impl DecodingConfig {
    /// Decoding options for translating into `target_language`, with lengths
    /// derived from the encoder width of the batch being decoded.
    pub fn for_target(
        options: &DecodingOptions,
        special: &SpecialTokens,
        target_language: &str,
        beam_size: usize,
        encoder_width: usize,
    ) -> Result<Self, TrainingError> {
        let width = encoder_width.max(1) as f64;
        let max_length = (width * options.max_length_multiplier).ceil().max(1.0) as usize;
        let min_length = ((width * options.min_length_multiplier).floor() as usize).min(max_length);
        Ok(Self {
            beam_size: beam_size.max(1),
            max_length,
            min_length,
            early_stopping: options.early_stopping,
            length_penalty: options.length_penalty,
            repetition_penalty: options.repetition_penalty,
            no_repeat_ngram_size: options.no_repeat_ngram_size,
            encoder_no_repeat_ngram_size: options.encoder_no_repeat_ngram_size,
            pad_token_id: special.pad,
            eos_token_id: special.eos,
            bos_token_id: special.bos,
            decoder_start_token_id: special.language(target_language)?,
        })
    }
}

#[derive(Debug, Clone)]
struct BeamHypothesis {
    /// Starts with the decoder start token.
    tokens: Vec<u32>,
    log_prob: f32,
}

#[derive(Debug, Clone)]
struct FinishedHypothesis {
    tokens: Vec<u32>,
    score: f32,
}

/// Best-first pool of completed hypotheses, capped at the beam size.
struct FinishedPool {
    capacity: usize,
    length_penalty: f64,
    items: Vec<FinishedHypothesis>,
}

impl FinishedPool {
    fn new(capacity: usize, length_penalty: f64) -> Self {
        Self {
            capacity,
            length_penalty,
            items: Vec::with_capacity(capacity + 1),
        }
    }

    fn normalized(&self, log_prob: f32, length: usize) -> f32 {
        log_prob / (length.max(1) as f32).powf(self.length_penalty as f32)
    }

    fn worst(&self) -> f32 {
        self.items
            .iter()
            .map(|item| item.score)
            .fold(f32::INFINITY, f32::min)
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn add(&mut self, tokens: Vec<u32>, log_prob: f32) {
        let score = self.normalized(log_prob, tokens.len());
        if self.is_full() && score <= self.worst() {
            return;
        }
        self.items.push(FinishedHypothesis { tokens, score });
        self.items
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        self.items.truncate(self.capacity);
    }

    fn is_done(&self, best_running: f32, current_length: usize, early_stopping: bool) -> bool {
        if !self.is_full() {
            return false;
        }
        early_stopping || self.worst() >= self.normalized(best_running, current_length)
    }

    fn best(self) -> Option<FinishedHypothesis> {
        self.items.into_iter().next()
    }
}

/// Beam search over a batch of encoder inputs. Rows are decoded
/// independently; each result excludes the start token and the final `</s>`.
pub fn generate(
    model: &mut dyn Seq2SeqModel,
    encoder_input_ids: &Tensor,
    encoder_attention_mask: &Tensor,
    config: &DecodingConfig,
) -> Result<Vec<Vec<u32>>, TrainingError> {
    let encoder_output = model
        .encode(encoder_input_ids, encoder_attention_mask)
        .map_err(to_runtime_error)?;
    let source_rows = encoder_input_ids
        .to_dtype(DType::U32)
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(to_runtime_error)?;

    let mut outputs = Vec::with_capacity(source_rows.len());
    for (row, source) in source_rows.iter().enumerate() {
        let encoded = encoder_output.narrow(0, row, 1).map_err(to_runtime_error)?;
        let mask = encoder_attention_mask
            .narrow(0, row, 1)
            .map_err(to_runtime_error)?;
        let source: Vec<u32> = source
            .iter()
            .copied()
            .filter(|&id| id != config.pad_token_id)
            .collect();
        outputs.push(beam_search(model, &encoded, &mask, &source, config)?);
    }
    Ok(outputs)
}

fn beam_search(
    model: &mut dyn Seq2SeqModel,
    encoded: &Tensor,
    mask: &Tensor,
    source: &[u32],
    config: &DecodingConfig,
) -> Result<Vec<u32>, TrainingError> {
    let beam_size = config.beam_size.max(1);
    let source_ngrams = ngram_table(source, config.encoder_no_repeat_ngram_size);
    let mut finished = FinishedPool::new(beam_size, config.length_penalty);
    let mut beams = vec![BeamHypothesis {
        tokens: vec![config.decoder_start_token_id],
        log_prob: 0.0,
    }];

    for generated in 0..config.max_length {
        let scores = next_token_log_probs(model, encoded, mask, &beams)?;

        let mut candidates: Vec<(usize, u32, f32)> = Vec::new();
        for (beam_index, (beam, mut row)) in beams.iter().zip(scores).enumerate() {
            apply_repetition_penalty(&mut row, &beam.tokens, config.repetition_penalty);
            let mut row = log_softmax(&row);
            suppress(&mut row, config.pad_token_id);
            if generated < config.min_length {
                suppress(&mut row, config.eos_token_id);
            }
            ban_repeated_ngrams(&mut row, &beam.tokens, config.no_repeat_ngram_size);
            ban_source_ngrams(
                &mut row,
                &beam.tokens,
                &source_ngrams,
                config.encoder_no_repeat_ngram_size,
            );

            for (token, log_prob) in top_k(&row, 2 * beam_size) {
                candidates.push((beam_index, token, beam.log_prob + log_prob));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut next_beams = Vec::with_capacity(beam_size);
        for (rank, (beam_index, token, log_prob)) in candidates.into_iter().enumerate() {
            let mut tokens = beams[beam_index].tokens.clone();
            tokens.push(token);
            if token == config.eos_token_id {
                if rank < beam_size {
                    finished.add(tokens, log_prob);
                }
            } else {
                next_beams.push(BeamHypothesis { tokens, log_prob });
            }
            if next_beams.len() == beam_size {
                break;
            }
        }

        if next_beams.is_empty() {
            beams = next_beams;
            break;
        }
        beams = next_beams;

        let best_running = beams
            .iter()
            .map(|beam| beam.log_prob)
            .fold(f32::NEG_INFINITY, f32::max);
        if finished.is_done(best_running, beams[0].tokens.len(), config.early_stopping) {
            beams.clear();
            break;
        }
    }

    // Hypotheses still running at the length limit compete as they are.
    for beam in beams {
        finished.add(beam.tokens, beam.log_prob);
    }

    let best = finished.best().map(|hyp| hyp.tokens).unwrap_or_default();
    Ok(best
        .into_iter()
        .skip(1)
        .filter(|&token| token != config.eos_token_id)
        .collect())
}

fn next_token_log_probs(
    model: &mut dyn Seq2SeqModel,
    encoded: &Tensor,
    mask: &Tensor,
    beams: &[BeamHypothesis],
) -> Result<Vec<Vec<f32>>, TrainingError> {
    let count = beams.len();
    let length = beams[0].tokens.len();
    let flat: Vec<u32> = beams
        .iter()
        .flat_map(|beam| beam.tokens.iter().copied())
        .collect();
    let device = encoded.device();
    let prefix = Tensor::from_vec(flat, (count, length), device).map_err(to_runtime_error)?;
    let encoded = expand_rows(encoded, count)?;
    let mask = expand_rows(mask, count)?;

    let logits = model
        .decode_logits(&encoded, &mask, &prefix)
        .map_err(to_runtime_error)?;
    logits
        .i((.., length - 1, ..))
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)
}

fn expand_rows(tensor: &Tensor, count: usize) -> Result<Tensor, TrainingError> {
    if count == 1 {
        return Ok(tensor.clone());
    }
    let mut dims = tensor.dims().to_vec();
    dims[0] = count;
    tensor
        .broadcast_as(dims)
        .and_then(|t| t.contiguous())
        .map_err(to_runtime_error)
}

fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f64) {
    if penalty <= 1.0 {
        return;
    }
    let penalty = penalty as f32;
    let seen: HashSet<u32> = history.iter().copied().collect();
    for token in seen {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

fn suppress(scores: &mut [f32], token: u32) {
    if let Some(score) = scores.get_mut(token as usize) {
        *score = f32::NEG_INFINITY;
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|value| (value - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|value| value - log_sum).collect()
}

fn top_k(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .map(|(index, score)| (index as u32, *score))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
}

/// Maps every (n-1)-token prefix in `tokens` to the tokens that followed it.
fn ngram_table(tokens: &[u32], n: usize) -> HashMap<Vec<u32>, HashSet<u32>> {
    let mut table: HashMap<Vec<u32>, HashSet<u32>> = HashMap::new();
    if n == 0 || tokens.len() < n {
        return table;
    }
    for window in tokens.windows(n) {
        table
            .entry(window[..n - 1].to_vec())
            .or_default()
            .insert(window[n - 1]);
    }
    table
}

fn ban_repeated_ngrams(scores: &mut [f32], history: &[u32], n: usize) {
    if n == 0 || history.len() + 1 < n {
        return;
    }
    let table = ngram_table(history, n);
    let key = &history[history.len() + 1 - n..];
    if let Some(banned) = table.get(key) {
        for &token in banned {
            suppress(scores, token);
        }
    }
}

fn ban_source_ngrams(
    scores: &mut [f32],
    history: &[u32],
    source_table: &HashMap<Vec<u32>, HashSet<u32>>,
    n: usize,
) {
    // The start token is not part of the output text.
    let generated = history.get(1..).unwrap_or(&[]);
    if n == 0 || generated.len() + 1 < n {
        return;
    }
    let key = &generated[generated.len() + 1 - n..];
    if let Some(banned) = source_table.get(key) {
        for &token in banned {
            suppress(scores, token);
        }
    }
}
