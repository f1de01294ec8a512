//! Batch translation of plain-text files, shared by dev-set evaluation and the
//! `nmt-decode` binary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parallel_data::LanguagePair;

use crate::config::DecodingOptions;
use crate::data::SequentialBatcher;
use crate::error::TrainingError;
use crate::generation::{generate, DecodingConfig};
use crate::model::Seq2SeqModel;
use crate::scoring::Scorer;
use crate::tokenizer::{SpecialTokens, TextTokenizer};

#[derive(Debug, Clone, Copy)]
pub struct TranslationSettings {
    pub beam_size: usize,
    pub batch_size: usize,
    pub max_src_length: usize,
}

/// Translates `lines` from `pair.source` into `pair.target`, one hypothesis
/// per input line, in input order.
pub fn translate_lines(
    model: &mut dyn Seq2SeqModel,
    tokenizer: &Arc<dyn TextTokenizer>,
    special: &SpecialTokens,
    options: &DecodingOptions,
    pair: &LanguagePair,
    lines: Vec<String>,
    settings: &TranslationSettings,
) -> Result<Vec<String>, TrainingError> {
    let device = model.device().clone();
    let expected = lines.len();
    let batcher = SequentialBatcher::new(
        lines,
        pair.source.clone(),
        Arc::clone(tokenizer),
        settings.batch_size,
        settings.max_src_length,
        special.pad,
    )?;

    let mut hypotheses = Vec::with_capacity(expected);
    for batch in batcher {
        let batch = batch?;
        let decoding = DecodingConfig::for_target(
            options,
            special,
            &pair.target,
            settings.beam_size,
            batch.width(),
        )?;
        let (ids, mask) = batch.to_tensors(&device)?;
        for tokens in generate(model, &ids, &mask, &decoding)? {
            let content: Vec<u32> = tokens
                .into_iter()
                .filter(|&id| !special.is_special(id))
                .collect();
            hypotheses.push(tokenizer.decode(&content, true)?.trim().to_string());
        }
    }
    Ok(hypotheses)
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub sentences: usize,
    pub score: Option<(&'static str, f64)>,
    pub seconds: f64,
}

/// Translates `source` line by line into `output`, scoring against
/// `reference` when one is given.
#[allow(clippy::too_many_arguments)]
pub fn decode_file(
    model: &mut dyn Seq2SeqModel,
    tokenizer: &Arc<dyn TextTokenizer>,
    special: &SpecialTokens,
    options: &DecodingOptions,
    pair: &LanguagePair,
    source: &Path,
    output: &Path,
    reference: Option<(&Path, &dyn Scorer)>,
    settings: &TranslationSettings,
) -> Result<DecodeReport, TrainingError> {
    let started = Instant::now();
    let lines = parallel_data::read_lines(source)?;
    tracing::info!(
        pair = %pair,
        source = %source.display(),
        sentences = lines.len(),
        beam = settings.beam_size,
        "decoding"
    );

    model.set_training(false);
    let hypotheses = translate_lines(model, tokenizer, special, options, pair, lines, settings)?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(output)?);
    for hypothesis in &hypotheses {
        writeln!(writer, "{hypothesis}")?;
    }
    writer.flush()?;

    let score = match reference {
        Some((path, scorer)) => {
            let references = parallel_data::read_lines(path)?;
            let score = scorer.score(&hypotheses, &references)?;
            tracing::info!(pair = %pair, metric = scorer.name(), score, "decode score");
            Some((scorer.name(), score))
        }
        None => None,
    };

    Ok(DecodeReport {
        sentences: hypotheses.len(),
        score,
        seconds: started.elapsed().as_secs_f64(),
    })
}
