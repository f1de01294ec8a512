use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::{attention_mask, pad_rows, Result};
use crate::error::{to_runtime_error, TrainingError};
use crate::tokenizer::{language_tag, TextTokenizer, EOS_TOKEN};

/// Encoder-side inputs for one evaluation or decoding batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl EncoderBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn width(&self) -> usize {
        self.input_ids.first().map(Vec::len).unwrap_or(0)
    }

    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let rows = self.len();
        let width = self.width();
        let ids: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        let mask: Vec<u32> = self.attention_mask.iter().flatten().copied().collect();
        let ids = Tensor::from_vec(ids, (rows, width), device).map_err(to_runtime_error)?;
        let mask = Tensor::from_vec(mask, (rows, width), device).map_err(to_runtime_error)?;
        Ok((ids, mask))
    }
}

/// Finite batches of a single source file, in file order, with a fixed number
/// of sentences per batch. The last batch may be short.
pub struct SequentialBatcher {
    lines: std::vec::IntoIter<String>,
    language: String,
    tokenizer: Arc<dyn TextTokenizer>,
    batch_size: usize,
    max_src_length: usize,
    pad_id: u32,
}

impl SequentialBatcher {
    pub fn new(
        lines: Vec<String>,
        language: impl Into<String>,
        tokenizer: Arc<dyn TextTokenizer>,
        batch_size: usize,
        max_src_length: usize,
        pad_id: u32,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "sequential batch size must be greater than zero",
            ));
        }
        Ok(Self {
            lines: lines.into_iter(),
            language: language.into(),
            tokenizer,
            batch_size,
            max_src_length,
            pad_id,
        })
    }

    pub fn from_file(
        path: &Path,
        language: impl Into<String>,
        tokenizer: Arc<dyn TextTokenizer>,
        batch_size: usize,
        max_src_length: usize,
        pad_id: u32,
    ) -> Result<Self> {
        let lines = parallel_data::read_lines(path)?;
        Self::new(
            lines,
            language,
            tokenizer,
            batch_size,
            max_src_length,
            pad_id,
        )
    }

    fn encode_line(&self, line: &str) -> Result<Vec<u32>> {
        let words: Vec<&str> = line
            .split_whitespace()
            .take(self.max_src_length)
            .collect();
        let text = format!(
            "{} {EOS_TOKEN} {}",
            words.join(" "),
            language_tag(&self.language)
        );
        self.tokenizer.encode(&text, false)
    }

    fn next_batch(&mut self) -> Option<Result<EncoderBatch>> {
        let lines: Vec<String> = self.lines.by_ref().take(self.batch_size).collect();
        if lines.is_empty() {
            return None;
        }

        let mut rows = Vec::with_capacity(lines.len());
        for line in &lines {
            match self.encode_line(line) {
                Ok(ids) => rows.push(ids),
                Err(err) => return Some(Err(err)),
            }
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let input_ids = pad_rows(&rows, width, self.max_src_length, self.pad_id);
        let attention_mask = attention_mask(&input_ids, self.pad_id);
        Some(Ok(EncoderBatch {
            input_ids,
            attention_mask,
        }))
    }
}

impl Iterator for SequentialBatcher {
    type Item = Result<EncoderBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
