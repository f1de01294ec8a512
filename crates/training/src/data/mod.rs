use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use parallel_data::LanguagePair;

use crate::error::{to_runtime_error, TrainingError};

pub mod masking;
pub mod sampler;
pub mod sampling;
pub mod sequential;

pub use masking::{MaskOutcome, MaskRatio, SpanMasker};
pub use sampler::{MultilingualBatchSampler, SamplerSettings, SamplerStats};
pub use sampling::SamplingDistribution;
pub use sequential::{EncoderBatch, SequentialBatcher};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Token-id matrices for one training step, still on the host.
///
/// All four matrices share the first dimension. Encoder rows share one width,
/// decoder inputs and labels share another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBatch {
    pub encoder_input_ids: Vec<Vec<u32>>,
    pub encoder_attention_mask: Vec<Vec<u32>>,
    pub decoder_input_ids: Vec<Vec<u32>>,
    pub labels: Vec<Vec<u32>>,
    pub pairs: Vec<LanguagePair>,
    /// Label positions that are not padding.
    pub target_tokens: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.encoder_input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder_input_ids.is_empty()
    }

    pub fn encoder_len(&self) -> usize {
        self.encoder_input_ids.first().map(Vec::len).unwrap_or(0)
    }

    pub fn decoder_len(&self) -> usize {
        self.decoder_input_ids.first().map(Vec::len).unwrap_or(0)
    }

    /// Padded size used against the token budget.
    pub fn padded_tokens(&self) -> usize {
        self.encoder_len().max(self.decoder_len()) * self.len()
    }

    pub fn to_tensors(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            encoder_input_ids: matrix_tensor(&self.encoder_input_ids, device)?,
            encoder_attention_mask: matrix_tensor(&self.encoder_attention_mask, device)?,
            decoder_input_ids: matrix_tensor(&self.decoder_input_ids, device)?,
            labels: matrix_tensor(&self.labels, device)?,
            pairs: self.pairs.clone(),
            target_tokens: self.target_tokens,
        })
    }
}

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct Batch {
    pub encoder_input_ids: Tensor,
    pub encoder_attention_mask: Tensor,
    pub decoder_input_ids: Tensor,
    pub labels: Tensor,
    pub pairs: Vec<LanguagePair>,
    pub target_tokens: usize,
}

impl Batch {
    pub fn examples(&self) -> usize {
        self.pairs.len()
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Pads every row to `width` with `pad`, then cuts rows longer than `limit`.
pub(crate) fn pad_rows(rows: &[Vec<u32>], width: usize, limit: usize, pad: u32) -> Vec<Vec<u32>> {
    let width = width.min(limit);
    rows.iter()
        .map(|row| {
            let mut padded: Vec<u32> = row.iter().copied().take(width).collect();
            padded.resize(width, pad);
            padded
        })
        .collect()
}

/// 1 for real tokens, 0 for padding.
pub(crate) fn attention_mask(rows: &[Vec<u32>], pad: u32) -> Vec<Vec<u32>> {
    rows.iter()
        .map(|row| row.iter().map(|&id| u32::from(id != pad)).collect())
        .collect()
}

fn matrix_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let height = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|row| row.len() != width) {
        return Err(TrainingError::runtime("batch rows have unequal widths"));
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (height, width), device).map_err(to_runtime_error)
}
