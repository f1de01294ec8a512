//! Fixtures shared by the unit tests.

use std::path::Path;

use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{Embedding, Linear};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::TrainingConfig;
use crate::model::Seq2SeqModel;

/// Bag-of-embeddings encoder-decoder: the decoder sees its own token
/// embedding plus the masked mean of the encoder embeddings.
pub(crate) struct TinySeq2Seq {
    encoder_embed: Embedding,
    decoder_embed: Embedding,
    lm_head: Linear,
    parameters: Vec<(String, Var)>,
    device: Device,
}

impl TinySeq2Seq {
    pub(crate) fn new(vocab_size: usize, hidden: usize, seed: u64) -> Result<Self> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut var = |shape: &[usize], scale: f32| -> Result<Var> {
            let count = shape.iter().product();
            let values: Vec<f32> = (0..count).map(|_| rng.gen_range(-scale..scale)).collect();
            Var::from_tensor(&Tensor::from_vec(values, shape, &device)?)
        };

        let encoder_weight = var(&[vocab_size, hidden], 0.5)?;
        let decoder_weight = var(&[vocab_size, hidden], 0.5)?;
        let head_weight = var(&[vocab_size, hidden], 0.5)?;
        let head_bias = var(&[vocab_size], 0.1)?;

        Ok(Self {
            encoder_embed: Embedding::new(encoder_weight.as_tensor().clone(), hidden),
            decoder_embed: Embedding::new(decoder_weight.as_tensor().clone(), hidden),
            lm_head: Linear::new(
                head_weight.as_tensor().clone(),
                Some(head_bias.as_tensor().clone()),
            ),
            parameters: vec![
                ("decoder.embed_tokens.weight".to_string(), decoder_weight),
                ("encoder.embed_tokens.weight".to_string(), encoder_weight),
                ("lm_head.bias".to_string(), head_bias),
                ("lm_head.weight".to_string(), head_weight),
            ],
            device,
        })
    }
}

impl Seq2SeqModel for TinySeq2Seq {
    fn forward(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let encoded = self.encode(encoder_input_ids, encoder_attention_mask)?;
        self.decode_logits(&encoded, encoder_attention_mask, decoder_input_ids)
    }

    fn encode(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let mask = encoder_attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        self.encoder_embed
            .forward(encoder_input_ids)?
            .broadcast_mul(&mask)
    }

    fn decode_logits(
        &mut self,
        encoder_output: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let lengths = encoder_attention_mask
            .to_dtype(DType::F32)?
            .sum_keepdim(1)?
            .clamp(1f32, f32::MAX)?;
        let pooled = encoder_output.sum(1)?.broadcast_div(&lengths)?;
        let hidden = self
            .decoder_embed
            .forward(decoder_input_ids)?
            .broadcast_add(&pooled.unsqueeze(1)?)?
            .tanh()?;
        self.lm_head.forward(&hidden)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.parameters.clone()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Smallest config that deserializes, with every path under `dir`.
pub(crate) fn tiny_config(dir: &Path) -> TrainingConfig {
    let json = serde_json::json!({
        "tokenizer": { "tokenizer_json": dir.join("tokenizer.json") },
        "data": {
            "train": [{
                "source_lang": "en",
                "target_lang": "hi",
                "source": dir.join("train.en"),
                "target": dir.join("train.hi"),
            }],
            "batch_tokens": 32,
            "max_src_length": 16,
            "max_tgt_length": 16,
        },
        "evaluation": { "enabled": false },
        "runtime": { "checkpoint_dir": dir.join("checkpoints") },
    });
    serde_json::from_value(json).expect("tiny config deserializes")
}
