//! Marian-style encoder-decoder with the parameter layout of Hugging Face
//! Marian checkpoints (`model.shared`, `model.encoder.layers.{i}...`,
//! `final_logits_bias`), so pretrained safetensors load by name.
//!
//! Layers are built from differentiable candle ops only; the fused layer-norm
//! and softmax kernels in `candle_nn::ops` do not record gradients.

use std::sync::PoisonError;

use candle_core::{DType, Device, Module, Result, Tensor, Var, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder, VarMap};

use crate::config::ModelHyperparameters;
use crate::error::{to_runtime_error, TrainingError};
use crate::model::Seq2SeqModel;

const LAYER_NORM_EPS: f64 = 1e-5;
const MASKED: f32 = -1e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Gelu,
    Relu,
    Swish,
}

impl Activation {
    fn parse(name: &str) -> std::result::Result<Self, TrainingError> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            "swish" | "silu" => Ok(Activation::Swish),
            other => Err(TrainingError::initialization(format!(
                "unsupported activation function '{other}' (expected gelu, relu or swish)"
            ))),
        }
    }

    fn apply(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Gelu => xs.gelu_erf(),
            Activation::Relu => xs.relu(),
            Activation::Swish => xs.silu(),
        }
    }
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + LAYER_NORM_EPS)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(d_model: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_proj: candle_nn::linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(d_model, d_model, vb.pp("out_proj"))?,
            heads,
            head_dim: d_model / heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = xs.dims3()?;
        xs.reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `mask` is additive and broadcastable to `(batch, heads, query, key)`.
    fn forward(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
        dropout: Option<f32>,
    ) -> Result<Tensor> {
        let (batch, seq, d_model) = query.dims3()?;
        let scaling = (self.head_dim as f64).powf(-0.5);
        let q = self.split_heads(&self.q_proj.forward(query)?.affine(scaling, 0.0)?)?;
        let k = self.split_heads(&self.k_proj.forward(key_value)?)?;
        let v = self.split_heads(&self.v_proj.forward(key_value)?)?;

        let mut scores = q
            .matmul(&k.t()?.contiguous()?)?
            .to_dtype(DType::F32)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let mut probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;
        if let Some(p) = dropout {
            probs = candle_nn::ops::dropout(&probs, p)?;
        }
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, d_model))?;
        self.out_proj.forward(&context)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(d_model: usize, ffn_dim: usize, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(ffn_dim, d_model, vb.pp("fc2"))?,
        })
    }
}

struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

/// Post-norm transformer translation model with tied input and output
/// embeddings and sinusoidal positions.
pub struct MarianTranslator {
    varmap: VarMap,
    shared: Embedding,
    encoder_layers: Vec<EncoderLayer>,
    decoder_layers: Vec<DecoderLayer>,
    final_logits_bias: Tensor,
    positions: Tensor,
    embed_scale: f64,
    activation: Activation,
    dropout: f32,
    attention_dropout: f32,
    training: bool,
    device: Device,
}

impl MarianTranslator {
    pub fn new(hparams: &ModelHyperparameters, device: &Device) -> std::result::Result<Self, TrainingError> {
        let activation = Activation::parse(&hparams.activation)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, hparams.dtype, device);
        let model = Self::build(hparams, activation, varmap.clone(), vb, device)
            .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
        tracing::info!(
            parameters = model.parameter_count(),
            d_model = hparams.d_model,
            encoder_layers = hparams.encoder_layers,
            decoder_layers = hparams.decoder_layers,
            vocab = hparams.vocab_size,
            "built translation model"
        );
        Ok(model)
    }

    fn build(
        hparams: &ModelHyperparameters,
        activation: Activation,
        varmap: VarMap,
        vb: VarBuilder,
        device: &Device,
    ) -> Result<Self> {
        let d = hparams.d_model;
        let shared = candle_nn::embedding(hparams.vocab_size, d, vb.pp("model.shared"))?;
        let final_logits_bias =
            vb.get_with_hints((1, hparams.vocab_size), "final_logits_bias", Init::Const(0.0))?;

        let encoder_vb = vb.pp("model.encoder.layers");
        let mut encoder_layers = Vec::with_capacity(hparams.encoder_layers);
        for index in 0..hparams.encoder_layers {
            let vb = encoder_vb.pp(index.to_string());
            encoder_layers.push(EncoderLayer {
                self_attn: Attention::new(d, hparams.encoder_attention_heads, vb.pp("self_attn"))?,
                self_attn_layer_norm: LayerNorm::new(d, vb.pp("self_attn_layer_norm"))?,
                ffn: FeedForward::new(d, hparams.encoder_ffn_dim, &vb)?,
                final_layer_norm: LayerNorm::new(d, vb.pp("final_layer_norm"))?,
            });
        }

        let decoder_vb = vb.pp("model.decoder.layers");
        let mut decoder_layers = Vec::with_capacity(hparams.decoder_layers);
        for index in 0..hparams.decoder_layers {
            let vb = decoder_vb.pp(index.to_string());
            decoder_layers.push(DecoderLayer {
                self_attn: Attention::new(d, hparams.decoder_attention_heads, vb.pp("self_attn"))?,
                self_attn_layer_norm: LayerNorm::new(d, vb.pp("self_attn_layer_norm"))?,
                encoder_attn: Attention::new(
                    d,
                    hparams.decoder_attention_heads,
                    vb.pp("encoder_attn"),
                )?,
                encoder_attn_layer_norm: LayerNorm::new(d, vb.pp("encoder_attn_layer_norm"))?,
                ffn: FeedForward::new(d, hparams.decoder_ffn_dim, &vb)?,
                final_layer_norm: LayerNorm::new(d, vb.pp("final_layer_norm"))?,
            });
        }

        Ok(Self {
            varmap,
            shared,
            encoder_layers,
            decoder_layers,
            final_logits_bias,
            positions: sinusoidal_positions(hparams.max_position_embeddings, d, hparams.dtype, device)?,
            embed_scale: if hparams.scale_embedding {
                (d as f64).sqrt()
            } else {
                1.0
            },
            activation,
            dropout: hparams.dropout as f32,
            attention_dropout: hparams.attention_dropout as f32,
            training: false,
            device: device.clone(),
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    fn dropout(&self, xs: Tensor, p: f32) -> Result<Tensor> {
        if self.training && p > 0.0 {
            candle_nn::ops::dropout(&xs, p)
        } else {
            Ok(xs)
        }
    }

    fn attention_dropout(&self) -> Option<f32> {
        (self.training && self.attention_dropout > 0.0).then_some(self.attention_dropout)
    }

    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let seq = ids.dim(1)?;
        let max = self.positions.dim(0)?;
        if seq > max {
            candle_core::bail!("sequence length {seq} exceeds max_position_embeddings {max}");
        }
        let tokens = self.shared.forward(ids)?.affine(self.embed_scale, 0.0)?;
        let embedded = tokens.broadcast_add(&self.positions.narrow(0, 0, seq)?)?;
        self.dropout(embedded, self.dropout)
    }

    fn feed_forward(&self, ffn: &FeedForward, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.activation.apply(&ffn.fc1.forward(xs)?)?;
        let hidden = self.dropout(hidden, self.dropout)?;
        self.dropout(ffn.fc2.forward(&hidden)?, self.dropout)
    }

    fn run_encoder(&self, ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mask = padding_mask(attention_mask)?;
        let mut hidden = self.embed(ids)?;
        for layer in &self.encoder_layers {
            let attended = layer.self_attn.forward(
                &hidden,
                &hidden,
                Some(&mask),
                self.attention_dropout(),
            )?;
            let attended = self.dropout(attended, self.dropout)?;
            hidden = layer.self_attn_layer_norm.forward(&(hidden + attended)?)?;

            let transformed = self.feed_forward(&layer.ffn, &hidden)?;
            hidden = layer.final_layer_norm.forward(&(hidden + transformed)?)?;
        }
        Ok(hidden)
    }

    fn run_decoder(
        &self,
        encoder_output: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let seq = decoder_input_ids.dim(1)?;
        let causal = causal_mask(seq, &self.device)?;
        let cross = padding_mask(encoder_attention_mask)?;
        let mut hidden = self.embed(decoder_input_ids)?;
        for layer in &self.decoder_layers {
            let attended = layer.self_attn.forward(
                &hidden,
                &hidden,
                Some(&causal),
                self.attention_dropout(),
            )?;
            let attended = self.dropout(attended, self.dropout)?;
            hidden = layer.self_attn_layer_norm.forward(&(hidden + attended)?)?;

            let attended = layer.encoder_attn.forward(
                &hidden,
                encoder_output,
                Some(&cross),
                self.attention_dropout(),
            )?;
            let attended = self.dropout(attended, self.dropout)?;
            hidden = layer.encoder_attn_layer_norm.forward(&(hidden + attended)?)?;

            let transformed = self.feed_forward(&layer.ffn, &hidden)?;
            hidden = layer.final_layer_norm.forward(&(hidden + transformed)?)?;
        }
        hidden
            .broadcast_matmul(&self.shared.embeddings().t()?)?
            .broadcast_add(&self.final_logits_bias)
    }
}

impl Seq2SeqModel for MarianTranslator {
    fn forward(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let encoded = self.run_encoder(encoder_input_ids, encoder_attention_mask)?;
        self.run_decoder(&encoded, encoder_attention_mask, decoder_input_ids)
    }

    fn encode(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
    ) -> Result<Tensor> {
        self.run_encoder(encoder_input_ids, encoder_attention_mask)
    }

    fn decode_logits(
        &mut self,
        encoder_output: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        self.run_decoder(encoder_output, encoder_attention_mask, decoder_input_ids)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// `(batch, seq)` 1/0 mask to an additive `(batch, 1, 1, seq)` f32 mask.
fn padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq) = attention_mask.dims2()?;
    attention_mask
        .to_dtype(DType::F32)?
        .affine(-(MASKED as f64), MASKED as f64)?
        .reshape((batch, 1, 1, seq))
}

fn causal_mask(seq: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..seq)
        .flat_map(|row| (0..seq).map(move |col| if col > row { MASKED } else { 0.0 }))
        .collect();
    Tensor::from_vec(values, (1, 1, seq, seq), device)
}

/// Marian's non-interleaved table: sines in the first half, cosines after.
fn sinusoidal_positions(max: usize, dim: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let sines = (dim + 1) / 2;
    let mut table = vec![0f32; max * dim];
    for pos in 0..max {
        for j in 0..dim {
            let pair = (j / 2) * 2;
            let angle = pos as f64 / 10_000f64.powf(pair as f64 / dim as f64);
            let (column, value) = if j % 2 == 0 {
                (j / 2, angle.sin())
            } else {
                (sines + j / 2, angle.cos())
            };
            table[pos * dim + column] = value as f32;
        }
    }
    Tensor::from_vec(table, (max, dim), device)?.to_dtype(dtype)
}

/// Sum of all parameters, for cheap equality checks in logs and tests.
pub fn parameter_checksum(model: &dyn Seq2SeqModel) -> std::result::Result<f64, TrainingError> {
    let mut total = 0f64;
    for (_, var) in model.parameters() {
        total += var
            .as_tensor()
            .to_dtype(DType::F64)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_vec0::<f64>())
            .map_err(to_runtime_error)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hparams() -> ModelHyperparameters {
        ModelHyperparameters {
            vocab_size: 20,
            d_model: 8,
            encoder_layers: 1,
            decoder_layers: 1,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: 16,
            decoder_ffn_dim: 16,
            max_position_embeddings: 32,
            activation: "swish".to_string(),
            scale_embedding: true,
            dropout: 0.1,
            attention_dropout: 0.1,
            dtype: DType::F32,
        }
    }

    fn ids(rows: Vec<Vec<u32>>) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        let count = flat.len() / width;
        Tensor::from_vec(flat, (count, width), &Device::Cpu).unwrap()
    }

    #[test]
    fn parameter_names_follow_marian_checkpoints() {
        let model = MarianTranslator::new(&hparams(), &Device::Cpu).unwrap();
        let names: Vec<String> = model.parameters().into_iter().map(|(n, _)| n).collect();
        for expected in [
            "final_logits_bias",
            "model.shared.weight",
            "model.encoder.layers.0.self_attn.q_proj.weight",
            "model.encoder.layers.0.final_layer_norm.bias",
            "model.decoder.layers.0.encoder_attn.out_proj.bias",
            "model.decoder.layers.0.encoder_attn_layer_norm.weight",
            "model.decoder.layers.0.fc2.weight",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn padding_does_not_change_logits() {
        let mut model = MarianTranslator::new(&hparams(), &Device::Cpu).unwrap();
        let decoder = ids(vec![vec![3, 9, 4]]);

        let short = ids(vec![vec![5, 6, 7]]);
        let short_mask = ids(vec![vec![1, 1, 1]]);
        let padded = ids(vec![vec![5, 6, 7, 0, 0]]);
        let padded_mask = ids(vec![vec![1, 1, 1, 0, 0]]);

        let a = model.forward(&short, &short_mask, &decoder).unwrap();
        let b = model.forward(&padded, &padded_mask, &decoder).unwrap();
        assert_eq!(a.dims(), &[1, 3, 20]);
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "padding leaked into logits: {diff}");
    }

    #[test]
    fn decoder_is_causal() {
        let mut model = MarianTranslator::new(&hparams(), &Device::Cpu).unwrap();
        let source = ids(vec![vec![5, 6, 7]]);
        let mask = ids(vec![vec![1, 1, 1]]);
        let encoded = model.encode(&source, &mask).unwrap();

        let prefix = model
            .decode_logits(&encoded, &mask, &ids(vec![vec![3, 9]]))
            .unwrap();
        let longer = model
            .decode_logits(&encoded, &mask, &ids(vec![vec![3, 9, 11]]))
            .unwrap()
            .narrow(1, 0, 2)
            .unwrap();
        let diff = (prefix - longer)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn gradients_reach_every_layer_norm() {
        let mut model = MarianTranslator::new(&hparams(), &Device::Cpu).unwrap();
        model.set_training(true);
        let logits = model
            .forward(
                &ids(vec![vec![5, 6, 7], vec![8, 9, 0]]),
                &ids(vec![vec![1, 1, 1], vec![1, 1, 0]]),
                &ids(vec![vec![3, 9], vec![3, 10]]),
            )
            .unwrap();
        let loss = logits.sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();
        for (name, var) in model.parameters() {
            if name.contains("layer_norm") || name.contains("q_proj") {
                assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
            }
        }
    }

    #[test]
    fn unknown_activation_is_rejected() {
        let mut cfg = hparams();
        cfg.activation = "tanh".to_string();
        assert!(MarianTranslator::new(&cfg, &Device::Cpu).is_err());
    }
}
