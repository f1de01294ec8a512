use candle_core::{Device, Result, Tensor, Var};

/// Encoder-decoder translation model as seen by the trainer and the decoder.
///
/// Inputs are `u32` id matrices of shape `(batch, seq)`; the attention mask
/// uses 1 for real tokens and 0 for padding. Logits are `(batch, seq, vocab)`.
pub trait Seq2SeqModel: Send {
    /// Logits for a full gold decoder input.
    fn forward(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor>;

    /// Encoder hidden states, reused across decoding steps.
    fn encode(&mut self, encoder_input_ids: &Tensor, encoder_attention_mask: &Tensor)
        -> Result<Tensor>;

    /// Logits for every position of `decoder_input_ids` given encoder states.
    fn decode_logits(
        &mut self,
        encoder_output: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor>;

    /// Trainable parameters keyed by their checkpoint names.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn device(&self) -> &Device;

    /// Switches dropout-style behaviour; models without any may ignore it.
    fn set_training(&mut self, _training: bool) {}
}

impl<M: Seq2SeqModel + ?Sized> Seq2SeqModel for Box<M> {
    fn forward(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        (**self).forward(encoder_input_ids, encoder_attention_mask, decoder_input_ids)
    }

    fn encode(
        &mut self,
        encoder_input_ids: &Tensor,
        encoder_attention_mask: &Tensor,
    ) -> Result<Tensor> {
        (**self).encode(encoder_input_ids, encoder_attention_mask)
    }

    fn decode_logits(
        &mut self,
        encoder_output: &Tensor,
        encoder_attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        (**self).decode_logits(encoder_output, encoder_attention_mask, decoder_input_ids)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        (**self).parameters()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn set_training(&mut self, training: bool) {
        (**self).set_training(training)
    }
}
