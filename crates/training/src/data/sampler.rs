use std::sync::Arc;

use candle_core::Device;
use futures::future::BoxFuture;
use parallel_data::{CorpusCycler, LanguagePair, ParallelCorpus, ParallelExample};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::masking::{MaskRatio, SpanMasker};
use super::sampling::SamplingDistribution;
use super::{attention_mask, pad_rows, Batch, DataLoader, HostBatch, Result};
use crate::config::TrainingConfig;
use crate::error::TrainingError;
use crate::tokenizer::{language_tag, TextTokenizer, EOS_TOKEN};

/// Consecutive degenerate draws tolerated before the corpora are declared unusable.
const MAX_CONSECUTIVE_REJECTIONS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Stop growing a batch once `max(enc_len, dec_len) * examples` exceeds this.
    pub batch_tokens: usize,
    pub max_src_length: usize,
    pub max_tgt_length: usize,
    pub is_summarization: bool,
    pub mask_ratio: MaskRatio,
    pub always_mask_bilingual: bool,
    pub pad_id: u32,
}

impl SamplerSettings {
    pub fn from_config(config: &TrainingConfig, pad_id: u32) -> Self {
        Self {
            batch_tokens: config.data.batch_tokens,
            max_src_length: config.data.max_src_length,
            max_tgt_length: config.data.max_tgt_length,
            is_summarization: config.data.is_summarization,
            mask_ratio: config.masking.ratio,
            always_mask_bilingual: config.masking.always_mask_bilingual,
            pad_id,
        }
    }
}

/// Counters reported alongside training metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub batches: usize,
    pub examples: usize,
    pub rejected: usize,
    pub masked_examples: usize,
}

struct Example {
    pair: LanguagePair,
    source: Vec<String>,
    target: Vec<String>,
}

/// Endless token-budgeted batches drawn across language pairs.
///
/// Each pair owns one [`CorpusCycler`]; pairs are picked independently per
/// example from a temperature-smoothed distribution.
pub struct MultilingualBatchSampler {
    streams: Vec<CorpusCycler<ParallelExample>>,
    distribution: SamplingDistribution,
    tokenizer: Arc<dyn TextTokenizer>,
    masker: SpanMasker,
    settings: SamplerSettings,
    rng: StdRng,
    device: Device,
    stats: SamplerStats,
}

impl MultilingualBatchSampler {
    /// `corpora` must be listed in the same order as `distribution.pairs()`.
    pub fn new(
        corpora: Vec<ParallelCorpus>,
        distribution: SamplingDistribution,
        tokenizer: Arc<dyn TextTokenizer>,
        masker: SpanMasker,
        settings: SamplerSettings,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        if settings.batch_tokens == 0 {
            return Err(TrainingError::initialization(
                "batch token budget must be greater than zero",
            ));
        }
        if corpora.len() != distribution.pairs().len()
            || corpora
                .iter()
                .zip(distribution.pairs())
                .any(|(corpus, pair)| corpus.pair() != pair)
        {
            return Err(TrainingError::initialization(
                "sampling distribution does not match the training corpora",
            ));
        }

        let mut streams = Vec::with_capacity(corpora.len());
        for (index, corpus) in corpora.into_iter().enumerate() {
            let label = corpus.pair().id();
            // Every stream shuffles independently of the pair draws.
            let stream_seed = seed.wrapping_add(1 + index as u64);
            let stream = CorpusCycler::new(label, corpus.into_examples(), stream_seed)?;
            tracing::info!(
                pair = stream.label(),
                examples = stream.len(),
                probability = distribution.probabilities()[index],
                "registered training stream"
            );
            streams.push(stream);
        }

        Ok(Self {
            streams,
            distribution,
            tokenizer,
            masker,
            settings,
            rng: StdRng::seed_from_u64(seed),
            device,
            stats: SamplerStats::default(),
        })
    }

    /// Builds the distribution from corpus sizes and the given temperature.
    pub fn from_corpora(
        corpora: Vec<ParallelCorpus>,
        temperature: f64,
        tokenizer: Arc<dyn TextTokenizer>,
        masker: SpanMasker,
        settings: SamplerSettings,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        let counts: Vec<(LanguagePair, usize)> = corpora
            .iter()
            .map(|corpus| (corpus.pair().clone(), corpus.len()))
            .collect();
        let distribution = SamplingDistribution::from_counts(&counts, temperature)?;
        Self::new(
            corpora,
            distribution,
            tokenizer,
            masker,
            settings,
            device,
            seed,
        )
    }

    pub fn distribution(&self) -> &SamplingDistribution {
        &self.distribution
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    pub fn epochs(&self) -> Vec<(String, usize)> {
        self.streams
            .iter()
            .map(|stream| (stream.label().to_string(), stream.epoch()))
            .collect()
    }

    /// Draws until an example with at least two words on both sides comes up,
    /// then truncates both sides to the configured word limits.
    fn draw_example(&mut self) -> Result<Example> {
        for _ in 0..MAX_CONSECUTIVE_REJECTIONS {
            let index = self.distribution.sample(&mut self.rng);
            let example = self.streams[index].next_item();

            let mut source: Vec<String> =
                example.source.split_whitespace().map(str::to_string).collect();
            let mut target: Vec<String> =
                example.target.split_whitespace().map(str::to_string).collect();

            if source.len() <= 1 || target.len() <= 1 {
                self.stats.rejected += 1;
                continue;
            }

            source.truncate(self.settings.max_src_length);
            target.truncate(self.settings.max_tgt_length);

            return Ok(Example {
                pair: self.distribution.pairs()[index].clone(),
                source,
                target,
            });
        }

        Err(TrainingError::runtime(format!(
            "{MAX_CONSECUTIVE_REJECTIONS} consecutive examples had one word or fewer on a side"
        )))
    }

    fn should_mask(&self, pair: &LanguagePair) -> bool {
        (pair.is_monolingual() && !self.settings.is_summarization)
            || self.settings.always_mask_bilingual
    }

    fn mask_source(&mut self, source: &mut Vec<String>) {
        let ratio = if self.settings.always_mask_bilingual {
            let low = self.settings.mask_ratio.low();
            if low > 0.0 {
                self.rng.gen_range(0.0..low)
            } else {
                0.0
            }
        } else {
            self.settings.mask_ratio.sample(&mut self.rng)
        };

        let outcome = self.masker.mask(source, ratio, &mut self.rng);
        if outcome.spans > 0 {
            self.stats.masked_examples += 1;
        }
    }

    pub fn next_host_batch(&mut self) -> Result<HostBatch> {
        let mut encoder_rows = Vec::new();
        let mut decoder_rows = Vec::new();
        let mut label_rows = Vec::new();
        let mut pairs = Vec::new();
        let mut max_encoder_len = 0usize;
        // Decoder inputs and labels share one width; a subword tokenizer can
        // make a label row longer than its decoder row.
        let mut max_target_len = 0usize;

        loop {
            let Example {
                pair,
                mut source,
                target,
            } = self.draw_example()?;

            if self.should_mask(&pair) {
                self.mask_source(&mut source);
            }

            let source = source.join(" ");
            let target = target.join(" ");
            let encoder_text = format!("{source} {EOS_TOKEN} {}", language_tag(&pair.source));
            let decoder_text = format!("{} {target}", language_tag(&pair.target));
            let label_text = format!("{target} {EOS_TOKEN}");

            let encoder_ids = self.tokenizer.encode(&encoder_text, false)?;
            let decoder_ids = self.tokenizer.encode(&decoder_text, false)?;
            let label_ids = self.tokenizer.encode(&label_text, false)?;

            max_encoder_len = max_encoder_len.max(encoder_ids.len());
            max_target_len = max_target_len
                .max(decoder_ids.len())
                .max(label_ids.len());

            encoder_rows.push(encoder_ids);
            decoder_rows.push(decoder_ids);
            label_rows.push(label_ids);
            pairs.push(pair);

            // The example that crosses the budget stays in the batch.
            if max_encoder_len.max(max_target_len) * pairs.len() > self.settings.batch_tokens {
                break;
            }
        }

        let pad = self.settings.pad_id;
        let encoder_input_ids = pad_rows(
            &encoder_rows,
            max_encoder_len,
            self.settings.max_src_length,
            pad,
        );
        let decoder_input_ids = pad_rows(
            &decoder_rows,
            max_target_len,
            self.settings.max_tgt_length,
            pad,
        );
        let labels = pad_rows(
            &label_rows,
            max_target_len,
            self.settings.max_tgt_length,
            pad,
        );
        let encoder_attention_mask = attention_mask(&encoder_input_ids, pad);
        let target_tokens = labels.iter().flatten().filter(|&&id| id != pad).count();

        self.stats.batches += 1;
        self.stats.examples += pairs.len();

        Ok(HostBatch {
            encoder_input_ids,
            encoder_attention_mask,
            decoder_input_ids,
            labels,
            pairs,
            target_tokens,
        })
    }
}

impl DataLoader for MultilingualBatchSampler {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move {
            let host = self.next_host_batch()?;
            host.to_tensors(&self.device).map(Some)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BlockingDataLoader;
    use crate::tokenizer::word_level_tokenizer;

    const WORDS: &[&str] = &[
        "<2en>", "<2hi>", "<2ta>", "a", "b", "c", "d", "e", "f", "g", "h", "lonely",
    ];

    fn tokenizer() -> Arc<dyn TextTokenizer> {
        Arc::new(word_level_tokenizer(WORDS))
    }

    fn corpus(src: &str, tgt: &str, lines: &[(&str, &str)]) -> ParallelCorpus {
        ParallelCorpus::new(
            LanguagePair::new(src, tgt),
            lines
                .iter()
                .map(|(s, t)| ParallelExample {
                    source: s.to_string(),
                    target: t.to_string(),
                })
                .collect(),
        )
    }

    fn settings(batch_tokens: usize) -> SamplerSettings {
        SamplerSettings {
            batch_tokens,
            max_src_length: 8,
            max_tgt_length: 8,
            is_summarization: false,
            mask_ratio: MaskRatio::Range(0.3, 0.4),
            always_mask_bilingual: false,
            pad_id: 0,
        }
    }

    fn sampler(corpora: Vec<ParallelCorpus>, settings: SamplerSettings) -> MultilingualBatchSampler {
        MultilingualBatchSampler::from_corpora(
            corpora,
            5.0,
            tokenizer(),
            SpanMasker::new(3.5, 1000, "[MASK]").unwrap(),
            settings,
            Device::Cpu,
            7,
        )
        .unwrap()
    }

    fn bilingual() -> Vec<ParallelCorpus> {
        vec![
            corpus(
                "en",
                "hi",
                &[("a b c", "d e"), ("a b c d e f", "g h a"), ("b c", "d e f g h")],
            ),
            corpus("en", "ta", &[("h g f e", "d c b"), ("a a", "b b")]),
        ]
    }

    #[test]
    fn batches_stay_within_one_example_of_budget() {
        let budget = 24;
        let mut sampler = sampler(bilingual(), settings(budget));
        for _ in 0..200 {
            let batch = sampler.next_host_batch().unwrap();
            assert!(!batch.is_empty());

            let without_last = {
                let rows = batch.len() - 1;
                let enc = batch.encoder_input_ids[..rows]
                    .iter()
                    .map(|row| row.iter().filter(|&&id| id != 0).count())
                    .max()
                    .unwrap_or(0);
                let dec = batch.decoder_input_ids[..rows]
                    .iter()
                    .map(|row| row.iter().filter(|&&id| id != 0).count())
                    .max()
                    .unwrap_or(0);
                enc.max(dec) * rows
            };
            assert!(without_last <= budget);
            assert!(batch.padded_tokens() > budget);
        }
    }

    #[test]
    fn rows_share_widths_and_respect_maxima() {
        let mut config = settings(64);
        config.max_src_length = 4;
        config.max_tgt_length = 3;
        let mut sampler = sampler(bilingual(), config);

        for _ in 0..50 {
            let batch = sampler.next_host_batch().unwrap();
            let enc = batch.encoder_len();
            let dec = batch.decoder_len();
            assert!(enc <= 4 && dec <= 3);
            assert!(batch.encoder_input_ids.iter().all(|row| row.len() == enc));
            assert!(batch.encoder_attention_mask.iter().all(|row| row.len() == enc));
            assert!(batch.decoder_input_ids.iter().all(|row| row.len() == dec));
            assert!(batch.labels.iter().all(|row| row.len() == dec));
            assert_eq!(batch.pairs.len(), batch.len());
        }
    }

    #[test]
    fn strings_carry_language_tags_and_eos() {
        let tok = word_level_tokenizer(WORDS);
        let id = |word: &str| tok.token_to_id(word).unwrap();
        let corpora = vec![corpus("en", "hi", &[("a b", "c d")])];
        let mut sampler = sampler(corpora, settings(1));

        let batch = sampler.next_host_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.encoder_input_ids[0],
            vec![id("a"), id("b"), id("</s>"), id("<2en>")]
        );
        assert_eq!(batch.decoder_input_ids[0], vec![id("<2hi>"), id("c"), id("d")]);
        assert_eq!(batch.labels[0], vec![id("c"), id("d"), id("</s>")]);
        assert_eq!(batch.encoder_attention_mask[0], vec![1, 1, 1, 1]);
        assert_eq!(batch.target_tokens, 3);
    }

    #[test]
    fn single_word_sides_never_reach_a_batch() {
        let tok = word_level_tokenizer(WORDS);
        let lonely = tok.token_to_id("lonely").unwrap();
        let corpora = vec![
            corpus(
                "en",
                "hi",
                &[("lonely", "a b"), ("a b", "c d"), ("c d e", "lonely"), ("", "e f")],
            ),
            corpus("en", "ta", &[("lonely", "g h"), ("g h", "a b c")]),
        ];
        let mut sampler = sampler(corpora, settings(16));

        for _ in 0..10_000 {
            let batch = sampler.next_host_batch().unwrap();
            for row in batch.encoder_input_ids.iter().chain(batch.labels.iter()) {
                assert!(!row.contains(&lonely));
            }
        }
        assert!(sampler.stats().rejected > 0);
    }

    #[test]
    fn monolingual_sources_are_masked() {
        let corpora = vec![corpus(
            "hi",
            "hi",
            &[("a b c d e f g h", "a b c d e f g h")],
        )];
        let mut config = settings(1);
        config.mask_ratio = MaskRatio::Fixed(0.5);
        let mut sampler = sampler(corpora, config);

        let tok = word_level_tokenizer(WORDS);
        let mask = tok.token_to_id("[MASK]").unwrap();
        let mut masked = 0;
        for _ in 0..50 {
            let batch = sampler.next_host_batch().unwrap();
            if batch.encoder_input_ids[0].contains(&mask) {
                masked += 1;
            }
            assert!(!batch.labels[0].contains(&mask));
        }
        assert!(masked > 40);
        assert_eq!(sampler.stats().masked_examples, masked);
    }

    #[test]
    fn summarization_disables_monolingual_masking() {
        let corpora = vec![corpus("en", "en", &[("a b c d e f g h", "a b")])];
        let mut config = settings(1);
        config.is_summarization = true;
        config.mask_ratio = MaskRatio::Fixed(0.5);
        let mut sampler = sampler(corpora, config);
        for _ in 0..20 {
            sampler.next_host_batch().unwrap();
        }
        assert_eq!(sampler.stats().masked_examples, 0);
    }

    #[test]
    fn loader_yields_tensor_batches() {
        let mut loader = BlockingDataLoader::new(sampler(bilingual(), settings(32)));
        let batch = loader.next_batch().unwrap().unwrap();
        let (rows, _) = batch.encoder_input_ids.dims2().unwrap();
        assert_eq!(rows, batch.examples());
        assert_eq!(batch.labels.dims(), batch.decoder_input_ids.dims());
    }

    #[test]
    fn always_mask_bilingual_draws_below_the_low_ratio() {
        let corpora = vec![corpus("en", "hi", &[("a b c d e f g h a b", "c d e")])];
        let mut config = settings(1);
        config.max_src_length = 16;
        config.always_mask_bilingual = true;
        let mut sampler = sampler(corpora, config);

        let tok = word_level_tokenizer(WORDS);
        let mask = tok.token_to_id("[MASK]").unwrap();
        let mut masked = 0;
        for _ in 0..500 {
            let batch = sampler.next_host_batch().unwrap();
            let row = &batch.encoder_input_ids[0];
            let masks = row.iter().filter(|&&id| id == mask).count();
            // Ten words plus `</s>` and the language tag.
            let kept_words = row.iter().filter(|&&id| id != 0).count() - 2 - masks;
            let removed = 10 - kept_words;
            // The ratio is drawn from [0, 0.3), so at most two of ten words go.
            assert!(removed <= 2, "removed {removed} words");
            if masks > 0 {
                masked += 1;
                assert!(removed >= masks);
            }
        }
        assert!(masked > 0);
        assert_eq!(sampler.stats().masked_examples, masked);
    }

    /// Splits `</s>` into two ids when it ends a text, the way a subword
    /// vocabulary can tokenize a label row longer than its decoder row.
    struct SplitEos {
        inner: tokenizers::Tokenizer,
        extra: u32,
    }

    impl TextTokenizer for SplitEos {
        fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
            let mut ids = TextTokenizer::encode(&self.inner, text, add_special_tokens)?;
            if text.ends_with(EOS_TOKEN) {
                let last = ids.len() - 1;
                ids.insert(last, self.extra);
            }
            Ok(ids)
        }

        fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
            TextTokenizer::decode(&self.inner, ids, skip_special_tokens)
        }

        fn token_id(&self, token: &str) -> Option<u32> {
            self.inner.token_id(token)
        }

        fn vocab_size(&self) -> usize {
            self.inner.vocab_size()
        }
    }

    #[test]
    fn labels_longer_than_decoder_rows_keep_their_eos() {
        let inner = word_level_tokenizer(WORDS);
        let id = |word: &str| inner.token_to_id(word).unwrap();
        let (extra, eos, tag, c, d) = (id("h"), id("</s>"), id("<2hi>"), id("c"), id("d"));
        let tokenizer: Arc<dyn TextTokenizer> = Arc::new(SplitEos { inner, extra });
        let mut sampler = MultilingualBatchSampler::from_corpora(
            vec![corpus("en", "hi", &[("a b", "c d")])],
            1.0,
            tokenizer,
            SpanMasker::new(3.5, 10, "[MASK]").unwrap(),
            settings(1),
            Device::Cpu,
            0,
        )
        .unwrap();

        let batch = sampler.next_host_batch().unwrap();
        assert_eq!(batch.labels[0], vec![c, d, extra, eos]);
        assert_eq!(batch.decoder_input_ids[0], vec![tag, c, d, 0]);
        assert_eq!(batch.target_tokens, 4);
    }

    #[test]
    fn mismatched_distribution_is_rejected() {
        let counts = vec![(LanguagePair::new("en", "ta"), 2)];
        let distribution = SamplingDistribution::from_counts(&counts, 1.0).unwrap();
        let result = MultilingualBatchSampler::new(
            vec![corpus("en", "hi", &[("a b", "c d")])],
            distribution,
            tokenizer(),
            SpanMasker::new(3.5, 10, "[MASK]").unwrap(),
            settings(8),
            Device::Cpu,
            0,
        );
        assert!(result.is_err());
    }
}
