use std::{fs, path::Path, sync::Arc};

use nmt_training::{
    checkpoint::{apply_model_weights, resolve_weights_path},
    decode::{decode_file, TranslationSettings},
    scoring::Bleu,
    tokenizer::{bootstrap_tokenizer, load_tokenizer, SpecialTokens, TextTokenizer},
    MarianTranslator, SingleProcess, StopReason, Trainer, TrainingConfig,
};
use parallel_data::LanguagePair;
use tempfile::tempdir;

const WORDS: [&str; 8] = ["<unk>", "red", "blue", "green", "fox", "dog", "runs", "sleeps"];

fn write_base_tokenizer(path: &Path) {
    let vocab: serde_json::Map<String, serde_json::Value> = WORDS
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), serde_json::Value::from(id)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    fs::write(path, json.to_string()).unwrap();
}

fn write_corpora(base: &Path) {
    let colours = ["red", "blue", "green"];
    let animals = ["fox", "dog"];
    let verbs = ["runs", "sleeps"];
    let mut source = Vec::new();
    let mut target = Vec::new();
    for colour in colours {
        for animal in animals {
            for verb in verbs {
                source.push(format!("{colour} {animal} {verb}"));
                target.push(format!("{animal} {colour} {verb}"));
            }
        }
    }
    fs::write(base.join("train.en"), source.join("\n")).unwrap();
    fs::write(base.join("train.hi"), target.join("\n")).unwrap();
    // Two evaluations stay within the early-stop patience of five.
    fs::write(base.join("dev.en"), "red fox runs\nblue dog sleeps\n").unwrap();
    fs::write(base.join("dev.hi"), "fox red runs\ndog blue sleeps\n").unwrap();
}

const CONFIG: &str = r#"
[model]
d_model = 16
encoder_layers = 1
decoder_layers = 1
encoder_attention_heads = 2
decoder_attention_heads = 2
encoder_ffn_dim = 32
decoder_ffn_dim = 32
max_position_embeddings = 64

[tokenizer]
tokenizer_json = "tokenizer.json"

[data]
train = [{ source_lang = "en", target_lang = "hi", source = "train.en", target = "train.hi" }]
dev = [{ source_lang = "en", target_lang = "hi", source = "dev.en", target = "dev.hi" }]
batch_tokens = 48
dev_batch_size = 2
max_src_length = 32
max_tgt_length = 32

[optimizer]
learning_rate = 0.001

[scheduler]
warmup_steps = 2
total_steps = 4

[evaluation]
enabled = true
every_n_steps = 2
beam_size = 2
early_stop_checkpoints = 5

[runtime]
checkpoint_dir = "checkpoints"
device = "cpu"
log_every_n_steps = 1

[runtime.logging]
enable_stdout = false
tensorboard_dir = "tensorboard"
"#;

fn prepare(base: &Path) -> std::path::PathBuf {
    write_corpora(base);
    let config_path = base.join("config.toml");
    fs::write(&config_path, CONFIG).unwrap();

    let base_tokenizer = base.join("base_tokenizer.json");
    write_base_tokenizer(&base_tokenizer);
    let config = TrainingConfig::load(&config_path).unwrap();
    let added = bootstrap_tokenizer(
        &base_tokenizer,
        &config.tokenizer.tokenizer_json,
        &config.languages(),
        &config.masking.mask_token,
    )
    .unwrap();
    // <pad> <s> </s> [MASK] <2en> <2hi>
    assert_eq!(added, 6);
    config_path
}

#[test]
fn train_evaluate_resume_and_decode() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();
    let config_path = prepare(base);

    let config = TrainingConfig::load(&config_path).unwrap();
    let mut trainer = Trainer::new(config, Arc::new(SingleProcess)).unwrap();
    let report = trainer.train().unwrap();

    assert_eq!(report.stop, StopReason::BudgetExhausted);
    assert_eq!(report.steps, 4);
    assert_eq!(report.skipped_steps, 0);
    assert_eq!(trainer.controller().state().global_history().len(), 2);

    let checkpoints = base.join("checkpoints");
    assert!(checkpoints.join("latest").join("manifest.json").is_file());
    assert!(checkpoints.join("latest.pure_model.safetensors").is_file());
    let tensorboard_files = fs::read_dir(base.join("tensorboard")).unwrap().count();
    assert_eq!(tensorboard_files, 1);

    let mut config = TrainingConfig::load(&config_path).unwrap();
    config.init.resume = true;
    config.scheduler.total_steps = 6;
    let mut resumed = Trainer::new(config, Arc::new(SingleProcess)).unwrap();
    assert_eq!(resumed.step(), 4);
    let report = resumed.train().unwrap();
    assert_eq!(report.steps, 6);

    let config = TrainingConfig::load(&config_path).unwrap();
    let tokenizer: Arc<dyn TextTokenizer> =
        Arc::new(load_tokenizer(&config.tokenizer.tokenizer_json).unwrap());
    let special =
        SpecialTokens::resolve(tokenizer.as_ref(), &config.languages(), &config.masking.mask_token)
            .unwrap();
    let hparams = config
        .resolve_model_hyperparameters(&config.model, tokenizer.vocab_size())
        .unwrap();
    let mut model = MarianTranslator::new(&hparams, &candle_core::Device::Cpu).unwrap();
    let weights = resolve_weights_path(&checkpoints.join("latest")).unwrap();
    let loaded = apply_model_weights(&model, &weights, true).unwrap();
    assert!(loaded.loaded > 0);

    let output = base.join("dev.hyp");
    let decoded = decode_file(
        &mut model,
        &tokenizer,
        &special,
        &config.decoding,
        &LanguagePair::new("en", "hi"),
        &base.join("dev.en"),
        &output,
        Some((&base.join("dev.hi"), &Bleu::default())),
        &TranslationSettings {
            beam_size: 2,
            batch_size: 2,
            max_src_length: 32,
        },
    )
    .unwrap();
    assert_eq!(decoded.sentences, 2);
    assert_eq!(fs::read_to_string(&output).unwrap().lines().count(), 2);
}
