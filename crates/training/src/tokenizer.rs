use std::collections::BTreeMap;
use std::path::Path;

use tokenizers::{AddedToken, Tokenizer};

use crate::error::TrainingError;

pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";

/// Tag that selects the language of an encoder input or decoder prefix.
pub fn language_tag(language: &str) -> String {
    format!("<2{language}>")
}

/// Subword tokenizer boundary used by the batchers and the evaluator.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TrainingError>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TrainingError>;
    fn token_id(&self, token: &str) -> Option<u32>;
    fn vocab_size(&self) -> usize;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TrainingError> {
        let encoding = (**self)
            .encode(text, add_special_tokens)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TrainingError> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|err| TrainingError::runtime(format!("detokenization failed: {err}")))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id(token)
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// Ids of the control tokens every batch and decode depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
    pub mask: Option<u32>,
    pub language_tags: BTreeMap<String, u32>,
}

impl SpecialTokens {
    pub fn resolve(
        tokenizer: &dyn TextTokenizer,
        languages: &[String],
        mask_token: &str,
    ) -> Result<Self, TrainingError> {
        let mut missing = Vec::new();
        let mut lookup = |token: &str| {
            let id = tokenizer.token_id(token);
            if id.is_none() {
                missing.push(token.to_string());
            }
            id.unwrap_or_default()
        };

        let pad = lookup(PAD_TOKEN);
        let bos = lookup(BOS_TOKEN);
        let eos = lookup(EOS_TOKEN);
        let language_tags = languages
            .iter()
            .map(|language| (language.clone(), lookup(&language_tag(language))))
            .collect();

        if !missing.is_empty() {
            return Err(TrainingError::initialization(format!(
                "tokenizer is missing special tokens: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            pad,
            bos,
            eos,
            mask: tokenizer.token_id(mask_token),
            language_tags,
        })
    }

    pub fn language(&self, language: &str) -> Result<u32, TrainingError> {
        self.language_tags.get(language).copied().ok_or_else(|| {
            TrainingError::runtime(format!("no language tag registered for '{language}'"))
        })
    }

    pub fn is_special(&self, id: u32) -> bool {
        id == self.pad
            || id == self.bos
            || id == self.eos
            || self.mask == Some(id)
            || self.language_tags.values().any(|&tag| tag == id)
    }
}

/// Loads a tokenizer, registers the control and language-tag tokens as special
/// tokens, saves the result and returns how many tokens were newly added.
pub fn bootstrap_tokenizer(
    input: &Path,
    output: &Path,
    languages: &[String],
    mask_token: &str,
) -> Result<usize, TrainingError> {
    let mut tokenizer = load_tokenizer(input)?;

    let mut tokens = vec![
        AddedToken::from(PAD_TOKEN, true),
        AddedToken::from(BOS_TOKEN, true),
        AddedToken::from(EOS_TOKEN, true),
        AddedToken::from(mask_token.to_string(), true),
    ];
    tokens.extend(
        languages
            .iter()
            .map(|language| AddedToken::from(language_tag(language), true)),
    );

    let added = tokenizer.add_special_tokens(&tokens);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tokenizer.save(output, false).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to save tokenizer to {}: {err}",
            output.display()
        ))
    })?;

    tracing::info!(
        output = %output.display(),
        added,
        vocab = tokenizer.get_vocab_size(true),
        "saved tokenizer"
    );

    Ok(added)
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, TrainingError> {
    Tokenizer::from_file(path).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to load tokenizer {}: {err}",
            path.display()
        ))
    })
}

/// Whitespace word-level tokenizer over a fixed vocabulary, for tests.
#[cfg(test)]
pub(crate) fn word_level_tokenizer(words: &[&str]) -> Tokenizer {
    use std::str::FromStr;

    let mut vocab = serde_json::Map::new();
    let mut insert = |word: &str| {
        if !vocab.contains_key(word) {
            let id = vocab.len();
            vocab.insert(word.to_string(), serde_json::Value::from(id));
        }
    };
    for token in [PAD_TOKEN, BOS_TOKEN, EOS_TOKEN, "<unk>", "[MASK]"] {
        insert(token);
    }
    for word in words {
        insert(word);
    }

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
    Tokenizer::from_str(&json.to_string()).expect("word level tokenizer")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        word_level_tokenizer(&["<2en>", "<2hi>", "the", "cat", "sat", "on", "mat"])
    }

    #[test]
    fn resolves_control_and_language_tokens() {
        let tok = tokenizer();
        let languages = vec!["en".to_string(), "hi".to_string()];
        let special = SpecialTokens::resolve(&tok, &languages, "[MASK]").unwrap();

        assert_eq!(special.pad, 0);
        assert_eq!(special.bos, 1);
        assert_eq!(special.eos, 2);
        assert_eq!(special.mask, Some(4));
        assert_eq!(special.language("hi").unwrap(), tok.token_to_id("<2hi>").unwrap());
        assert!(special.is_special(special.language("en").unwrap()));
        assert!(!special.is_special(tok.token_to_id("cat").unwrap()));
    }

    #[test]
    fn missing_language_tags_are_reported() {
        let tok = tokenizer();
        let languages = vec!["ta".to_string(), "kn".to_string()];
        let err = SpecialTokens::resolve(&tok, &languages, "[MASK]").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("<2ta>"));
        assert!(message.contains("<2kn>"));
    }

    #[test]
    fn encode_decode_encode_is_stable() {
        let tok = tokenizer();
        let text = "the cat sat on the mat </s> <2en>";
        let ids = TextTokenizer::encode(&tok, text, false).unwrap();
        let decoded = TextTokenizer::decode(&tok, &ids, false).unwrap();
        let again = TextTokenizer::encode(&tok, &decoded, false).unwrap();
        assert_eq!(ids, again);
    }

    #[test]
    fn bootstrap_registers_language_tags() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("base.json");
        let output = dir.path().join("out/tokenizer.json");
        word_level_tokenizer(&["hello"]).save(&input, false).unwrap();

        let languages = vec!["en".to_string(), "mr".to_string()];
        let added = bootstrap_tokenizer(&input, &output, &languages, "[MASK]").unwrap();
        assert!(added >= 2);

        let reloaded = load_tokenizer(&output).unwrap();
        assert!(reloaded.token_to_id("<2mr>").is_some());
        SpecialTokens::resolve(&reloaded, &languages, "[MASK]").unwrap();
    }
}
