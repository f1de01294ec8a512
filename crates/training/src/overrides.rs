//! `--override key.path=value` handling shared by the command-line tools.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::config::TrainingConfig;
use crate::error::TrainingError;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Applies every override to the serialized config and re-validates the result.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[ConfigOverride],
) -> Result<TrainingConfig, TrainingError> {
    if overrides.is_empty() {
        return Ok(config);
    }
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to serialize config for overrides: {err}"))
    })?;

    for item in overrides {
        let segments = parse_path(&item.path)?;
        assign_at_path(&mut value, &segments, parse_value(&item.value))?;
        tracing::info!(key = %item.path, value = %item.value, "config override");
    }

    let config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("config no longer deserializes after overrides: {err}"))
    })?;
    config.validate()?;
    Ok(config)
}

fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            return json;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

/// `data.train[0].source` becomes `data`, `train[0]`, `source`.
fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((key, rest)) => {
                let index = rest.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::ConfigFormat(format!(
                        "invalid index in override path '{segment}': {err}"
                    ))
                })?;
                Ok(PathSegment {
                    key: key.to_string(),
                    index: Some(index),
                })
            }
            None if segment.is_empty() => Err(TrainingError::ConfigFormat(format!(
                "override path '{path}' has an empty segment"
            ))),
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(TrainingError::ConfigFormat(format!(
            "override segment '{}' points into a non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    match segment.index {
        None => assign_at_path(entry, rest, new_value),
        Some(index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let Value::Array(items) = entry else {
                return Err(TrainingError::ConfigFormat(format!(
                    "override segment '{}' expects an array",
                    segment.key
                )));
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            assign_at_path(&mut items[index], rest, new_value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_config;

    fn overrides(items: &[&str]) -> Vec<ConfigOverride> {
        items.iter().map(|item| item.parse().unwrap()).collect()
    }

    #[test]
    fn nested_and_indexed_keys_are_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = apply_overrides(
            tiny_config(dir.path()),
            &overrides(&[
                "scheduler.warmup_steps=4",
                "scheduler.total_steps=12",
                "optimizer.learning_rate=0.001",
                "data.train[0].target_lang=ta",
                "model.d_model=32",
            ]),
        )
        .unwrap();

        assert_eq!(config.scheduler.warmup_steps, 4);
        assert_eq!(config.scheduler.total_steps, 12);
        assert_eq!(config.optimizer.learning_rate, 0.001);
        assert_eq!(config.data.train[0].target_lang, "ta");
        assert_eq!(config.model.d_model, Some(32));
    }

    #[test]
    fn total_steps_below_default_warmup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = apply_overrides(
            tiny_config(dir.path()),
            &overrides(&["scheduler.total_steps=12"]),
        );
        let Err(TrainingError::Validation(errors)) = result else {
            panic!("expected a validation error");
        };
        assert!(errors
            .iter()
            .any(|error| error.contains("warmup_steps cannot exceed")));
    }

    #[test]
    fn invalid_result_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let result = apply_overrides(
            tiny_config(dir.path()),
            &overrides(&["data.batch_tokens=0"]),
        );
        assert!(matches!(result, Err(TrainingError::Validation(_))));
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!("no-equals-sign".parse::<ConfigOverride>().is_err());
        assert!("=5".parse::<ConfigOverride>().is_err());
        let dir = tempfile::tempdir().unwrap();
        let result = apply_overrides(
            tiny_config(dir.path()),
            &overrides(&["data.train[x].source=a"]),
        );
        assert!(matches!(result, Err(TrainingError::ConfigFormat(_))));
    }
}
