use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor};
use hex::encode as hex_encode;
use parallel_data::LanguagePair;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::to_runtime_error,
    model::Seq2SeqModel,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const ROLLING_NAME: &str = "latest";
const ROLLING_STAGING_NAME: &str = ".latest.partial";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const PURE_MODEL_SUFFIX: &str = "pure_model.safetensors";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub step: usize,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

/// Which immutable snapshot a write produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotKind {
    /// New best score for one language pair.
    Pair(LanguagePair),
    /// New best mean score across pairs.
    Global,
    /// Fixed-cadence save when evaluation is disabled.
    Periodic,
}

impl SnapshotKind {
    pub fn directory_name(&self, step: usize) -> String {
        match self {
            SnapshotKind::Pair(pair) => format!("best.{}.step_{:012}", pair.id(), step),
            SnapshotKind::Global => format!("best.global.step_{:012}", step),
            SnapshotKind::Periodic => format!("step_{:012}", step),
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Pair(pair) => write!(f, "best {pair}"),
            SnapshotKind::Global => f.write_str("best global"),
            SnapshotKind::Periodic => f.write_str("periodic"),
        }
    }
}

/// Borrowed view of everything a checkpoint record persists.
pub struct TrainingState<'a> {
    pub model: &'a dyn Seq2SeqModel,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
    pub step: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub pure_model: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: GradientScalerState,
    pub model_weights_path: PathBuf,
}

impl LoadOutcome {
    pub fn step(&self) -> usize {
        self.manifest.step
    }
}

/// Outcome of copying a weights file into live parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightLoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unused: Vec<String>,
}

/// On-disk layout of one training run: a rolling `latest/` record that is
/// replaced every cycle, plus immutable snapshots that are never overwritten.
/// Every record has a `{name}.pure_model.safetensors` sibling holding only the
/// model parameters.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    config_sha256: String,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, config: &TrainingConfig) -> Result<Self, TrainingError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            config_sha256: fingerprint_config(config)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rolling_dir(&self) -> PathBuf {
        self.root.join(ROLLING_NAME)
    }

    pub fn snapshot_dir(&self, kind: &SnapshotKind, step: usize) -> PathBuf {
        self.root.join(kind.directory_name(step))
    }

    pub fn pure_model_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{PURE_MODEL_SUFFIX}"))
    }

    pub fn has_rolling(&self) -> bool {
        self.rolling_dir().join(MANIFEST_FILENAME).is_file()
    }

    /// Replaces `latest/` with the given state. The record is staged in a
    /// sibling directory and renamed into place, so readers never observe a
    /// half-written record.
    pub fn write_rolling(
        &self,
        state: &TrainingState<'_>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let staging = self.root.join(ROLLING_STAGING_NAME);
        remove_dir_if_exists(&staging)?;
        create_dir(&staging)?;
        let manifest = self.write_record(&staging, state)?;

        let target = self.rolling_dir();
        remove_dir_if_exists(&target)?;
        rename(&staging, &target)?;

        let pure_model = self.pure_model_path(ROLLING_NAME);
        let staged_pure = self
            .root
            .join(format!("{ROLLING_STAGING_NAME}.{PURE_MODEL_SUFFIX}"));
        save_model_weights(state.model, &staged_pure)?;
        rename(&staged_pure, &pure_model)?;

        tracing::debug!(step = state.step, dir = %target.display(), "wrote rolling checkpoint");
        Ok(CheckpointDescriptor {
            directory: target,
            pure_model,
            manifest,
        })
    }

    /// Writes an immutable snapshot. An existing snapshot of the same name is
    /// an error rather than being replaced.
    pub fn write_snapshot(
        &self,
        kind: &SnapshotKind,
        state: &TrainingState<'_>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let name = kind.directory_name(state.step);
        let directory = self.root.join(&name);
        if directory.exists() {
            return Err(TrainingError::runtime(format!(
                "refusing to overwrite checkpoint snapshot {}",
                directory.display()
            )));
        }
        create_dir(&directory)?;
        let manifest = self.write_record(&directory, state)?;

        let pure_model = self.pure_model_path(&name);
        save_model_weights(state.model, &pure_model)?;

        tracing::info!(step = state.step, kind = %kind, dir = %directory.display(), "wrote checkpoint snapshot");
        Ok(CheckpointDescriptor {
            directory,
            pure_model,
            manifest,
        })
    }

    pub fn load_rolling(&self) -> Result<LoadOutcome, TrainingError> {
        let outcome = load_checkpoint(&self.rolling_dir())?;
        if outcome.manifest.config_sha256 != self.config_sha256 {
            tracing::warn!(
                dir = %outcome.directory.display(),
                "rolling checkpoint was written under a different configuration"
            );
        }
        Ok(outcome)
    }

    /// Loads `latest/` and copies it into the live training objects. Returns
    /// the restored step counter.
    pub fn restore_rolling(
        &self,
        model: &dyn Seq2SeqModel,
        optimizer: &mut TrainerOptimizer,
        scheduler: &mut dyn LRScheduler,
        scaler: &mut GradientScaler,
    ) -> Result<usize, TrainingError> {
        let outcome = self.load_rolling()?;
        apply_model_weights(model, &outcome.model_weights_path, true)?;
        optimizer.load_state(outcome.optimizer_state)?;
        scheduler.load_state(&outcome.scheduler_state)?;
        scaler.load_state(&outcome.scaler_state);
        Ok(outcome.manifest.step)
    }

    fn write_record(
        &self,
        directory: &Path,
        state: &TrainingState<'_>,
    ) -> Result<CheckpointManifest, TrainingError> {
        let model_path = directory.join(MODEL_FILENAME);
        save_model_weights(state.model, &model_path)?;

        let optimizer_path = directory.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &state.optimizer.state()?)?;

        let scheduler_path = directory.join(SCHEDULER_FILENAME);
        write_json(&scheduler_path, &state.scheduler.state())?;

        let scaler_path = directory.join(SCALER_FILENAME);
        write_json(&scaler_path, &state.scaler.state())?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            step: state.step,
            model: file_record(&model_path)?,
            optimizer: file_record(&optimizer_path)?,
            scheduler: file_record(&scheduler_path)?,
            scaler: file_record(&scaler_path)?,
        };
        write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;
        Ok(manifest)
    }
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scheduler_path = directory.join(&manifest.scheduler.filename);
    validate_file(&scheduler_path, &manifest.scheduler.sha256)?;
    let scheduler_state: SchedulerState = read_json(&scheduler_path)?;

    let scaler_path = directory.join(&manifest.scaler.filename);
    validate_file(&scaler_path, &manifest.scaler.sha256)?;
    let scaler_state: GradientScalerState = read_json(&scaler_path)?;

    Ok(LoadOutcome {
        directory: directory.to_path_buf(),
        manifest,
        optimizer_state,
        scheduler_state,
        scaler_state,
        model_weights_path: model_path,
    })
}

/// Resolves a weights location: a safetensors file is used as is, a
/// checkpoint directory contributes its `model.safetensors`.
pub fn resolve_weights_path(path: &Path) -> Result<PathBuf, TrainingError> {
    if path.is_dir() {
        let candidate = path.join(MODEL_FILENAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(TrainingError::initialization(format!(
            "no {MODEL_FILENAME} in {}",
            path.display()
        )));
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    Err(TrainingError::initialization(format!(
        "model weights not found at {}",
        path.display()
    )))
}

/// Copies tensors from a safetensors file into the model's parameters. With
/// `strict`, any missing or unused tensor is an error; otherwise the mismatch
/// is only reported.
pub fn apply_model_weights(
    model: &dyn Seq2SeqModel,
    weights_path: &Path,
    strict: bool,
) -> Result<WeightLoadReport, TrainingError> {
    let tensors = load_safetensors(weights_path, &Device::Cpu).map_err(to_runtime_error)?;
    let mut by_name: HashMap<String, Tensor> = tensors.into_iter().collect();
    let mut report = WeightLoadReport::default();

    for (name, var) in model.parameters() {
        let Some(tensor) = by_name.remove(&name) else {
            report.missing.push(name);
            continue;
        };
        let current = var.as_tensor();
        if tensor.dims() != current.dims() {
            return Err(TrainingError::runtime(format!(
                "shape mismatch for parameter {name}: checkpoint {:?}, model {:?}",
                tensor.dims(),
                current.dims()
            )));
        }
        let tensor = tensor
            .to_dtype(current.dtype())
            .and_then(|t| t.to_device(current.device()))
            .map_err(to_runtime_error)?;
        var.set(&tensor).map_err(to_runtime_error)?;
        report.loaded += 1;
    }

    report.unused = by_name.into_keys().collect();
    report.missing.sort();
    report.unused.sort();

    if strict && !(report.missing.is_empty() && report.unused.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "checkpoint {} does not match the model (missing: [{}], unused: [{}])",
            weights_path.display(),
            report.missing.join(", "),
            report.unused.join(", ")
        )));
    }
    Ok(report)
}

pub fn save_model_weights(model: &dyn Seq2SeqModel, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn create_dir(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<(), TrainingError> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to remove checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::optimizer::{AdamWConfig, TrainerOptimizerOptions};
    use crate::scheduler::{DecayShape, WarmupDecayScheduler};
    use crate::testing::{tiny_config, TinySeq2Seq};
    use tempfile::tempdir;

    struct Fixture {
        model: TinySeq2Seq,
        optimizer: TrainerOptimizer,
        scheduler: WarmupDecayScheduler,
        scaler: GradientScaler,
    }

    fn fixture(seed: u64) -> Fixture {
        let model = TinySeq2Seq::new(12, 4, seed).unwrap();
        let optimizer = TrainerOptimizer::new(
            model.parameters(),
            AdamWConfig {
                beta1: 0.9,
                beta2: 0.98,
                epsilon: 1e-8,
                weight_decay: 0.0,
            },
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scheduler =
            WarmupDecayScheduler::new(DecayShape::Linear, 1e-3, 0.0, 4, 100).unwrap();
        Fixture {
            model,
            optimizer,
            scheduler,
            scaler: GradientScaler::new(Precision::Fp32),
        }
    }

    fn state(fixture: &Fixture, step: usize) -> TrainingState<'_> {
        TrainingState {
            model: &fixture.model,
            optimizer: &fixture.optimizer,
            scheduler: &fixture.scheduler,
            scaler: &fixture.scaler,
            step,
        }
    }

    fn flat(model: &TinySeq2Seq) -> Vec<f32> {
        model
            .parameters()
            .into_iter()
            .flat_map(|(_, var)| {
                var.as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn rolling_record_is_replaced_and_restorable() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), &tiny_config(dir.path())).unwrap();
        let mut source = fixture(1);
        for _ in 0..7 {
            source.scheduler.step();
        }

        store.write_rolling(&state(&source, 5)).unwrap();
        let second = store.write_rolling(&state(&source, 7)).unwrap();
        assert_eq!(second.manifest.step, 7);
        assert!(store.has_rolling());
        assert!(store.pure_model_path(ROLLING_NAME).is_file());
        assert!(!dir.path().join(ROLLING_STAGING_NAME).exists());

        let mut target = fixture(2);
        assert_ne!(flat(&source.model), flat(&target.model));
        let step = store
            .restore_rolling(
                &target.model,
                &mut target.optimizer,
                &mut target.scheduler,
                &mut target.scaler,
            )
            .unwrap();
        assert_eq!(step, 7);
        assert_eq!(flat(&source.model), flat(&target.model));
        assert_eq!(target.scheduler.steps_taken(), 7);
    }

    #[test]
    fn snapshots_use_stable_names_and_are_never_overwritten() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), &tiny_config(dir.path())).unwrap();
        let fixture = fixture(3);
        let pair = LanguagePair::new("en", "hi");

        let written = store
            .write_snapshot(&SnapshotKind::Pair(pair.clone()), &state(&fixture, 2000))
            .unwrap();
        assert_eq!(
            written.directory.file_name().unwrap().to_str().unwrap(),
            "best.en-hi.step_000000002000"
        );
        assert!(dir
            .path()
            .join("best.en-hi.step_000000002000.pure_model.safetensors")
            .is_file());

        store
            .write_snapshot(&SnapshotKind::Global, &state(&fixture, 2000))
            .unwrap();
        assert!(dir.path().join("best.global.step_000000002000").is_dir());

        let err = store
            .write_snapshot(&SnapshotKind::Pair(pair), &state(&fixture, 2000))
            .unwrap_err();
        assert!(err.to_string().contains("refusing to overwrite"));
    }

    #[test]
    fn tampered_files_fail_validation() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), &tiny_config(dir.path())).unwrap();
        let fixture = fixture(4);
        let written = store
            .write_snapshot(&SnapshotKind::Periodic, &state(&fixture, 10_000))
            .unwrap();
        assert!(written.directory.ends_with("step_000000010000"));

        fs::write(written.directory.join(SCHEDULER_FILENAME), b"{}").unwrap();
        let err = load_checkpoint(&written.directory).err().unwrap();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn lenient_weight_loading_reports_mismatches() {
        let dir = tempdir().unwrap();
        let fixture = fixture(5);
        let path = dir.path().join("weights.safetensors");
        let mut tensors: HashMap<String, Tensor> = fixture
            .model
            .parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        let dropped = tensors.keys().next().cloned().unwrap();
        tensors.remove(&dropped);
        tensors.insert(
            "extra.weight".to_string(),
            Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let target = fixture_model(6);
        let report = apply_model_weights(&target, &path, false).unwrap();
        assert_eq!(report.missing, vec![dropped]);
        assert_eq!(report.unused, vec!["extra.weight".to_string()]);
        assert!(apply_model_weights(&target, &path, true).is_err());
    }

    fn fixture_model(seed: u64) -> TinySeq2Seq {
        TinySeq2Seq::new(12, 4, seed).unwrap()
    }
}
