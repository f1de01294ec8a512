use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    scheduler::AnnealOutcome,
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(cfg: &LoggingConfig) -> Self {
        Self {
            enable_stdout: cfg.enable_stdout,
            tensorboard_dir: cfg.tensorboard_dir.clone(),
            tensorboard_flush_every_n: cfg.tensorboard_flush_every_n.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }
}

/// Operator-facing progress: `tracing` events plus optional TensorBoard scalars.
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            tracing::info!(
                step,
                loss = format_args!("{:.4}", snapshot.step_loss),
                loss_ema = format_args!("{:.4}", snapshot.loss),
                acc = format_args!("{:.3}", snapshot.accuracy),
                tokens = snapshot.tokens,
                tok_per_sec = format_args!("{:.1}", snapshot.step_tokens_per_sec),
                grad_norm = format_args!("{:.3}", snapshot.raw_grad_norm),
                lr = format_args!("{:.5e}", lr),
                "train"
            );
        }

        let mut scalars = vec![
            ("train/loss", snapshot.step_loss),
            ("train/loss_ema", snapshot.loss),
            ("train/accuracy_ema", snapshot.accuracy),
            ("train/tokens_per_sec", snapshot.tokens_per_sec),
            ("train/grad_norm", snapshot.raw_grad_norm),
            ("train/learning_rate", lr),
        ];
        if let Some(entropy) = snapshot.entropy {
            scalars.push(("train/entropy", entropy));
        }
        if let Some(distillation) = snapshot.distillation {
            scalars.push(("train/distillation_loss", distillation));
        }
        self.write_scalars(step, scalars);
    }

    pub fn log_skipped_step(&mut self, step: usize, skipped_total: usize, reason: &str) {
        tracing::warn!(step, skipped_total, reason, "skipping update");
        self.write_scalars(step, [("train/skipped_steps", skipped_total as f64)]);
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        let global = summary.global_score();
        if self.settings.enable_stdout {
            tracing::info!(
                step,
                metric = summary.metric,
                global = global.unwrap_or(0.0),
                pairs = summary.pairs.len(),
                hypotheses = summary.hypotheses,
                seconds = format_args!("{:.1}", summary.elapsed.as_secs_f64()),
                "evaluation finished"
            );
        }

        let mut scalars: Vec<(String, f64)> = summary
            .pairs
            .iter()
            .map(|(pair, score)| (format!("eval/{}/{}", pair.id(), summary.metric), *score))
            .collect();
        if let Some(global) = global {
            scalars.push((format!("eval/global/{}", summary.metric), global));
        }
        self.write_scalars(step, scalars);
        self.flush();
    }

    pub fn log_annealing(&mut self, step: usize, outcome: &AnnealOutcome) {
        self.write_scalars(step, [("train/annealed_learning_rate", outcome.after)]);
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                tracing::warn!(error = %err, "tensorboard flush failed");
            }
        }
    }

    fn write_scalars<I, T>(&mut self, step: usize, scalars: I)
    where
        I: IntoIterator<Item = (T, f64)>,
        T: AsRef<str>,
    {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (tag, value) in scalars {
            if let Err(err) = writer.write_scalar(tag.as_ref(), step as i64, value) {
                tracing::warn!(error = %err, tag = tag.as_ref(), "dropping tensorboard scalar");
            }
        }
    }
}

/// TFRecord-framed `Event` protos, the format TensorBoard tails.
struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        tracing::info!(path = %path.display(), "writing tensorboard events");
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        let record = frame_record(&event.encode_to_vec());
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// `len (u64 le) | crc(len) | payload | crc(payload)`.
fn frame_record(payload: &[u8]) -> BytesMut {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
