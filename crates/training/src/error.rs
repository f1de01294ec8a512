use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Settings that validate individually but cannot be honoured at runtime,
    /// e.g. a scheduler that never decays far enough to anneal.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

/// Failures confined to a single optimisation step. The driver logs these and
/// moves on to the next batch instead of aborting the run.
#[derive(Error, Debug)]
pub enum TrainingStepError {
    #[error("non-finite loss {0}")]
    NonFiniteLoss(f32),

    #[error("forward pass failed: {0}")]
    Forward(candle_core::Error),

    #[error("loss computation failed: {0}")]
    Loss(#[source] TrainingError),

    #[error("backward pass failed: {0}")]
    Backward(candle_core::Error),

    #[error("batch rejected: {0}")]
    Batch(String),

    /// The update itself failed; parameters may be partially written, so the
    /// driver treats this one as fatal.
    #[error("optimizer update failed: {0}")]
    Optimizer(#[source] TrainingError),
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
