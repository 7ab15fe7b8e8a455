use crate::{gemm::GemmBlocking, ir::SizeVar};

/// Errors raised while generating a kernel.
///
/// Every variant is a static error in the generator or in its inputs, generation is never retried.
#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("Placeholder {0} is already registered")]
    DuplicatePlaceholder(String),

    #[error("Size variable name {name} is already bound to another symbol")]
    SizeVarInUse { name: String },

    #[error("Size variable {0} is not registered")]
    UnknownSizeVar(SizeVar),

    #[error("Size variable {var} is not an argument of {function}")]
    UnboundSizeVar { var: SizeVar, function: String },

    #[error("Buffer {0} is not an argument of the kernel")]
    UnknownBuffer(String),

    #[error("Unsupported weight layout: {0}")]
    UnsupportedLayout(String),

    #[error("Malformed shape for {name}: {reason}")]
    MalformedShape { name: String, reason: String },

    #[error("Invalid tensor rewrite: {0}")]
    InvalidRewrite(String),

    #[error("Register blocking must be positive, got {0:?}")]
    InvalidBlocking(GemmBlocking),

    #[error("The number of threads must be at least 1, got {0}")]
    InvalidThreads(usize),

    #[error("Template error: {0}")]
    Render(#[from] minijinja::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl TemplateError {
    pub(crate) fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedShape {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type of the kernel generation.
pub type Result<T> = core::result::Result<T, TemplateError>;

/// Errors raised while reading or validating a kernel configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Config error => Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Config error => File not found: {0}")]
    FileNotFound(String),

    #[error("Config error => Invalid value: {0}")]
    InvalidValue(String),
}

/// Errors raised while generating a kernel from a configuration.
#[derive(thiserror::Error, Debug)]
pub enum GenerateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}
