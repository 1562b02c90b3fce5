//! Compilation errors

use ilaot_metadata::{MetadataError, Offset};
use thiserror::Error;

use crate::config::ConfigError;
use crate::ir::VerifyError;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Unsupported construct: {construct}")]
    UnsupportedConstruct { construct: String },

    #[error("Malformed input: {message}")]
    MalformedInput { message: String },

    #[error("Generic resolution failure: {ty} still contains open generic parameters")]
    GenericResolutionFailure { ty: String },

    #[error("ABI classification error: {message}")]
    AbiClassificationError { message: String },

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid IR: {0}")]
    Verify(#[from] VerifyError),

    #[error("In {method} at IL_{offset:04x} ({instruction}): {source}")]
    Lowering {
        method: String,
        offset: Offset,
        instruction: String,
        #[source]
        source: Box<CompileError>,
    },
}

impl CompileError {
    pub fn unsupported(construct: impl Into<String>) -> Self {
        CompileError::UnsupportedConstruct { construct: construct.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        CompileError::MalformedInput { message: message.into() }
    }

    /// The innermost error, past any lowering context
    pub fn root(&self) -> &CompileError {
        match self {
            CompileError::Lowering { source, .. } => source.root(),
            other => other,
        }
    }
}
