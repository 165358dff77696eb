//! Error taxonomy for inspection operations
//!
//! Every public operation on [`Inspector`](crate::Inspector) returns an
//! [`InspectError`]. Each variant maps to a stable [`ErrorKind`] code so a
//! request layer can branch on it without parsing messages.

use thiserror::Error;

/// Result alias for inspection operations
pub type Result<T> = std::result::Result<T, InspectError>;

/// Failures raised by the inspection API
#[derive(Error, Debug)]
pub enum InspectError {
    /// Layer, parameter or model name could not be resolved
    #[error("not found: {0}")]
    NotFound(String),

    /// The layer exists but does not own the expected parameter
    #[error("layer '{layer}' has no {param} parameter")]
    MissingParameter { layer: String, param: String },

    /// An index exceeds the addressed dimension
    #[error("{what} index {index} out of range (size {size})")]
    OutOfRange {
        what: String,
        index: usize,
        size: usize,
    },

    /// Timesteps are 1-indexed word counts
    #[error("invalid timestep {0}: must be >= 1")]
    InvalidTimestep(i64),

    /// An override was requested before any prompt was established
    #[error("no prompt established; generate before overriding activations")]
    EmptyContext,

    /// The hook was attached but the module never ran its forward
    #[error("no activation captured for '{0}': module never ran during the forward pass")]
    CaptureFailed(String),

    /// The underlying decode raised
    #[error("generation failed: {0}")]
    GenerationFailure(String),

    /// Runtime failure (tensor op, I/O, download)
    #[error(transparent)]
    Backend(anyhow::Error),
}

/// Stable classification of [`InspectError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    MissingParameter,
    OutOfRange,
    InvalidTimestep,
    EmptyContext,
    CaptureFailed,
    GenerationFailure,
    Backend,
}

impl ErrorKind {
    /// Machine-readable status code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::MissingParameter => "missing_parameter",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::InvalidTimestep => "invalid_timestep",
            ErrorKind::EmptyContext => "empty_context",
            ErrorKind::CaptureFailed => "capture_failed",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::Backend => "backend",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl InspectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectError::NotFound(_) => ErrorKind::NotFound,
            InspectError::MissingParameter { .. } => ErrorKind::MissingParameter,
            InspectError::OutOfRange { .. } => ErrorKind::OutOfRange,
            InspectError::InvalidTimestep(_) => ErrorKind::InvalidTimestep,
            InspectError::EmptyContext => ErrorKind::EmptyContext,
            InspectError::CaptureFailed(_) => ErrorKind::CaptureFailed,
            InspectError::GenerationFailure(_) => ErrorKind::GenerationFailure,
            InspectError::Backend(_) => ErrorKind::Backend,
        }
    }

    pub(crate) fn out_of_range(what: impl Into<String>, index: usize, size: usize) -> Self {
        InspectError::OutOfRange {
            what: what.into(),
            index,
            size,
        }
    }

    pub(crate) fn missing_parameter(layer: &str, param: &str) -> Self {
        InspectError::MissingParameter {
            layer: layer.to_string(),
            param: param.to_string(),
        }
    }
}

/// Typed errors raised inside hooks or model code travel as `anyhow::Error`;
/// recover them here instead of flattening everything into `Backend`.
impl From<anyhow::Error> for InspectError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<InspectError>() {
            Ok(typed) => typed,
            Err(other) => InspectError::Backend(other),
        }
    }
}

impl From<candle_core::Error> for InspectError {
    fn from(err: candle_core::Error) -> Self {
        InspectError::Backend(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_distinct() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::MissingParameter,
            ErrorKind::OutOfRange,
            ErrorKind::InvalidTimestep,
            ErrorKind::EmptyContext,
            ErrorKind::CaptureFailed,
            ErrorKind::GenerationFailure,
            ErrorKind::Backend,
        ];
        let codes: HashSet<&str> = kinds.iter().map(ErrorKind::code).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_downcast_preserves_kind() {
        let wrapped = anyhow::Error::new(InspectError::out_of_range("unit", 9, 4));
        let err: InspectError = wrapped.context("while running hook").into();
        // context() wraps the typed error; downcast still finds it
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err: InspectError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_display_messages() {
        let err = InspectError::missing_parameter("model.norm", "bias");
        assert_eq!(err.to_string(), "layer 'model.norm' has no bias parameter");
        assert_eq!(InspectError::InvalidTimestep(0).kind().code(), "invalid_timestep");
    }
}
