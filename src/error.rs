// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Error vocabulary of the orchestration engine, expressed in the canonical
// error space.

use canonical_error::{CanonicalError, CanonicalErrorCode,
                      data_loss_error, deadline_exceeded_error, internal_error,
                      invalid_argument_error, resource_exhausted_error};

/// Classification of a CanonicalError returned by this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allocation or queue exhaustion. Retry after backpressure clears.
    Resource,
    /// Bad scenario, index, instance or call order. Only the single operation
    /// is rejected.
    Config,
    /// Calibration blob failed validation.
    CorruptSetfile,
    /// Out-of-order completion, double frame start and the like.
    ProtocolViolation,
    /// Per-shot watchdog expired.
    Timeout,
    Other,
}

pub fn resource_error(msg: &str) -> CanonicalError {
    resource_exhausted_error(msg)
}

pub fn config_error(msg: &str) -> CanonicalError {
    invalid_argument_error(msg)
}

pub fn corrupt_setfile_error(msg: &str) -> CanonicalError {
    data_loss_error(msg)
}

pub fn protocol_violation_error(msg: &str) -> CanonicalError {
    internal_error(msg)
}

pub fn timeout_error(msg: &str) -> CanonicalError {
    deadline_exceeded_error(msg)
}

pub fn error_kind(err: &CanonicalError) -> ErrorKind {
    match err.code {
        CanonicalErrorCode::ResourceExhausted => ErrorKind::Resource,
        CanonicalErrorCode::InvalidArgument |
        CanonicalErrorCode::FailedPrecondition |
        CanonicalErrorCode::NotFound |
        CanonicalErrorCode::OutOfRange => ErrorKind::Config,
        CanonicalErrorCode::DataLoss => ErrorKind::CorruptSetfile,
        CanonicalErrorCode::Internal => ErrorKind::ProtocolViolation,
        CanonicalErrorCode::DeadlineExceeded => ErrorKind::Timeout,
        _ => ErrorKind::Other,
    }
}
