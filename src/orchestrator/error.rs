use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{bus::BusError, orchestrator::types::ProcessorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorErrorKind {
    Validation,
    NotFound,
    Conflict,
    BusTransient,
    BusFatal,
    ProcessorUnavailable,
    CircuitOpen,
    NoEligibleProcessor,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorError {
    pub kind: OrchestratorErrorKind,
    pub message: String,
    pub retryable: bool,
    pub processor_id: Option<ProcessorId>,
}

impl OrchestratorError {
    pub fn new(kind: OrchestratorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(
                kind,
                OrchestratorErrorKind::BusTransient
                    | OrchestratorErrorKind::ProcessorUnavailable
                    | OrchestratorErrorKind::NoEligibleProcessor
            ),
            processor_id: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_processor_id(mut self, processor_id: impl Into<String>) -> Self {
        self.processor_id = Some(processor_id.into());
        self
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.processor_id {
            Some(processor_id) => write!(f, "{} (processor={})", self.message, processor_id),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<BusError> for OrchestratorError {
    fn from(err: BusError) -> Self {
        let kind = if err.is_fatal() {
            OrchestratorErrorKind::BusFatal
        } else {
            OrchestratorErrorKind::BusTransient
        };
        OrchestratorError::new(kind, err.message)
    }
}

pub fn validation_error(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::new(OrchestratorErrorKind::Validation, message).with_retryable(false)
}

pub fn not_found(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::new(OrchestratorErrorKind::NotFound, message).with_retryable(false)
}

pub fn conflict(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::new(OrchestratorErrorKind::Conflict, message).with_retryable(false)
}

pub fn circuit_open(processor_id: impl Into<String>) -> OrchestratorError {
    let processor_id = processor_id.into();
    OrchestratorError::new(
        OrchestratorErrorKind::CircuitOpen,
        format!("circuit breaker is open for processor '{processor_id}'"),
    )
    .with_retryable(false)
    .with_processor_id(processor_id)
}

pub fn no_eligible_processor(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::new(OrchestratorErrorKind::NoEligibleProcessor, message)
}

pub fn internal_error(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::new(OrchestratorErrorKind::Internal, message).with_retryable(false)
}
