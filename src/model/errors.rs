use thiserror::Error;

use crate::model::{ContainerType, Id, Slot};

/// Errors raised by typed stacks and the registry.
///
/// Load-time problems are not represented here; the loader logs and skips
/// bad files instead of propagating.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("cannot place container {container_id} of type {actual} into slot {slot:?} expecting {expected}")]
    InvalidContainer {
        container_id: Id,
        slot: Slot,
        expected: ContainerType,
        actual: String,
    },

    #[error("operation not allowed on a fixed-slot stack: {0}")]
    InvalidOperation(String),

    #[error("stack {0} does not have a definition")]
    InvalidContainerStack(Id),

    #[error("stack {stack_id} cannot hold more than {max} extruders")]
    TooManyExtruders { stack_id: Id, max: usize },

    #[error("extruder {0} is missing its global stack")]
    NoGlobalStack(Id),
}

/// Errors raised while decoding or encoding persisted container files.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("malformed INI data: {0}")]
    Ini(String),

    #[error("malformed JSON definition: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required section [{0}]")]
    MissingSection(&'static str),

    #[error("missing required field {0}")]
    MissingField(&'static str),
}
