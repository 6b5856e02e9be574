use thiserror::Error;

/// Client errors, surfaced synchronously to the command's sender before any
/// state mutation. Protocol-level refusals (duplicate message id, losing a
/// correlation race) are rejection records, not errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// A required field was empty. Publishing requires a message name;
    /// subscriptions additionally require a resolved correlation key.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
