//! The envelope carried through an in-process api call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One in-process call: method, payload, timestamps, and error state.
///
/// Handlers report failure by calling [`ApiCall::fail`] instead of returning
/// an error, so dispatch never unwinds through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub method: String,
    pub data: Value,
    /// Unix millis when the envelope was built.
    pub created_at: u64,
    /// Unix millis when the handler returned.
    pub updated_at: Option<u64>,
    /// Unix millis when the envelope was handed back to the caller.
    pub returned_at: Option<u64>,
    pub error: bool,
    pub errors: Vec<String>,
}

impl ApiCall {
    #[must_use]
    pub fn new(method: impl Into<String>, data: Value, created_at: u64) -> Self {
        Self {
            method: method.into(),
            data,
            created_at,
            updated_at: None,
            returned_at: None,
            error: false,
            errors: Vec::new(),
        }
    }

    /// Marks the call failed and appends `reason` to the error list.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = true;
        self.errors.push(reason.into());
    }

    /// Replaces the payload with the handler's result.
    pub fn respond(&mut self, data: Value) {
        self.data = data;
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.error
    }
}
