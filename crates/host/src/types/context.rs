//! Workflow and caller identity, passed explicitly through call boundaries.

use serde::{Deserialize, Serialize};

/// Identity of the end user on whose behalf a call chain runs.
///
/// Set by the inbound edge of the host and handed down explicitly; nothing
/// in this crate reads identity from ambient task or thread state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub provider_subject_id: String,
}

impl CallerContext {
    pub fn new(provider_subject_id: impl Into<String>) -> Self {
        Self {
            provider_subject_id: provider_subject_id.into(),
        }
    }
}

/// The unit-of-work identity a plugin instance is initialized against.
///
/// Two contexts with the same `workflow_id` are the same context for
/// initialization idempotency; the caller identity rides along for
/// per-connection authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerContext>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            caller: None,
        }
    }

    pub fn with_caller(workflow_id: impl Into<String>, caller: CallerContext) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            caller: Some(caller),
        }
    }

    /// The caller's provider subject id, when one was attached.
    pub fn caller_identity(&self) -> Option<&str> {
        self.caller.as_ref().map(|c| c.provider_subject_id.as_str())
    }
}
