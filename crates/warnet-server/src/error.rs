//! Control API errors with JSON-RPC 2.0 error codes.

use serde_json::{json, Value};
use std::fmt;
use warnet_core::error::{BackendError, SchedulerError, WarnetError};

/// Standard JSON-RPC 2.0 error codes
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Server errors (-32000 to -32099)
    pub const SERVER_ERROR: i32 = -32000;
    pub const RESOURCE_NOT_FOUND: i32 = -32001;
    /// A command inside a container exited non-zero
    pub const COMMAND_FAILED: i32 = -32002;
    pub const TIMEOUT: i32 = -32006;
    /// A channel did not confirm at its declared position
    pub const SCHEDULING_INVARIANT: i32 = -32010;
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(details: impl fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {details}"))
    }

    pub fn invalid_request(details: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {details}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(details: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {details}"))
    }

    pub fn internal(details: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {details}"))
    }

    pub fn resource_not_found(resource: impl fmt::Display) -> Self {
        Self::new(codes::RESOURCE_NOT_FOUND, format!("Resource not found: {resource}"))
    }

    /// The `error` member of a response
    pub fn to_json(&self) -> Value {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let Some(data) = &self.data {
            error["data"] = data.clone();
        }
        error
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        let message = e.to_string();
        match e {
            BackendError::Command(cmd) => Self::new(codes::COMMAND_FAILED, message)
                .with_data(json!({ "exit_code": cmd.exit_code, "output": cmd.output })),
            BackendError::Timeout(_) => Self::new(codes::TIMEOUT, message),
            BackendError::NotFound { .. } => Self::new(codes::RESOURCE_NOT_FOUND, message),
            BackendError::Bulk { failures, .. } => {
                Self::new(codes::SERVER_ERROR, message).with_data(json!({ "failures": failures }))
            }
            _ => Self::new(codes::SERVER_ERROR, message),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Backend(inner) => inner.into(),
            SchedulerError::Timeout(_) => Self::new(codes::TIMEOUT, e.to_string()),
            SchedulerError::SchedulingInvariant { .. } => Self::new(codes::SCHEDULING_INVARIANT, e.to_string()),
            SchedulerError::FeeFloor { .. } | SchedulerError::IndexGap { .. } | SchedulerError::MissingLightning { .. } => {
                Self::invalid_params(e)
            }
            other => Self::new(codes::SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<WarnetError> for ApiError {
    fn from(e: WarnetError) -> Self {
        match e {
            WarnetError::Graph(_) | WarnetError::Pattern(_) => Self::invalid_params(e),
            WarnetError::Backend(inner) => inner.into(),
            WarnetError::Scheduler(inner) => inner.into(),
            WarnetError::TankNotFound(_)
            | WarnetError::NoLightning(_)
            | WarnetError::ScenarioNotFound(_)
            | WarnetError::ScenarioNotRunning(_) => Self::new(codes::RESOURCE_NOT_FOUND, e.to_string()),
            WarnetError::Config(_) | WarnetError::Io { .. } => Self::new(codes::SERVER_ERROR, e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
