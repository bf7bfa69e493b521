use thiserror::Error;

/// Failures that can terminate or redirect a research run.
///
/// `SchemaParse` is recoverable for reflection (the orchestrator falls back
/// to a conservative default) and fatal for query generation. `Service`
/// failures always terminate the run. `Configuration` is raised before any
/// run starts.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{component} returned output that does not match the expected schema: {detail}")]
    SchemaParse {
        component: &'static str,
        detail: String,
    },

    #[error("generation service call failed ({context}): {message}")]
    Service { context: String, message: String },

    #[error("missing configuration: {0}")]
    Configuration(String),
}

impl AgentError {
    pub fn service(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AgentError::Service {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
