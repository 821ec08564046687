/// Shared error type used across all agent-runtime crates (§7 error taxonomy).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    /// Guardrail rejected input. Propagates to the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Caller's abort flag was observed at a suspension point. Caught at the
    /// middleware-chain edge; never surfaced past `evaluate`.
    #[error("evaluation aborted")]
    AbortEvaluation,

    /// Tool arguments failed JSON-schema coercion. Becomes a
    /// `ToolResultMessage(is_error=true)`; the tool loop continues.
    #[error("failed to parse tool arguments: {0}")]
    ToolArgParse(String),

    /// The tool body itself returned/threw an error. Becomes a
    /// `ToolResultMessage(is_error=true)`; the tool loop continues.
    #[error("tool body error: {0}")]
    ToolBody(String),

    /// SSE parse failure or an in-band provider error event. Ends the
    /// current turn; does not abort the evaluation.
    #[error("provider stream error: {0}")]
    ProviderStream(String),

    /// `model.api` did not match any known adapter. Fatal.
    #[error("unsupported api: {0}")]
    Unsupported(String),

    #[error("missing model for role {0}")]
    MissingModel(String),

    #[error("missing API key for provider {0}")]
    MissingApiKey(String),

    #[error("missing project id for provider {0}")]
    MissingProject(String),

    /// A durable session-store entry could not be parsed. Logged and
    /// skipped by the store; never fatal.
    #[error("malformed session entry: {0}")]
    MalformedSession(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::AbortEvaluation)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
