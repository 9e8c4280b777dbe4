use std::path::PathBuf;
use thiserror::Error;

/// Errors from the pure config generator. Unsupported protocol values are
/// unrepresentable in the typed descriptor; serde rejects them at the
/// boundary before generation is reached.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("trojan requires a password")]
    MissingPassword,
}

/// Errors from the engine process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("engine binary is not available. Download it or pass an explicit engine path.")]
    EngineNotAvailable,

    #[error("engine config not found at {}", path.display())]
    ConfigMissing { path: PathBuf },

    #[error("proxy '{0}' is already running. Stop it before starting again.")]
    AlreadyRunning(String),

    #[error("proxy '{0}' is not running")]
    NotRunning(String),

    #[error("engine exited during startup (code {code:?}): {stderr}")]
    StartFailed { code: Option<i32>, stderr: String },

    #[error("failed to spawn engine process: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the binary acquisition workflow. Network failures are retried
/// internally before one of these surfaces; extraction and verification
/// failures are terminal for the attempt.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("network error: {0}")]
    Network(String),

    #[error("release API rate limited and fallback lookup failed")]
    RateLimited,

    #[error("no release asset named '{0}'")]
    AssetMissing(String),

    #[error("unsupported platform or architecture for engine releases")]
    UnsupportedPlatform,

    #[error("archive extraction failed: {0}")]
    Extraction(String),

    #[error("install incomplete, missing: {}", missing.join(", "))]
    InstallIncomplete { missing: Vec<String> },

    #[error("engine is not installed and auto-download is disabled")]
    NotInstalled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the proxy registry, the public control surface.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("a proxy named '{0}' already exists")]
    DuplicateName(String),

    #[error("no proxy named '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("failed to persist registry: {0}")]
    Store(String),
}
