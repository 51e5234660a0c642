//! Error taxonomy for the harvesting engine.
//!
//! Only configuration problems are fatal. Extraction misses, missing
//! controls and scroll stalls are absorbed where they happen and never
//! reach this type.

/// Stable error codes used on the wire.
pub mod error_codes {
    pub const WRONG_VIEW: &str = "E_WRONG_VIEW";
    pub const NO_SCROLL_SURFACE: &str = "E_NO_SCROLL_SURFACE";
    pub const SURFACE: &str = "E_SURFACE";
    pub const CONFIG: &str = "E_CONFIG";
    pub const JSON: &str = "E_JSON";
    pub const IO: &str = "E_IO";
}

/// All errors the core surfaces to callers.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("Open the following page first (current view: {0})")]
    WrongView(String),

    #[error("No scrollable list found. Open the following page first.")]
    NoScrollSurface,

    #[error("Render surface error: {0:#}")]
    Surface(anyhow::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    pub fn code(&self) -> &'static str {
        use error_codes::*;
        match self {
            HarvestError::WrongView(_) => WRONG_VIEW,
            HarvestError::NoScrollSurface => NO_SCROLL_SURFACE,
            HarvestError::Surface(_) => SURFACE,
            HarvestError::Config(_) => CONFIG,
            HarvestError::Json(_) => JSON,
            HarvestError::Io(_) => IO,
        }
    }

    /// Configuration errors mean the caller must fix the view or settings.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            HarvestError::WrongView(_) | HarvestError::NoScrollSurface | HarvestError::Config(_)
        )
    }
}

pub type HarvestResult<T> = Result<T, HarvestError>;
