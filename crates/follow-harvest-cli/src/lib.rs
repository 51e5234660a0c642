//! Follow Harvest CLI: browser attachment and the stdio protocol.

pub mod chromium;
pub mod config;
pub mod protocol;
pub mod transport;

pub use chromium::{find_chromium, BrowserOptions, ChromiumSurface};
pub use config::{resolve_config_path, resolve_profile_dir};
pub use transport::StdioTransport;
