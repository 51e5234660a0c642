//! Path resolution for the config file and the browser profile.

use std::path::PathBuf;

const CONFIG_FILE: &str = "fharvest.json";

/// Resolve the config file: explicit flag, `FHARVEST_CONFIG`, `./fharvest.json`,
/// then the user config directory. `None` means built-in defaults.
pub fn resolve_config_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }

    if let Ok(env_path) = std::env::var("FHARVEST_CONFIG") {
        if !env_path.trim().is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }

    let cwd = PathBuf::from(CONFIG_FILE);
    if cwd.exists() {
        return Some(cwd);
    }

    dirs::config_dir()
        .map(|d| d.join("follow-harvest").join(CONFIG_FILE))
        .filter(|p| p.exists())
}

/// Resolve the browser profile directory used when launching Chromium.
pub fn resolve_profile_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var("FHARVEST_PROFILE_DIR") {
        if !env_path.trim().is_empty() {
            return PathBuf::from(env_path);
        }
    }

    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("follow-harvest")
        .join("profile")
}
