//! Configuration for crawl pacing, termination and batch rate limiting.
//!
//! Layers, lowest first: built-in defaults, an optional JSON file, then
//! `FHARVEST_*` environment overrides. Malformed values keep the lower layer.

use crate::error::{HarvestError, HarvestResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_TARGET_COUNT: usize = 10_000;
const DEFAULT_STEP_PX: u32 = 1400;
const DEFAULT_SCROLL_ANIMATION_MS: u64 = 250;
const DEFAULT_STEP_PAUSE_MS: u64 = 300;
const DEFAULT_MAX_IDLE_MS: u64 = 12_000;
const DEFAULT_HARD_CAP_MS: u64 = 300_000;
const DEFAULT_SETTLE_MS: u64 = 1500;
const DEFAULT_MIN_WHEEL_DELTA: u32 = 600;
const DEFAULT_OP_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_CONFIRM_DELAY_MS: u64 = 350;
const DEFAULT_BASE_DELAY_MS: u64 = 900;
const DEFAULT_JITTER_MS: u64 = 600;

/// Crawl pacing and termination policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Stop once this many distinct members are present.
    pub target_count: usize,
    /// Pixels per scroll advance.
    pub step_px: u32,
    pub scroll_animation_ms: u64,
    /// Pause after each step before the forced scan.
    pub step_pause_ms: u64,
    /// Stop after this long without store growth.
    pub max_idle_ms: u64,
    /// Upper bound on one crawl session, quiet period included.
    pub hard_cap_ms: u64,
    /// Quiet period before the final scan.
    pub settle_ms: u64,
    pub min_wheel_delta: u32,
    /// Upper bound on any single surface call.
    pub op_timeout_ms: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            target_count: DEFAULT_TARGET_COUNT,
            step_px: DEFAULT_STEP_PX,
            scroll_animation_ms: DEFAULT_SCROLL_ANIMATION_MS,
            step_pause_ms: DEFAULT_STEP_PAUSE_MS,
            max_idle_ms: DEFAULT_MAX_IDLE_MS,
            hard_cap_ms: DEFAULT_HARD_CAP_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            min_wheel_delta: DEFAULT_MIN_WHEEL_DELTA,
            op_timeout_ms: DEFAULT_OP_TIMEOUT_MS,
        }
    }
}

impl CrawlConfig {
    pub fn scroll_animation(&self) -> Duration {
        Duration::from_millis(self.scroll_animation_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn hard_cap(&self) -> Duration {
        Duration::from_millis(self.hard_cap_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Time available for stepping; the quiet period must still fit under
    /// the hard cap.
    pub fn stepping_budget(&self) -> Duration {
        self.hard_cap().saturating_sub(self.settle())
    }

    /// Wheel hint magnitude: half a step, never below the floor.
    pub fn wheel_delta(&self) -> f64 {
        f64::from((self.step_px / 2).max(self.min_wheel_delta))
    }
}

/// Batch action selectors and rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Suffix of the action control's test marker.
    pub control_marker_suffix: String,
    /// Test marker of the dedicated confirmation control.
    pub confirm_marker: String,
    /// Label matched (case-insensitively) on generic confirmation buttons.
    pub action_verb: String,
    pub confirm_delay_ms: u64,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            control_marker_suffix: "-unfollow".to_string(),
            confirm_marker: "confirmationSheetConfirm".to_string(),
            action_verb: "Unfollow".to_string(),
            confirm_delay_ms: DEFAULT_CONFIRM_DELAY_MS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

impl ExecutorConfig {
    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub crawl: CrawlConfig,
    pub executor: ExecutorConfig,
    /// Origin used to build profile links, e.g. `https://x.com`.
    pub profile_base: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            crawl: CrawlConfig::default(),
            executor: ExecutorConfig::default(),
            profile_base: "https://x.com".to_string(),
        }
    }
}

impl HarvestConfig {
    /// Resolve defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> HarvestResult<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> HarvestResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    /// Apply `FHARVEST_*` overrides in place.
    pub fn apply_env(&mut self) {
        let c = &mut self.crawl;
        c.target_count = read_env_usize("FHARVEST_TARGET_COUNT", c.target_count);
        c.step_px = read_env_u32("FHARVEST_STEP_PX", c.step_px);
        c.max_idle_ms = read_env_u64("FHARVEST_MAX_IDLE_MS", c.max_idle_ms);
        c.hard_cap_ms = read_env_u64("FHARVEST_HARD_CAP_MS", c.hard_cap_ms);
        c.settle_ms = read_env_u64("FHARVEST_SETTLE_MS", c.settle_ms);
        let e = &mut self.executor;
        e.base_delay_ms = read_env_u64("FHARVEST_BASE_DELAY_MS", e.base_delay_ms);
        e.jitter_ms = read_env_u64("FHARVEST_JITTER_MS", e.jitter_ms);
        if let Some(base) = read_env_string("FHARVEST_PROFILE_BASE") {
            self.profile_base = base;
        }
    }

    pub fn validate(&self) -> HarvestResult<()> {
        if self.crawl.step_px == 0 {
            return Err(HarvestError::Config("crawl.step_px must be > 0".into()));
        }
        if self.crawl.hard_cap_ms == 0 {
            return Err(HarvestError::Config("crawl.hard_cap_ms must be > 0".into()));
        }
        if self.executor.control_marker_suffix.trim().is_empty() {
            return Err(HarvestError::Config(
                "executor.control_marker_suffix must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Profile link for a handle under the configured origin.
    pub fn profile_url(&self, handle: &str) -> String {
        format!("{}/{}", self.profile_base.trim_end_matches('/'), handle)
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    read_env_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_env_u32(name: &str, default: u32) -> u32 {
    read_env_string(name)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    read_env_string(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
