//! Engine configuration.
//!
//! One validated [`EngineConfig`] record drives a whole run. Values merge in
//! precedence order: CLI flags (applied by the binary) > `PIXLY_*` environment
//! > optional JSON config file in the user data directory > defaults.
//! Validation failures abort before any file is touched.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Processing mode. Acts as a filter over the predictor's rule table; it
/// never duplicates the decision logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// All rules considered.
    Auto,
    /// Only lossless / repackage rules; files that would need a lossy encode
    /// are skipped instead.
    Quality,
    /// AVIF-only rules with a stricter minimum-reduction threshold, for
    /// sticker/emoji libraries.
    Emoji,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Auto => "auto",
            ProcessingMode::Quality => "quality",
            ProcessingMode::Emoji => "emoji",
        }
    }

    /// Minimum fraction an output must shrink by to be accepted.
    pub fn min_reduction(&self) -> f64 {
        match self {
            ProcessingMode::Emoji => 0.07,
            _ => 0.0,
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProcessingMode::Auto),
            "quality" => Ok(ProcessingMode::Quality),
            "emoji" => Ok(ProcessingMode::Emoji),
            other => Err(format!(
                "unknown mode '{}' (expected auto, quality or emoji)",
                other
            )),
        }
    }
}

/// Worker pool bounds. CPU-derived counts are clamped into this range.
pub const MIN_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: ProcessingMode,
    /// 0 = derive from CPU count.
    pub workers: usize,
    /// None = replace files in place; Some = mirror the tree under this root.
    pub output_dir: Option<PathBuf>,
    pub dry_run: bool,

    /// Exploration kicks in below this predictor confidence.
    pub confidence_threshold: f64,
    /// Store observations needed before the tuner trusts an aggregate.
    pub min_observations: u64,
    /// Extra shrinkage floor on top of strict `new < old` (0.07 in emoji mode).
    pub min_reduction: f64,

    /// Encoder wall-clock ceiling: base + per-MB, capped.
    pub encoder_timeout_base_secs: u64,
    pub encoder_timeout_per_mb_secs: u64,
    pub encoder_timeout_cap_secs: u64,
    /// Kill an encoder whose output stops growing for this long.
    pub encoder_stall_secs: u64,
    pub probe_timeout_secs: u64,

    /// Cap concurrent encoder processes below worker count (None = workers).
    pub max_concurrent_encoders: Option<usize>,

    /// Learning store location; None = `<data_dir>/pixly/knowledge.db`.
    pub store_path: Option<PathBuf>,
    /// Disable the learning store entirely (predictions run untuned).
    pub no_store: bool,

    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Auto,
            workers: 0,
            output_dir: None,
            dry_run: false,
            confidence_threshold: 0.80,
            min_observations: 30,
            min_reduction: 0.0,
            encoder_timeout_base_secs: 60,
            encoder_timeout_per_mb_secs: 1,
            encoder_timeout_cap_secs: 600,
            encoder_stall_secs: 30,
            probe_timeout_secs: 8,
            max_concurrent_encoders: None,
            store_path: None,
            no_store: false,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Defaults merged with the optional config file and `PIXLY_*` env vars.
    /// CLI flags are layered on top by the binary.
    pub fn load() -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(path) = Self::default_config_file() {
            if path.exists() {
                config = Self::from_file(&path)?;
            }
        }
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {}: {}", path.display(), e))?;
        serde_json::from_str(&data)
            .map_err(|e| format!("invalid config file {}: {}", path.display(), e))
    }

    /// `<data_dir>/pixly/config.json`, e.g. `~/.config/pixly/config.json` on
    /// Linux or `~/Library/Application Support/pixly/config.json` on macOS.
    pub fn default_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pixly").join("config.json"))
    }

    /// `<data_dir>/pixly/knowledge.db` unless overridden.
    pub fn resolved_store_path(&self) -> PathBuf {
        if let Some(ref p) = self.store_path {
            return p.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pixly")
            .join("knowledge.db")
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PIXLY_MODE") {
            if let Ok(mode) = v.parse() {
                self.mode = mode;
            }
        }
        if let Ok(v) = std::env::var("PIXLY_WORKERS") {
            if let Ok(n) = v.parse() {
                self.workers = n;
            }
        }
        if let Ok(v) = std::env::var("PIXLY_STORE") {
            self.store_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PIXLY_CONFIDENCE_THRESHOLD") {
            if let Ok(t) = v.parse() {
                self.confidence_threshold = t;
            }
        }
        if std::env::var("PIXLY_VERBOSE").is_ok_and(|v| v == "1" || v == "true") {
            self.verbose = true;
        }
    }

    /// Effective worker count: configured value or CPU-derived, clamped.
    pub fn effective_workers(&self) -> usize {
        let derived = if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get()
        };
        derived.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    /// Cap on concurrently running encoder processes.
    pub fn effective_encoder_cap(&self) -> usize {
        self.max_concurrent_encoders
            .unwrap_or_else(|| self.effective_workers())
            .max(1)
    }

    /// Mode-coherent minimum reduction: the stricter of the configured floor
    /// and what the mode demands.
    pub fn effective_min_reduction(&self) -> f64 {
        self.min_reduction.max(self.mode.min_reduction())
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(format!(
                "confidence_threshold {} out of range [0, 1]",
                self.confidence_threshold
            ));
        }
        if !(0.0..1.0).contains(&self.min_reduction) {
            return Err(format!(
                "min_reduction {} out of range [0, 1)",
                self.min_reduction
            ));
        }
        if self.encoder_timeout_base_secs == 0 {
            return Err("encoder_timeout_base_secs must be positive".to_string());
        }
        if self.encoder_timeout_cap_secs < self.encoder_timeout_base_secs {
            return Err("encoder_timeout_cap_secs below the base ceiling".to_string());
        }
        if self.encoder_stall_secs == 0 {
            return Err("encoder_stall_secs must be positive".to_string());
        }
        if self.probe_timeout_secs == 0 {
            return Err("probe_timeout_secs must be positive".to_string());
        }
        if let Some(cap) = self.max_concurrent_encoders {
            if cap == 0 {
                return Err("max_concurrent_encoders must be positive".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_worker_clamping() {
        let mut c = EngineConfig::default();
        c.workers = 1;
        assert_eq!(c.effective_workers(), MIN_WORKERS);
        c.workers = 64;
        assert_eq!(c.effective_workers(), MAX_WORKERS);
        c.workers = 8;
        assert_eq!(c.effective_workers(), 8);
    }

    #[test]
    fn test_emoji_mode_reduction_floor() {
        let mut c = EngineConfig::default();
        assert_eq!(c.effective_min_reduction(), 0.0);
        c.mode = ProcessingMode::Emoji;
        assert!((c.effective_min_reduction() - 0.07).abs() < 1e-9);
        // A stricter explicit floor wins over the mode floor.
        c.min_reduction = 0.10;
        assert!((c.effective_min_reduction() - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("auto".parse::<ProcessingMode>(), Ok(ProcessingMode::Auto));
        assert_eq!(
            "QUALITY".parse::<ProcessingMode>(),
            Ok(ProcessingMode::Quality)
        );
        assert_eq!("emoji".parse::<ProcessingMode>(), Ok(ProcessingMode::Emoji));
        assert!("fast".parse::<ProcessingMode>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_ranges() {
        let mut c = EngineConfig::default();
        c.confidence_threshold = 1.5;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.min_reduction = 1.0;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.encoder_timeout_cap_secs = 10;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.max_concurrent_encoders = Some(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut c = EngineConfig::default();
        c.workers = 6;
        c.mode = ProcessingMode::Emoji;
        std::fs::write(&path, serde_json::to_string_pretty(&c).unwrap()).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.workers, 6);
        assert_eq!(loaded.mode, ProcessingMode::Emoji);
    }

    #[test]
    fn test_partial_config_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"workers": 5}"#).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.workers, 5);
        assert_eq!(loaded.mode, ProcessingMode::Auto);
        assert!((loaded.confidence_threshold - 0.80).abs() < 1e-9);
    }
}
