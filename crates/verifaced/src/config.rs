use std::path::PathBuf;

use veriface_core::liveness::VERIFY_PAD_THRESHOLD;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Per-pose PAD probability threshold applied at verification.
    pub pad_threshold: f32,
    /// Seconds a pending challenge remains valid.
    pub challenge_ttl_secs: u64,
    /// Interval between expiry sweeps of the challenge registry.
    pub sweep_interval_secs: u64,
    /// Version tag recorded with every persisted embedding.
    pub model_version: String,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("veriface");

        let db_path = std::env::var("VERIFACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("veriface.db"));

        Self {
            db_path,
            pad_threshold: env_f32("VERIFACE_PAD_THRESHOLD", VERIFY_PAD_THRESHOLD),
            challenge_ttl_secs: env_u64("VERIFACE_CHALLENGE_TTL_SECS", 120),
            sweep_interval_secs: env_u64("VERIFACE_SWEEP_INTERVAL_SECS", 30),
            model_version: std::env::var("VERIFACE_MODEL_VERSION")
                .unwrap_or_else(|_| "sface-128".to_string()),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
