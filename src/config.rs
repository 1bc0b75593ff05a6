//! Configuration module for CounterFlow.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite cache database (default: "counterflow.db")
    pub db_path: String,
    /// Check interval in seconds stored with compiled services (default: 60)
    pub check_interval: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "counterflow.db".to_string(),
            check_interval: 60.0,
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `COUNTERFLOW_DB_PATH`: cache database path (default: "counterflow.db")
    /// - `COUNTERFLOW_CHECK_INTERVAL`: default check interval in seconds (default: 60)
    pub fn load() -> Self {
        let mut settings = Self::default();

        if let Ok(db_path) = env::var("COUNTERFLOW_DB_PATH") {
            settings.db_path = db_path;
        }

        if let Ok(interval_str) = env::var("COUNTERFLOW_CHECK_INTERVAL") {
            if let Ok(interval) = interval_str.parse() {
                settings.check_interval = interval;
            }
        }

        settings
    }
}
