use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, WarehouseBackend};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "QUERY_PULSE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "query-pulse.yaml";

/// Loads settings from the YAML file named by `QUERY_PULSE_CONFIG` (or `query-pulse.yaml`),
/// then applies environment overrides. A missing file means defaults.
pub fn load() -> AppResult<AppSettings> {
    let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    let path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut settings = if path.exists() {
        read_file(&path)?
    } else if explicit.is_some() {
        return Err(AppError::Config(format!(
            "config file {} does not exist",
            path.to_string_lossy()
        )));
    } else {
        AppSettings::default()
    };

    apply_overrides(&mut settings, |key| std::env::var(key).ok())?;
    validate(&settings)?;
    Ok(settings)
}

pub fn read_file(path: &Path) -> AppResult<AppSettings> {
    let raw = fs::read_to_string(path).map_err(|error| {
        AppError::Config(format!("failed to read {}: {}", path.to_string_lossy(), error))
    })?;
    if raw.trim().is_empty() {
        return Ok(AppSettings::default());
    }
    serde_yaml::from_str(&raw)
        .map_err(|error| AppError::Config(format!("invalid config {}: {}", path.to_string_lossy(), error)))
}

pub fn apply_overrides<F>(settings: &mut AppSettings, lookup: F) -> AppResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bind) = lookup("QUERY_PULSE_BIND").filter(|value| !value.trim().is_empty()) {
        settings.bind_addr = bind.trim().to_string();
    } else if let Some(port) = lookup("PORT").filter(|value| !value.trim().is_empty()) {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| AppError::Config(format!("PORT must be a port number, got {:?}", port)))?;
        let host = settings
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        settings.bind_addr = format!("{}:{}", host, port);
    }

    if let Some(dir) = lookup("QUERY_PULSE_LOG_DIR").filter(|value| !value.trim().is_empty()) {
        settings.log_dir = Some(PathBuf::from(dir.trim()));
    }
    Ok(())
}

pub fn validate(settings: &AppSettings) -> AppResult<()> {
    if settings.collection_period_secs == 0 || settings.sweep_period_secs == 0 {
        return Err(AppError::Config("collection and sweep periods must be greater than zero".to_string()));
    }
    if settings.connect_timeout_secs == 0 || settings.query_timeout_secs == 0 || settings.close_timeout_secs == 0 {
        return Err(AppError::Config("timeouts must be greater than zero".to_string()));
    }
    if settings.recent_limit == 0 {
        return Err(AppError::Config("recentLimit must be at least 1".to_string()));
    }
    if settings.history_capacity < settings.recent_limit {
        return Err(AppError::Config(format!(
            "historyCapacity ({}) must be at least recentLimit ({})",
            settings.history_capacity, settings.recent_limit
        )));
    }
    if settings.connect_retry.max_attempts == 0 {
        return Err(AppError::Config("connectRetry.maxAttempts must be at least 1".to_string()));
    }
    if settings.warehouse.backend == WarehouseBackend::Sqlite && settings.warehouse.sqlite_path.is_none() {
        return Err(AppError::Config("warehouse.sqlitePath is required for the sqlite backend".to_string()));
    }
    Ok(())
}
