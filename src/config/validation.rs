use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("fresh_window ({fresh}) must be shorter than stale_after ({stale})")]
    FreshWindowNotBelowStale { fresh: String, stale: String },

    #[error("Tolerance must not be negative: {field} = {value}")]
    NegativeTolerance { field: &'static str, value: i64 },

    #[error("Polling interval must be positive: {field}")]
    ZeroInterval { field: &'static str },

    #[error("background_multiplier must be at least 1, got {0}")]
    InvalidBackgroundMultiplier(u32),

    #[error("Retention cap must be positive: {field}")]
    ZeroRetention { field: &'static str },

    #[error(
        "transactions_persisted ({persisted}) must not exceed transactions_in_memory ({in_memory})"
    )]
    PersistedCapExceedsMemory { persisted: usize, in_memory: usize },

    #[error("Invalid remote base_url scheme '{0}', expected 'http://' or 'https://'")]
    InvalidRemoteScheme(String),
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_policy(config)?;
    validate_polling(config)?;
    validate_retention(config)?;
    validate_remote(config)?;
    Ok(())
}

fn validate_policy(config: &Config) -> Result<(), ValidationError> {
    let policy = &config.policy;

    if policy.fresh_window >= policy.stale_after {
        return Err(ValidationError::FreshWindowNotBelowStale {
            fresh: policy.fresh_window.to_string(),
            stale: policy.stale_after.to_string(),
        });
    }

    if policy.catch_up_tolerance < 0 {
        return Err(ValidationError::NegativeTolerance {
            field: "catch_up_tolerance",
            value: policy.catch_up_tolerance,
        });
    }

    if policy.drift_tolerance < 0 {
        return Err(ValidationError::NegativeTolerance {
            field: "drift_tolerance",
            value: policy.drift_tolerance,
        });
    }

    Ok(())
}

fn validate_polling(config: &Config) -> Result<(), ValidationError> {
    let polling = &config.polling;

    for (field, interval) in [
        ("active_jobs", polling.active_jobs),
        ("full_sync", polling.full_sync),
        ("health", polling.health),
        ("identity.poll_interval", config.identity.poll_interval),
    ] {
        if interval.is_zero() {
            return Err(ValidationError::ZeroInterval { field });
        }
    }

    if polling.background_multiplier < 1 {
        return Err(ValidationError::InvalidBackgroundMultiplier(
            polling.background_multiplier,
        ));
    }

    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    let retention = &config.retention;

    for (field, cap) in [
        ("transactions_in_memory", retention.transactions_in_memory),
        ("transactions_persisted", retention.transactions_persisted),
        ("job_history", retention.job_history),
        ("sync_log", retention.sync_log),
    ] {
        if cap == 0 {
            return Err(ValidationError::ZeroRetention { field });
        }
    }

    if retention.transactions_persisted > retention.transactions_in_memory {
        return Err(ValidationError::PersistedCapExceedsMemory {
            persisted: retention.transactions_persisted,
            in_memory: retention.transactions_in_memory,
        });
    }

    Ok(())
}

fn validate_remote(config: &Config) -> Result<(), ValidationError> {
    let url = config.remote.base_url.as_str();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        let scheme = url.split("://").next().unwrap_or(url).to_string();
        return Err(ValidationError::InvalidRemoteScheme(scheme));
    }
    Ok(())
}
