use super::settings::{
    AppConfig, BusConfig, DatabaseConfig, NodeConfig, ObservabilityConfig, PoolConfig,
    ScheduleConfig,
};
use crate::{DispatchError, DispatchResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> DispatchResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> DispatchResult<()> {
        if value.trim().is_empty() {
            return Err(DispatchError::config(format!("{field_name} cannot be empty")));
        }
        Ok(())
    }

    pub fn validate_positive(value: u64, field_name: &str) -> DispatchResult<()> {
        if value == 0 {
            return Err(DispatchError::config(format!(
                "{field_name} must be greater than 0"
            )));
        }
        Ok(())
    }

    /// 表名会被拼进SQL，只允许标识符字符
    pub fn validate_sql_identifier(value: &str, field_name: &str) -> DispatchResult<()> {
        let valid = value
            .split('.')
            .all(|part| {
                let mut chars = part.chars();
                matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(DispatchError::config(format!(
                "{field_name} is not a valid SQL identifier: {value}"
            )));
        }
        Ok(())
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> DispatchResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        ValidationUtils::validate_positive(self.max_connections as u64, "database.max_connections")?;
        if self.min_connections > self.max_connections {
            return Err(DispatchError::config(
                "database.min_connections cannot exceed database.max_connections",
            ));
        }
        ValidationUtils::validate_sql_identifier(&self.jobs_table, "database.jobs_table")
    }
}

impl ConfigValidator for BusConfig {
    fn validate(&self) -> DispatchResult<()> {
        ValidationUtils::validate_positive(self.poll_interval_seconds, "bus.poll_interval_seconds")?;
        ValidationUtils::validate_positive(
            self.max_reconnect_attempts as u64,
            "bus.max_reconnect_attempts",
        )?;
        for channel in &self.broadcast_channels {
            ValidationUtils::validate_not_empty(channel, "bus.broadcast_channels")?;
        }
        Ok(())
    }
}

impl ConfigValidator for NodeConfig {
    fn validate(&self) -> DispatchResult<()> {
        ValidationUtils::validate_not_empty(&self.hostname, "node.hostname")
    }
}

impl ConfigValidator for PoolConfig {
    fn validate(&self) -> DispatchResult<()> {
        ValidationUtils::validate_positive(self.max_workers as u64, "pool.max_workers")?;
        if self.min_workers > self.max_workers {
            return Err(DispatchError::config(format!(
                "pool.min_workers ({}) cannot exceed pool.max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

impl ConfigValidator for ScheduleConfig {
    fn validate(&self) -> DispatchResult<()> {
        ValidationUtils::validate_not_empty(&self.task, "schedules.task")?;
        ValidationUtils::validate_positive(self.interval_seconds, "schedules.interval_seconds")
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> DispatchResult<()> {
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(DispatchError::config(format!(
                "Invalid log format: {}. Valid options: {:?}",
                self.log_format, valid_formats
            )));
        }
        Ok(())
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> DispatchResult<()> {
        self.database.validate()?;
        self.bus.validate()?;
        self.node.validate()?;
        self.pool.validate()?;
        for schedule in self.schedules.values() {
            schedule.validate()?;
        }
        self.observability.validate()
    }
}
