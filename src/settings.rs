//! Business settings read by the admission policy.

use dashmap::DashMap;

use crate::model::SettingValue;

pub const AUDIT_REQUIRED: &str = "auditRequired";
pub const MAX_DURATION_HOURS: &str = "maxDurationHours";

pub const DEFAULT_AUDIT_REQUIRED: bool = false;
pub const DEFAULT_MAX_DURATION_HOURS: f64 = 72.0;

/// Read side of configuration. Implementations must not cache across calls:
/// a change is visible to the very next read.
pub trait ConfigProvider: Send + Sync {
    fn get_bool(&self, key: &str, default: bool) -> bool;

    fn get_number(&self, key: &str, default: f64) -> f64;
}

/// Persisted settings table, replayed from the WAL.
#[derive(Debug, Default)]
pub struct Settings {
    values: DashMap<String, SettingValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.values.get(key).map(|v| *v.value())
    }

    pub fn set(&self, key: &str, value: SettingValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn snapshot(&self) -> Vec<(String, SettingValue)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl ConfigProvider for Settings {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(SettingValue::Bool(b)) => b,
            _ => default,
        }
    }

    fn get_number(&self, key: &str, default: f64) -> f64 {
        match self.get(key) {
            Some(SettingValue::Number(n)) => n,
            _ => default,
        }
    }
}

/// Only known keys with the right value type are accepted.
pub fn validate_setting(key: &str, value: &SettingValue) -> Result<(), String> {
    match (key, value) {
        (AUDIT_REQUIRED, SettingValue::Bool(_)) => Ok(()),
        (MAX_DURATION_HOURS, SettingValue::Number(n)) if n.is_finite() && *n > 0.0 => Ok(()),
        (MAX_DURATION_HOURS, _) => Err(format!("{MAX_DURATION_HOURS} must be a positive number")),
        (AUDIT_REQUIRED, _) => Err(format!("{AUDIT_REQUIRED} must be a boolean")),
        _ => Err(format!("unknown setting: {key}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_until_set() {
        let settings = Settings::new();
        assert!(!settings.get_bool(AUDIT_REQUIRED, DEFAULT_AUDIT_REQUIRED));
        assert_eq!(settings.get_number(MAX_DURATION_HOURS, DEFAULT_MAX_DURATION_HOURS), 72.0);

        settings.set(AUDIT_REQUIRED, SettingValue::Bool(true));
        settings.set(MAX_DURATION_HOURS, SettingValue::Number(4.0));
        assert!(settings.get_bool(AUDIT_REQUIRED, DEFAULT_AUDIT_REQUIRED));
        assert_eq!(settings.get_number(MAX_DURATION_HOURS, DEFAULT_MAX_DURATION_HOURS), 4.0);
    }

    #[test]
    fn mistyped_value_falls_back_to_default() {
        let settings = Settings::new();
        settings.set(AUDIT_REQUIRED, SettingValue::Number(1.0));
        assert!(!settings.get_bool(AUDIT_REQUIRED, false));
    }

    #[test]
    fn validation() {
        assert!(validate_setting(AUDIT_REQUIRED, &SettingValue::Bool(true)).is_ok());
        assert!(validate_setting(MAX_DURATION_HOURS, &SettingValue::Number(8.0)).is_ok());
        assert!(validate_setting(MAX_DURATION_HOURS, &SettingValue::Number(0.0)).is_err());
        assert!(validate_setting(MAX_DURATION_HOURS, &SettingValue::Number(f64::NAN)).is_err());
        assert!(validate_setting(AUDIT_REQUIRED, &SettingValue::Number(1.0)).is_err());
        assert!(validate_setting("theme", &SettingValue::Bool(true)).is_err());
    }
}
