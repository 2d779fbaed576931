//! Process configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// JSON file of user records; `None` starts with an empty directory.
    pub directory_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            directory_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default, like unset ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| parse::<u64>(&s));
        Self {
            bind: lookup("ROOMBOOK_BIND").unwrap_or(defaults.bind),
            port: lookup("ROOMBOOK_PORT")
                .and_then(|s| parse(&s))
                .unwrap_or(defaults.port),
            data_dir: lookup("ROOMBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: lookup("ROOMBOOK_MAX_CONNECTIONS")
                .and_then(|s| parse(&s))
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed("ROOMBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("ROOMBOOK_METRICS_PORT").and_then(|s| parse(&s)),
            directory_path: lookup("ROOMBOOK_DIRECTORY").map(PathBuf::from),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn parse<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_unset() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.addr(), "0.0.0.0:7433");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ROOMBOOK_PORT", "9000"),
            ("ROOMBOOK_DATA_DIR", "/var/lib/roombook"),
            ("ROOMBOOK_MAX_CONNECTIONS", "0"),
            ("ROOMBOOK_COMPACT_THRESHOLD", "many"),
            ("ROOMBOOK_METRICS_PORT", "9100"),
        ]);
        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 9000);
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/roombook/roombook.wal"));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.directory_path, None);
    }
}
