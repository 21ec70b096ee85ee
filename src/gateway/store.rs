use std::path::PathBuf;
use std::sync::RwLock;

use super::instance::InstanceConfig;

/// Source of the configured instance list. The list may be re-read at any
/// time; the balancer treats every load as the new truth and carries runtime
/// counters over by instance id.
pub trait InstanceStore: Send + Sync {
    fn load_instances(&self) -> Vec<InstanceConfig>;
}

/// Instance records from a JSON file (an array of instance objects). Read
/// errors fail soft with an empty list so a broken edit cannot take the
/// gateway down harder than "no instances".
pub struct JsonFileInstanceStore {
    path: PathBuf,
}

impl JsonFileInstanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InstanceStore for JsonFileInstanceStore {
    fn load_instances(&self) -> Vec<InstanceConfig> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to read instance file");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(instances) => instances,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to parse instance file");
                Vec::new()
            }
        }
    }
}

/// In-memory store for tests and embedded setups.
pub struct StaticInstanceStore {
    entries: RwLock<Vec<InstanceConfig>>,
}

impl StaticInstanceStore {
    pub fn new(entries: Vec<InstanceConfig>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Swaps the stored list; visible on the next `load_instances`.
    pub fn replace(&self, entries: Vec<InstanceConfig>) {
        *self.entries.write().expect("instance store lock poisoned") = entries;
    }
}

impl InstanceStore for StaticInstanceStore {
    fn load_instances(&self) -> Vec<InstanceConfig> {
        self.entries
            .read()
            .expect("instance store lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let store = JsonFileInstanceStore::new("/nonexistent/instances.json");
        assert!(store.load_instances().is_empty());
    }

    #[test]
    fn static_store_replace_is_visible() {
        let store = StaticInstanceStore::new(Vec::new());
        assert!(store.load_instances().is_empty());
        store.replace(vec![InstanceConfig {
            id: 1,
            provider_name: "p".to_string(),
            model_name: "m".to_string(),
            url: "http://localhost".to_string(),
            api_key: "k".to_string(),
            request_template: String::new(),
            response_request_id_path: String::new(),
            response_content_path: String::new(),
            response_seq_path: String::new(),
            response_raw_enabled: false,
            rpm_limit: 0,
            tpm_limit: 0,
            max_qps: 0,
            pool_key: String::new(),
            active: true,
        }]);
        assert_eq!(store.load_instances().len(), 1);
    }

    #[test]
    fn instance_json_parses_with_defaults() {
        let raw = r#"[{
            "id": 7,
            "model_name": "gpt-4o-mini",
            "url": "https://api.example.com/v1/chat/completions",
            "api_key": "sk-x",
            "rpm_limit": 120
        }]"#;
        let parsed: Vec<InstanceConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].id, 7);
        assert!(parsed[0].active);
        assert_eq!(parsed[0].tpm_limit, 0);
        assert!(parsed[0].pool_key.is_empty());
    }
}
