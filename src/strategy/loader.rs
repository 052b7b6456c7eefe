use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::StrategyConfig;
use super::{ProviderFactory, StrategyRegistry};

/// A strategy descriptor file found during discovery, not yet instantiated.
#[derive(Debug, Clone)]
pub struct PluginCandidate {
    pub path: PathBuf,
    pub config: StrategyConfig,
    /// Content digest; an unchanged file is not re-registered on reload
    pub digest: String,
}

/// Discovers adapter descriptors from configured plugin locations and keeps
/// the registry in sync with them.
///
/// Plugins are TOML files naming an adapter kind plus its connection config;
/// the explicit factory table does the construction. Discovery is
/// best-effort throughout: an unreadable location or a broken descriptor is
/// logged and skipped, never fatal, and one bad plugin cannot block the
/// rest.
pub struct StrategyLoader {
    locations: Vec<PathBuf>,
    /// Names this loader registered, with the digest they were built from
    loaded: Mutex<HashMap<String, String>>,
}

impl StrategyLoader {
    pub fn new(locations: Vec<PathBuf>) -> Self {
        Self {
            locations,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Scan every configured location for `*.toml` descriptors.
    pub fn discover(&self) -> Vec<PluginCandidate> {
        let mut candidates = Vec::new();
        for location in &self.locations {
            if !location.is_dir() {
                warn!(
                    "Plugin location missing or unreadable, skipping: {}",
                    location.display()
                );
                continue;
            }
            for entry in WalkDir::new(location).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if !path.is_file() || path.extension().is_none_or(|ext| ext != "toml") {
                    continue;
                }
                let content = match std::fs::read_to_string(path) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Cannot read plugin {}: {}", path.display(), e);
                        continue;
                    }
                };
                match toml::from_str::<StrategyConfig>(&content) {
                    Ok(config) => {
                        debug!("Discovered plugin strategy '{}' at {}", config.name, path.display());
                        candidates.push(PluginCandidate {
                            path: path.to_path_buf(),
                            config,
                            digest: blake3::hash(content.as_bytes()).to_hex().to_string(),
                        });
                    }
                    Err(e) => {
                        warn!("Cannot parse plugin {}: {}", path.display(), e);
                    }
                }
            }
        }
        candidates
    }

    /// Run discovery and register new or changed strategies. Serves both the
    /// startup pass and hot reload: adapters captured by in-flight calls are
    /// unaffected because the registry hands out `Arc`s.
    ///
    /// Returns the number of strategies (re)registered.
    pub fn load(&self, registry: &StrategyRegistry) -> usize {
        let mut count = 0;
        for candidate in self.discover() {
            let name = candidate.config.name.clone();
            let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);

            let owned_previously = loaded.contains_key(&name);
            if loaded.get(&name) == Some(&candidate.digest) && registry.contains(&name) {
                continue;
            }

            let provider = match ProviderFactory::build(&candidate.config) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(
                        "Cannot instantiate plugin strategy '{}' from {}: {}",
                        name,
                        candidate.path.display(),
                        e
                    );
                    continue;
                }
            };

            // Hot-swap only names this loader owns; a collision with a
            // strategy registered elsewhere is somebody else's name.
            if owned_previously && registry.contains(&name) {
                registry.unregister(&name);
            }

            if registry.register(&name, provider) {
                info!("Loaded plugin strategy: {}", name);
                loaded.insert(name, candidate.digest);
                count += 1;
            } else {
                warn!(
                    "Plugin strategy name collides with an existing registration, skipping: {}",
                    name
                );
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::strategy::Provider;

    fn write_plugin(dir: &std::path::Path, file: &str, name: &str, endpoint: &str) {
        let content = format!(
            r#"
            name = "{}"
            kind = "ollama"
            endpoint = "{}"
            model = "llama3.2:3b"
            "#,
            name, endpoint
        );
        std::fs::write(dir.join(file), content).expect("write plugin");
    }

    #[test]
    fn discovery_skips_broken_descriptors_and_missing_locations() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "good.toml", "local", "http://localhost:11434");
        std::fs::write(dir.path().join("broken.toml"), "kind = 42").expect("write");
        std::fs::write(dir.path().join("ignored.txt"), "not a plugin").expect("write");

        let loader = StrategyLoader::new(vec![
            dir.path().to_path_buf(),
            PathBuf::from("/does/not/exist"),
        ]);
        let candidates = loader.discover();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].config.name, "local");
    }

    #[test]
    fn load_registers_discovered_strategies() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "a.toml", "local", "http://localhost:11434");

        let registry = StrategyRegistry::new();
        let loader = StrategyLoader::new(vec![dir.path().to_path_buf()]);
        assert_eq!(loader.load(&registry), 1);
        assert!(registry.get("local").is_some());

        // Unchanged plugin: a reload is a no-op and keeps the instance.
        let before = registry.get("local").expect("registered");
        assert_eq!(loader.load(&registry), 0);
        let after = registry.get("local").expect("still registered");
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn reload_swaps_a_changed_plugin_without_touching_captured_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "a.toml", "local", "http://localhost:11434");

        let registry = StrategyRegistry::new();
        let loader = StrategyLoader::new(vec![dir.path().to_path_buf()]);
        loader.load(&registry);
        let captured = registry.get("local").expect("registered");

        write_plugin(dir.path(), "a.toml", "local", "http://localhost:11435");
        assert_eq!(loader.load(&registry), 1);

        let swapped = registry.get("local").expect("re-registered");
        assert!(!Arc::ptr_eq(&captured, &swapped));
        // The captured instance is still alive for whoever holds it.
        assert_eq!(captured.name(), "local");
    }

    #[test]
    fn collision_with_a_foreign_registration_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_plugin(dir.path(), "a.toml", "taken", "http://localhost:11434");

        let registry = StrategyRegistry::new();
        let foreign = ProviderFactory::build(&StrategyConfig {
            name: "taken".to_string(),
            kind: crate::config::ProviderKind::Ollama,
            endpoint: "http://localhost:9999".to_string(),
            model: "m".to_string(),
            api_key_env: None,
            prompt_template: None,
            system_message: None,
            call_timeout_secs: 5,
        })
        .expect("build");
        registry.register("taken", foreign.clone());

        let loader = StrategyLoader::new(vec![dir.path().to_path_buf()]);
        assert_eq!(loader.load(&registry), 0);
        let still_there = registry.get("taken").expect("kept");
        assert!(Arc::ptr_eq(&foreign, &still_there));
    }
}
