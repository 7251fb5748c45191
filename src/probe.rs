//! Probe descriptor registry: named probe sets loadable by namespace
//! from `<namespace>.toml` files on a search path. Loaded once, cached
//! in the registry instance, never reinitialized.

use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// One probe declaration, the shape shared by script files and probe
/// descriptor files.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeDef {
    pub kind: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub member: String,
    #[serde(default = "default_where")]
    pub r#where: String,
    #[serde(default)]
    pub tag: String,
}

fn default_where() -> String {
    "before".to_string()
}

/// A namespaced probe set.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeDescriptor {
    pub namespace: String,
    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeDef>,
}

/// Lookup of `namespace -> ProbeDescriptor`, injected into the agent at
/// startup.
pub struct ProbeRegistry {
    dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<String, Arc<ProbeDescriptor>>>,
}

impl ProbeRegistry {
    /// `search_path` is a `:`-separated directory list.
    pub fn new(search_path: &str) -> Self {
        let dirs = search_path
            .split(':')
            .filter(|dir| !dir.trim().is_empty())
            .map(|dir| PathBuf::from(dir.trim()))
            .collect();
        Self {
            dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a namespace. Missing or unreadable descriptors resolve to
    /// `None`; the failure only costs the feature, never the agent.
    pub fn load(&self, namespace: &str) -> Option<Arc<ProbeDescriptor>> {
        let namespace = namespace.trim();
        if let Some(found) = self
            .cache
            .lock()
            .expect("probe cache poisoned")
            .get(namespace)
        {
            debug!(target: "agent", "probe descriptor cache hit for {namespace}");
            return Some(found.clone());
        }

        let descriptor = self.read_descriptor(namespace)?;
        let descriptor = Arc::new(descriptor);
        self.cache
            .lock()
            .expect("probe cache poisoned")
            .insert(namespace.to_string(), descriptor.clone());
        Some(descriptor)
    }

    fn read_descriptor(&self, namespace: &str) -> Option<ProbeDescriptor> {
        let file = format!("{namespace}.toml");
        for dir in &self.dirs {
            let path = dir.join(&file);
            debug!(target: "agent", "looking for probe descriptor file {}", path.display());
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            match toml::from_str::<ProbeDescriptor>(&raw) {
                Ok(descriptor) => {
                    debug!(target: "agent", "read probe descriptor for {namespace}");
                    return Some(descriptor);
                }
                Err(e) => {
                    log::warn!(
                        target: "agent",
                        "unreadable probe descriptor {}: {e}",
                        path.display()
                    );
                }
            }
        }
        debug!(target: "agent", "no probe descriptor found for {namespace}");
        None
    }
}
