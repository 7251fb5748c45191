//! The narrow surface the agent consumes from its host runtime: which
//! code units are loaded, their pristine bytes, and a way to run them
//! back through the transformer.

use crate::weaver::insn::CodeUnit;
use crate::weaver::transformer::Transformer;
use indexmap::IndexMap;
use log::{debug, info};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("code unit `{0}` is not loaded")]
    UnitNotFound(String),
    #[error("code unit `{0}` is not modifiable")]
    Unmodifiable(String),
    #[error(transparent)]
    Weaver(#[from] crate::weaver::Error),
}

/// Host runtime handle shared by every client of one agent instance.
///
/// Retransformation always starts from the pristine bytes kept by the
/// host, so repeated retransforms never stack instrumentation.
pub trait HostRuntime: Send + Sync {
    fn loaded_units(&self) -> Vec<String>;

    /// Run one already-loaded unit through the transformer again.
    /// Returns whether the installed bytes changed.
    fn retransform_unit(&self, name: &str, transformer: &Transformer) -> Result<bool, HostError>;
}

struct UnitSlot {
    original: Vec<u8>,
    installed: Vec<u8>,
    modifiable: bool,
}

/// In-process host runtime. Backs the integration tests and the demo
/// binary; a real embedding implements [`HostRuntime`] over its own
/// loader instead.
#[derive(Default)]
pub struct InMemoryHost {
    units: Mutex<IndexMap<String, UnitSlot>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a unit, letting the transformer rewrite it on the way in,
    /// exactly like a fresh load observed by the host runtime.
    pub fn load_unit(&self, bytes: Vec<u8>, transformer: &Transformer) -> Result<String, HostError> {
        let owner = CodeUnit::peek_owner(&bytes)?;
        let installed = transformer
            .transform(&owner, &bytes)
            .unwrap_or_else(|| bytes.clone());
        info!(target: "agent", "unit `{owner}` loaded ({} bytes)", bytes.len());
        self.units.lock().expect("host lock poisoned").insert(
            owner.clone(),
            UnitSlot {
                original: bytes,
                installed,
                modifiable: true,
            },
        );
        Ok(owner)
    }

    /// Mark a unit as rejected-by-the-runtime for retransformation.
    pub fn set_modifiable(&self, name: &str, modifiable: bool) {
        if let Some(slot) = self
            .units
            .lock()
            .expect("host lock poisoned")
            .get_mut(name)
        {
            slot.modifiable = modifiable;
        }
    }

    /// Bytes the host currently executes for a unit.
    pub fn installed_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.units
            .lock()
            .expect("host lock poisoned")
            .get(name)
            .map(|slot| slot.installed.clone())
    }
}

impl HostRuntime for InMemoryHost {
    fn loaded_units(&self) -> Vec<String> {
        self.units
            .lock()
            .expect("host lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn retransform_unit(&self, name: &str, transformer: &Transformer) -> Result<bool, HostError> {
        let original = {
            let units = self.units.lock().expect("host lock poisoned");
            let slot = units
                .get(name)
                .ok_or_else(|| HostError::UnitNotFound(name.to_string()))?;
            if !slot.modifiable {
                return Err(HostError::Unmodifiable(name.to_string()));
            }
            slot.original.clone()
        };

        let rewritten = transformer.transform(name, &original);
        let mut units = self.units.lock().expect("host lock poisoned");
        let slot = units
            .get_mut(name)
            .ok_or_else(|| HostError::UnitNotFound(name.to_string()))?;
        let next = rewritten.unwrap_or_else(|| original.clone());
        let changed = next != slot.installed;
        slot.installed = next;
        debug!(target: "agent", "unit `{name}` retransformed (changed: {changed})");
        Ok(changed)
    }
}
