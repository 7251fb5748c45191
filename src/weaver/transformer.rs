use crate::weak_error;
use crate::weaver::chain::{rewrite_unit, Probe};
use crate::weaver::insn::CodeUnit;
use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Receiver for rewrite failures, reported asynchronously to the owning
/// client and to nobody else.
pub trait ErrorSink: Send + Sync {
    fn rewrite_error(&self, message: String);
}

/// Compiled rewrite spec of one registered client.
pub struct RewriteSpec {
    pub client: Uuid,
    pub client_name: String,
    /// Optional type-name prefilter. `None` traces every unit.
    pub class_filter: Option<Regex>,
    pub probes: Vec<Probe>,
    pub errors: Arc<dyn ErrorSink>,
}

impl RewriteSpec {
    /// Cheap test whether this client can possibly touch a unit, used to
    /// skip decode and chain construction on the load path.
    fn may_match(&self, owner: &str) -> bool {
        if self.probes.is_empty() {
            return false;
        }
        match &self.class_filter {
            None => true,
            Some(re) => re.is_match(owner),
        }
    }
}

/// The set of active clients, swapped wholesale on every mutation so
/// readers only ever see a complete generation.
#[derive(Default)]
pub struct Registry {
    clients: IndexMap<Uuid, Arc<RewriteSpec>>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, client: Uuid) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients
            .values()
            .map(|s| s.client_name.clone())
            .collect()
    }
}

/// Rewrites code units on load and retransform against every registered
/// client.
///
/// The registry is the only shared mutable state of the engine. Writers
/// are funneled through the agent's serialized task queue, one mutation
/// at a time; the load path takes an `Arc` snapshot and works against
/// that, tolerating snapshots that are already stale relative to a
/// queued-but-unprocessed registration.
pub struct Transformer {
    registry: Mutex<Arc<Registry>>,
    mutations: AtomicU64,
    dump_dir: Option<PathBuf>,
}

impl Transformer {
    pub fn new(dump_dir: Option<PathBuf>) -> Self {
        Self {
            registry: Mutex::new(Arc::new(Registry::default())),
            mutations: AtomicU64::new(0),
            dump_dir,
        }
    }

    /// Current registry generation.
    pub fn snapshot(&self) -> Arc<Registry> {
        self.registry.lock().expect("registry lock poisoned").clone()
    }

    /// Register a client's compiled spec. Must only be called from the
    /// serialized onboarding queue worker.
    pub fn register(&self, spec: Arc<RewriteSpec>) {
        self.mutate(|clients| {
            clients.insert(spec.client, spec.clone());
        });
    }

    /// Drop a client's spec so future loads no longer match it. Must only
    /// be called from the serialized onboarding queue worker.
    pub fn deregister(&self, client: Uuid) {
        self.mutate(|clients| {
            clients.shift_remove(&client);
        });
    }

    fn mutate(&self, f: impl FnOnce(&mut IndexMap<Uuid, Arc<RewriteSpec>>)) {
        let mut guard = self.registry.lock().expect("registry lock poisoned");
        let mut clients = guard.clients.clone();
        f(&mut clients);
        *guard = Arc::new(Registry { clients });
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Total registry mutations so far; monotonically increasing.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Rewrite a unit on load or retransform. Returns `None` when the
    /// unit leaves unchanged, which is the common case and stays cheap:
    /// no decode happens unless some client can match the type name.
    ///
    /// A failing client pass never fails the load: the unit keeps the
    /// last healthy bytes and the failure goes back to the owning client
    /// as an error report.
    pub fn transform(&self, owner: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        let registry = self.snapshot();
        if !registry.clients.values().any(|s| s.may_match(owner)) {
            return None;
        }

        let mut unit = match CodeUnit::decode(bytes) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(target: "weaver", "skip unreadable unit `{owner}`: {e}");
                return None;
            }
        };

        let mut changed = false;
        for spec in registry.clients.values() {
            if !spec.may_match(owner) {
                continue;
            }
            match rewrite_unit(owner, &mut unit, &spec.probes) {
                Ok(unit_changed) => changed |= unit_changed,
                Err(e) => {
                    warn!(
                        target: "weaver",
                        "rewrite of `{owner}` failed for client {}: {e}",
                        spec.client_name
                    );
                    spec.errors
                        .rewrite_error(format!("rewrite of `{owner}` failed: {e}"));
                }
            }
        }

        if !changed {
            debug!(target: "weaver", "unit `{owner}` left unchanged");
            return None;
        }
        let out = unit.encode();
        self.dump(owner, &out);
        Some(out)
    }

    fn dump(&self, owner: &str, bytes: &[u8]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let file = format!("{}.{stamp}.twu", owner.replace(['/', '.'], "_"));
        weak_error!(std::fs::write(dir.join(file), bytes), "unit dump failed:");
    }
}
