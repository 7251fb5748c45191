use crate::host::HostRuntime;
use crate::probe::ProbeRegistry;
use crate::settings::Settings;
use crate::weaver::transformer::Transformer;
use std::sync::Arc;

/// Everything a client binds against, shared by reference across all
/// clients of one agent instance and never mutated per-client.
pub struct ClientContext {
    pub host: Arc<dyn HostRuntime>,
    pub transformer: Arc<Transformer>,
    pub probes: Arc<ProbeRegistry>,
    pub settings: Settings,
}
