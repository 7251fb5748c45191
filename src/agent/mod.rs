//! Client lifecycle, the serialized onboarding queue and the remote
//! server loop, assembled into one agent instance.

pub mod client;
pub mod context;
pub mod queue;
pub mod server;

use crate::agent::client::Client;
use crate::agent::context::ClientContext;
use crate::agent::queue::SerializedQueue;
use crate::agent::server::Server;
use crate::comm::Command;
use crate::host::HostRuntime;
use crate::probe::ProbeRegistry;
use crate::script::TraceScript;
use crate::settings::Settings;
use crate::weaver::transformer::Transformer;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

/// One agent instance inside a host runtime.
pub struct Agent {
    ctx: Arc<ClientContext>,
    queue: Arc<SerializedQueue>,
    clients: Arc<Mutex<Vec<Arc<Client>>>>,
}

impl Agent {
    pub fn new(settings: Settings, host: Arc<dyn HostRuntime>) -> Agent {
        let dump_dir = settings
            .dump_units
            .then(|| PathBuf::from(settings.dump_dir.as_deref().unwrap_or(".")));
        let transformer = Arc::new(Transformer::new(dump_dir));
        let probes = Arc::new(ProbeRegistry::new(&settings.probe_desc_path));
        Agent {
            ctx: Arc::new(ClientContext {
                host,
                transformer,
                probes,
                settings,
            }),
            queue: Arc::new(SerializedQueue::new()),
            clients: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    pub fn transformer(&self) -> Arc<Transformer> {
        self.ctx.transformer.clone()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.lock().expect("client list poisoned").clone()
    }

    /// Onboard the initial scripts, then start serving remote clients.
    /// Script onboarding is awaited one by one, so the accept loop never
    /// opens before the initial scripts are woven in.
    ///
    /// Returns the bound address, or `None` when the server is disabled.
    /// The accept loop runs for the rest of the process lifetime.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<Option<SocketAddr>> {
        self.load_initial_scripts();

        if self.ctx.settings.no_server {
            info!(target: "agent", "server disabled, serving local scripts only");
            return Ok(None);
        }

        let server = Server::bind(self.ctx.settings.port)?;
        let addr = server.local_addr()?;
        info!(target: "agent", "listening on {addr}");

        let ctx = self.ctx.clone();
        let queue = self.queue.clone();
        let clients = self.clients.clone();
        thread::Builder::new()
            .name("twr-server".to_string())
            .spawn(move || server.run(ctx, queue, clients))
            .expect("server thread must start");
        Ok(Some(addr))
    }

    fn load_initial_scripts(&self) {
        for script in self.ctx.settings.scripts.clone() {
            self.load_script(Path::new(&script));
        }
        let Some(dir) = self.ctx.settings.script_dir.clone() else {
            return;
        };
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                info!(target: "agent", "scanning script directory {dir}");
                for entry in entries.flatten() {
                    if entry.path().is_file() {
                        self.load_script(&entry.path());
                    }
                }
            }
            Err(e) => warn!(target: "agent", "script directory {dir} unreadable: {e}"),
        }
    }

    fn load_script(&self, path: &Path) {
        let script = match TraceScript::load(path, &self.ctx.probes) {
            Ok(Some(script)) => script,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "agent", "script {} failed to load: {e:#}", path.display());
                return;
            }
        };
        if let Err(e) = self.attach_script(script) {
            warn!(target: "agent", "script {} not onboarded: {e:#}", path.display());
        }
    }

    /// Bind a compiled script as a new local client and wait for its
    /// onboarding to complete.
    pub fn attach_script(&self, script: TraceScript) -> anyhow::Result<Arc<Client>> {
        let client = Client::from_script(self.ctx.clone(), script)?;
        if let Err(e) = client.onboard(&self.queue).wait() {
            client.disconnect(&self.queue);
            return Err(e);
        }
        self.clients
            .lock()
            .expect("client list poisoned")
            .push(client.clone());
        Ok(client)
    }

    /// Disconnect one client and forget it.
    pub fn disconnect_client(&self, client: &Arc<Client>) {
        client.disconnect(&self.queue);
        self.clients
            .lock()
            .expect("client list poisoned")
            .retain(|c| c.id() != client.id());
    }

    /// Tear down every connected client. Each one is deregistered before
    /// it closes, exactly like an individual disconnect.
    pub fn shutdown(&self) {
        let clients: Vec<_> = self
            .clients
            .lock()
            .expect("client list poisoned")
            .drain(..)
            .collect();
        for client in clients {
            client.send(Command::Exit { code: 0 });
            client.disconnect(&self.queue);
        }
    }
}
