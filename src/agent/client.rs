use crate::agent::context::ClientContext;
use crate::agent::queue::{SerializedQueue, TaskHandle};
use crate::comm::channel::{CommandChannel, CommandWriter, FrameWriter, TextWriter};
use crate::comm::{Command, CommandError};
use crate::script::{ScriptFile, TraceScript};
use crate::weak_error;
use crate::weaver::chain::Probe;
use crate::weaver::transformer::{ErrorSink, RewriteSpec};
use anyhow::bail;
use indexmap::IndexMap;
use log::{debug, info, warn};
use regex::Regex;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use strum_macros::Display;
use uuid::Uuid;

/// Client lifecycle. Every client walks the full path down to `Closed`;
/// deregistration from the transformer always happens before `Closed` is
/// reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ClientState {
    Connecting,
    Onboarding,
    Active,
    Disconnecting,
    Closed,
}

/// A live binding between one trace script and its consumer: local
/// script file or remote controller. Exactly one per connected consumer.
pub struct Client {
    id: Uuid,
    name: Mutex<String>,
    ctx: Arc<ClientContext>,
    state: Mutex<ClientState>,
    channel: CommandChannel,
    class_filter: Option<Regex>,
    probes: Vec<Probe>,
    params: Mutex<IndexMap<String, String>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

struct ChannelErrorSink {
    channel: CommandChannel,
}

impl ErrorSink for ChannelErrorSink {
    fn rewrite_error(&self, message: String) {
        _ = self.channel.send(Command::Error { message });
    }
}

impl Client {
    /// Bind a local script client tracing to the console or a file.
    pub fn from_script(ctx: Arc<ClientContext>, script: TraceScript) -> anyhow::Result<Arc<Client>> {
        let sink = local_sink(&ctx, &script.name)?;
        Ok(Self::build(
            ctx,
            script.name,
            script.class_filter,
            script.probes,
            sink,
        ))
    }

    /// Bind a remote client from a freshly accepted connection. The peer
    /// must open with its instrumentation request.
    pub fn from_stream(
        ctx: Arc<ClientContext>,
        stream: &TcpStream,
    ) -> anyhow::Result<Arc<Client>> {
        let mut reading = stream.try_clone()?;
        let opening = Command::read_from(&mut reading)?;
        let tag = opening.tag();
        let Command::Instrument { script, args } = opening else {
            bail!("protocol violation: expected an instrument request, got {tag:?}");
        };
        let raw = String::from_utf8(script)?;
        let file: ScriptFile = toml::from_str(&raw)?;
        let script = TraceScript::compile(file, "remote".to_string(), &ctx.probes)?;

        let sink = Box::new(FrameWriter(stream.try_clone()?));
        let client = Self::build(ctx, script.name, script.class_filter, script.probes, sink);
        let mut params = client.params.lock().expect("client lock poisoned");
        for arg in args {
            match arg.split_once('=') {
                Some((key, value)) => params.insert(key.to_string(), value.to_string()),
                None => params.insert(arg, String::new()),
            };
        }
        drop(params);
        Ok(client)
    }

    fn build(
        ctx: Arc<ClientContext>,
        name: String,
        class_filter: Option<Regex>,
        probes: Vec<Probe>,
        sink: Box<dyn CommandWriter>,
    ) -> Arc<Client> {
        let channel = CommandChannel::new(ctx.settings.cmd_queue_limit);
        let writer = channel.spawn_writer(sink);
        Arc::new(Client {
            id: Uuid::new_v4(),
            name: Mutex::new(name),
            ctx,
            state: Mutex::new(ClientState::Connecting),
            channel,
            class_filter,
            probes,
            params: Mutex::new(IndexMap::new()),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("client lock poisoned").clone()
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().expect("client lock poisoned")
    }

    pub fn param(&self, key: &str) -> Option<String> {
        self.params
            .lock()
            .expect("client lock poisoned")
            .get(key)
            .cloned()
    }

    /// Queue an outbound command. A closed or failed channel swallows the
    /// command; the owning connection is already on its way down.
    pub fn send(&self, cmd: Command) {
        if self.channel.send(cmd).is_err() {
            debug!(target: "agent", "dropped command for closed channel of `{}`", self.name());
        }
    }

    /// Register this client with the transformer and retransform what is
    /// already loaded. Runs as one task on the serialized queue; the
    /// caller may wait on the handle.
    pub fn onboard(self: &Arc<Self>, queue: &SerializedQueue) -> TaskHandle {
        let client = self.clone();
        queue.submit(move || client.onboard_on_worker())
    }

    fn onboard_on_worker(self: &Arc<Self>) -> anyhow::Result<()> {
        self.transition(ClientState::Onboarding)?;
        info!(target: "agent", "onboarding client `{}`", self.name());

        let name = self.claim_unique_name();
        let spec = Arc::new(RewriteSpec {
            client: self.id,
            client_name: name,
            class_filter: self.class_filter.clone(),
            probes: self.probes.clone(),
            errors: Arc::new(ChannelErrorSink {
                channel: self.channel.clone(),
            }),
        });
        self.ctx.transformer.register(spec);

        if self.ctx.settings.startup_retransform {
            self.retransform_loaded();
        }

        self.transition(ClientState::Active)?;
        self.send(Command::Success);
        Ok(())
    }

    /// Runs on the queue worker, so reading the name set and registering
    /// the renamed client cannot race another onboarding.
    fn claim_unique_name(&self) -> String {
        let mut name = self.name();
        let taken = self.ctx.transformer.snapshot().client_names();
        if taken.contains(&name) {
            let mut suffix = 1;
            while taken.contains(&format!("{name}-{suffix}")) {
                suffix += 1;
            }
            name = format!("{name}-{suffix}");
            *self.name.lock().expect("client lock poisoned") = name.clone();
            self.send(Command::Rename { name: name.clone() });
        }
        name
    }

    fn retransform_loaded(&self) {
        let targets: Vec<String> = self
            .ctx
            .host
            .loaded_units()
            .into_iter()
            .filter(|unit| {
                self.class_filter
                    .as_ref()
                    .map(|re| re.is_match(unit))
                    .unwrap_or(true)
            })
            .collect();
        self.send(Command::RetransformationStart {
            unit_count: targets.len() as u32,
        });
        for unit in targets {
            if self.ctx.settings.track_retransforms {
                self.send(Command::RetransformClass { name: unit.clone() });
            }
            // a unit the runtime refuses to touch costs an error report,
            // never the client
            if let Err(e) = self.ctx.host.retransform_unit(&unit, &self.ctx.transformer) {
                warn!(target: "agent", "retransform of `{unit}` failed: {e}");
                self.send(Command::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Start the control-command reader of a remote client. Call after
    /// onboarding so control commands never race the registration. The
    /// reader runs detached until the connection dies or the peer exits.
    pub fn start_reader(self: &Arc<Self>, stream: TcpStream, queue: Arc<SerializedQueue>) {
        let client = self.clone();
        let mut stream = stream;
        thread::Builder::new()
            .name("twr-client-reader".to_string())
            .spawn(move || {
                client.reader_loop(&mut stream, &queue);
                client.disconnect(&queue);
            })
            .expect("client reader must start");
    }

    fn reader_loop(self: &Arc<Self>, stream: &mut TcpStream, queue: &Arc<SerializedQueue>) {
        loop {
            match Command::read_from(stream) {
                Ok(Command::Exit { code }) => {
                    info!(target: "agent", "client `{}` sent exit ({code})", self.name());
                    return;
                }
                Ok(Command::RetransformClass { name }) => {
                    let client = self.clone();
                    let handle = queue.submit(move || {
                        if let Err(e) = client
                            .ctx
                            .host
                            .retransform_unit(&name, &client.ctx.transformer)
                        {
                            client.send(Command::Error {
                                message: e.to_string(),
                            });
                        }
                        Ok(())
                    });
                    weak_error!(handle.wait(), "retransform request failed:");
                }
                Ok(Command::SetParams { params }) => {
                    *self.params.lock().expect("client lock poisoned") =
                        params.into_iter().collect();
                    self.send(Command::Success);
                }
                Ok(Command::Event { name }) => {
                    info!(target: "agent", "client `{}` raised event `{name}`", self.name());
                }
                Ok(other) => {
                    warn!(
                        target: "agent",
                        "ignoring unexpected {:?} from client `{}`",
                        other.tag(),
                        self.name()
                    );
                }
                Err(CommandError::Io(e)) => {
                    // reset and broken pipe count as an implicit exit
                    debug!(target: "agent", "channel of `{}` failed: {e}", self.name());
                    return;
                }
                Err(e) => {
                    warn!(target: "agent", "protocol error from `{}`: {e}", self.name());
                    return;
                }
            }
        }
    }

    /// Tear this client down: deregister its specs so future loads no
    /// longer match, then drain and close its channel. Other clients and
    /// in-flight rewrite passes are untouched.
    pub fn disconnect(self: &Arc<Self>, queue: &SerializedQueue) {
        {
            let mut state = self.lock_state();
            match *state {
                ClientState::Disconnecting | ClientState::Closed => return,
                from => {
                    debug!(target: "agent", "client `{}`: {from} -> Disconnecting", self.name());
                    *state = ClientState::Disconnecting;
                }
            }
        }

        // deregistration must land before this client reads as closed,
        // otherwise a dead client leaks in the registry
        let client = self.clone();
        let done = queue.submit(move || {
            client.ctx.transformer.deregister(client.id);
            Ok(())
        });
        weak_error!(done.wait(), "deregistration failed:");

        self.channel.close();
        if let Some(writer) = self.writer.lock().expect("client lock poisoned").take() {
            _ = writer.join();
        }

        let mut state = self.lock_state();
        debug!(target: "agent", "client `{}`: {} -> Closed", self.name(), *state);
        *state = ClientState::Closed;
    }

    fn transition(&self, to: ClientState) -> anyhow::Result<()> {
        let mut state = self.lock_state();
        let legal = matches!(
            (*state, to),
            (ClientState::Connecting, ClientState::Onboarding)
                | (ClientState::Onboarding, ClientState::Active)
        );
        if !legal {
            bail!("illegal client state transition {} -> {to}", *state);
        }
        debug!(target: "agent", "client `{}`: {} -> {to}", self.name(), *state);
        *state = to;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("client lock poisoned")
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // a dropped client must not strand its writer on the condvar
        self.channel.close();
    }
}

fn local_sink(ctx: &ClientContext, name: &str) -> anyhow::Result<Box<dyn CommandWriter>> {
    if ctx.settings.stdout {
        return Ok(Box::new(TextWriter(std::io::stdout())));
    }
    let file_name = match &ctx.settings.output_file {
        Some(file) => file.clone(),
        None => {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
            format!("{name}-{stamp}.twr")
        }
    };
    let dir = ctx
        .settings
        .output_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = std::fs::File::create(dir.join(file_name))?;
    Ok(Box::new(TextWriter(file)))
}
