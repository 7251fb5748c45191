use crate::agent::client::Client;
use crate::agent::context::ClientContext;
use crate::agent::queue::SerializedQueue;
use log::{debug, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

/// Accept loop for remote clients. Everything past the raw accept is
/// funneled through the serialized onboarding queue, so a burst of
/// connecting controllers still mutates the registry one at a time.
pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub fn bind(port: u16) -> std::io::Result<Server> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Server { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(
        self,
        ctx: Arc<ClientContext>,
        queue: Arc<SerializedQueue>,
        clients: Arc<Mutex<Vec<Arc<Client>>>>,
    ) {
        loop {
            debug!(target: "agent", "waiting for clients");
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(target: "agent", "client accepted from {peer}");
                    if let Err(e) = handle_connection(stream, &ctx, &queue, &clients) {
                        warn!(target: "agent", "client from {peer} rejected: {e:#}");
                    }
                }
                Err(e) => {
                    warn!(target: "agent", "accept failed: {e}");
                }
            }
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    ctx: &Arc<ClientContext>,
    queue: &Arc<SerializedQueue>,
    clients: &Arc<Mutex<Vec<Arc<Client>>>>,
) -> anyhow::Result<()> {
    let client = Client::from_stream(ctx.clone(), &stream)?;
    if let Err(e) = client.onboard(queue).wait() {
        client.disconnect(queue);
        return Err(e);
    }
    client.start_reader(stream, queue.clone());
    clients
        .lock()
        .expect("client list poisoned")
        .push(client);
    Ok(())
}
