//! SSH transport binding.
//!
//! Sessions authenticate with the `none` method; the only channel type served
//! is `direct-tcpip`, which is routed into the [`GatewayForwarder`]. Every
//! other channel type keeps russh's default answer (refused).
//!
//! russh answers a channel open from inside the session loop, so the handler
//! only runs [`GatewayForwarder::admit`] there. Admitted channels are
//! confirmed at once and the rest of the request (resolution, adjacency proof,
//! dial) runs in its own task; a later rejection closes the channel before any
//! byte has been relayed in either direction.

use crate::config::{HostKeySource, ServerConfig};
use crate::gateway::{prober, GatewayForwarder};
use async_trait::async_trait;
use kangaroo_core::{DirectTcpip, KangarooError, KangarooResult};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, MethodSet};
use russh_keys::key::KeyPair;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Accepts SSH connections and hands each one a [`SessionHandler`].
#[derive(Clone)]
pub struct KangarooServer {
    listen: SocketAddr,
    ssh_config: Arc<Config>,
    forwarder: Arc<GatewayForwarder>,
}

impl KangarooServer {
    /// Load the host key and build the forwarder.
    ///
    /// # Errors
    ///
    /// Returns [`KangarooError::Config`] if the host key cannot be read or
    /// parsed.
    pub fn new(config: ServerConfig) -> KangarooResult<Self> {
        let key = load_host_key(&config.host_key)?;

        let prober = prober::build(config.prober);
        info!(prober = prober.name(), "adjacency prober ready");

        let forwarder = GatewayForwarder::new(config.policy, prober, config.dial_timeout);
        Ok(Self::from_parts(config.listen, key, Arc::new(forwarder)))
    }

    /// Assemble a server from an already loaded host key and forwarder.
    pub fn from_parts(listen: SocketAddr, key: KeyPair, forwarder: Arc<GatewayForwarder>) -> Self {
        let ssh_config = Config {
            methods: MethodSet::NONE,
            keys: vec![key],
            ..Default::default()
        };
        Self {
            listen,
            ssh_config: Arc::new(ssh_config),
            forwarder,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self) -> KangarooResult<()> {
        let listener = TcpListener::bind(self.listen).await.map_err(|e| {
            KangarooError::Config(format!("cannot listen on {}: {e}", self.listen))
        })?;
        info!(addr = %self.listen, "starting ssh server");
        self.serve(listener).await
    }

    /// Accept connections from `listener`, one session task each.
    pub async fn serve(self, listener: TcpListener) -> KangarooResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "new connection");

            let handler = SessionHandler {
                peer,
                forwarder: self.forwarder.clone(),
            };
            let config = self.ssh_config.clone();
            tokio::spawn(async move {
                let session = match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => session,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "handshake failed");
                        return;
                    }
                };
                if let Err(e) = session.await {
                    debug!(peer = %peer, error = %e, "session ended with error");
                }
            });
        }
    }
}

/// Per-connection handler.
pub struct SessionHandler {
    peer: SocketAddr,
    forwarder: Arc<GatewayForwarder>,
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        info!(peer = %self.peer, user, "session authenticated");
        Ok(Auth::Accept)
    }

    /// The handler's boolean answer carries no reason, so the rejection class
    /// and reason are logged here and by the forwarder.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let payload = DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator: originator_address.to_string(),
            originator_port,
        };
        let request = match self.forwarder.admit(&self.peer.to_string(), payload) {
            Ok(request) => request,
            Err(rejection) => {
                debug!(peer = %self.peer, %rejection, "channel refused");
                return Ok(false);
            }
        };

        let forwarder = self.forwarder.clone();
        let handle = session.handle();
        let id = channel.id();
        tokio::spawn(async move {
            let accept = move || async move { Ok::<_, io::Error>(channel.into_stream()) };
            if let Err(rejection) = forwarder.open(&request, accept).await {
                debug!(channel = %id, %rejection, "closing refused channel");
                let _ = handle.eof(id).await;
                let _ = handle.close(id).await;
            }
        });
        Ok(true)
    }
}

/// Read the host key from disk or decode it from inline material.
fn load_host_key(source: &HostKeySource) -> KangarooResult<KeyPair> {
    match source {
        HostKeySource::Path(path) => russh_keys::load_secret_key(path, None).map_err(|e| {
            KangarooError::Config(format!("cannot load host key {}: {e}", path.display()))
        }),
        HostKeySource::Inline(material) => russh_keys::decode_secret_key(material, None)
            .map_err(|e| KangarooError::Config(format!("cannot decode inline host key: {e}"))),
    }
}
