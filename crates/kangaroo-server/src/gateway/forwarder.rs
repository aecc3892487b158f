//! Forward-request handling: resolve, evaluate policy, prove adjacency,
//! dial, splice.
//!
//! ```text
//! Received → Resolved → Evaluated ─┬─ Denied                 (reject)
//!                                  └─ [ProofRequired] ─┬─ Unproved (reject)
//!                                                      └─ Proved
//!          → Dialed (or dial failure: reject) → Spliced → Closed
//! ```
//!
//! Every rejection is local to the request: it is logged, returned to the
//! transport as a [`Rejection`], and nothing else is affected.
//!
//! [`GatewayForwarder::admit`] is the synchronous part that runs while the
//! channel open is being answered. It never touches the network, so IP-literal
//! destinations that policy denies are refused outright. Everything that may
//! block (resolution, the adjacency proof and the dial) happens in
//! [`GatewayForwarder::open`], which the transport runs off its session loop.

use super::prober::AdjacencyProber;
use super::resolver::DnsResolver;
use super::splice::{spawn_splice, SpliceStats};
use kangaroo_core::{Decision, DirectTcpip, ForwardRequest, PolicyTable};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome class reported to the transport when a channel is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Malformed request, resolution, dial or channel failure.
    ConnectionFailed,
    /// Policy denial or failed adjacency proof.
    AdministrativelyProhibited,
}

/// Why a forward request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub reason: String,
}

impl Rejection {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::ConnectionFailed,
            reason: reason.into(),
        }
    }

    fn prohibited(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::AdministrativelyProhibited,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RejectKind::ConnectionFailed => "connection failed",
            RejectKind::AdministrativelyProhibited => "administratively prohibited",
        };
        write!(f, "{kind}: {}", self.reason)
    }
}

/// Authorizes and carries out forward requests.
///
/// Holds the read-only policy table and the configured prober; cheap to share
/// behind an `Arc` across every session.
pub struct GatewayForwarder {
    policy: Arc<PolicyTable>,
    prober: Arc<dyn AdjacencyProber>,
    dial_timeout: Duration,
}

impl GatewayForwarder {
    pub fn new(
        policy: Arc<PolicyTable>,
        prober: Arc<dyn AdjacencyProber>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            prober,
            dial_timeout,
        }
    }

    /// Run a request up to and including the dial.
    ///
    /// Returns the connected socket, or the [`Rejection`] for the first step
    /// that failed. Dropping the returned future cancels an in-flight dial.
    pub async fn authorize(&self, request: &ForwardRequest) -> Result<TcpStream, Rejection> {
        let src = request.source;

        // Resolved
        let dst = DnsResolver::resolve_first(&request.dest_host)
            .await
            .map_err(Rejection::failed)?;

        // Evaluated
        if self.check_policy(src, dst)? {
            // Proof
            self.prove_adjacency(dst).await?;
        }

        // Dialed
        self.dial(&request.dest_host, request.dest_port).await
    }

    /// Evaluate policy for one (source, destination) pair. Returns whether the
    /// allow requires an adjacency proof.
    fn check_policy(&self, src: IpAddr, dst: IpAddr) -> Result<bool, Rejection> {
        let decision = self.policy.evaluate(src, dst);
        debug!(src = %src, dst = %dst, ?decision, "policy evaluated");
        match &decision {
            Decision::Allow { .. } => Ok(decision.requires_link_proof()),
            Decision::Deny { policy, reason } => Err(Rejection::prohibited(format!(
                "access to {dst} is not allowed (policy {policy}: {reason})"
            ))),
            Decision::Unmatched => Err(Rejection::prohibited(format!(
                "no policy applies to {src} -> {dst}"
            ))),
        }
    }

    async fn prove_adjacency(&self, dst: IpAddr) -> Result<(), Rejection> {
        if self.prober.is_link_local(dst).await {
            debug!(dst = %dst, prober = self.prober.name(), "adjacency proved");
            Ok(())
        } else {
            Err(Rejection::prohibited(format!("{dst} is not on the local link")))
        }
    }

    /// Dial the host string from the request, not the resolved address.
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, Rejection> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Rejection::failed(e.to_string())),
            Err(_) => Err(Rejection::failed(format!(
                "connect to {host}:{port} timed out after {:?}",
                self.dial_timeout
            ))),
        }
    }

    /// Validate a `direct-tcpip` open without blocking.
    ///
    /// Builds the request from the session's remote address (`peer`, as the
    /// transport reports it) and the decoded payload. When the destination is
    /// an IP literal the policy is checked here too, so a denial is refused
    /// before any channel exists. Hostname destinations are checked by
    /// [`open`](Self::open) once resolved.
    pub fn admit(&self, peer: &str, payload: DirectTcpip) -> Result<ForwardRequest, Rejection> {
        let request = ForwardRequest::from_direct_tcpip(peer, payload).map_err(|e| {
            warn!(peer, error = %e, "rejecting malformed forward request");
            Rejection::failed(e.to_string())
        })?;
        if let Some(dst) = DnsResolver::literal(&request.dest_host) {
            if let Err(rejection) = self.check_policy(request.source, dst) {
                info!(forward = %label(&request), reason = %rejection.reason, "forward denied");
                return Err(rejection);
            }
        }
        Ok(request)
    }

    /// Handle one request end to end.
    ///
    /// On authorization, `accept` is called to accept the tunnel channel and
    /// the splice is spawned. If accepting fails the dialed socket is closed.
    pub async fn open<A, Fut, C>(
        &self,
        request: &ForwardRequest,
        accept: A,
    ) -> Result<JoinHandle<SpliceStats>, Rejection>
    where
        A: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<C>>,
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label(request);

        let socket = match self.authorize(request).await {
            Ok(socket) => socket,
            Err(rejection) => {
                match rejection.kind {
                    RejectKind::AdministrativelyProhibited => {
                        info!(forward = %label, reason = %rejection.reason, "forward denied")
                    }
                    RejectKind::ConnectionFailed => {
                        warn!(forward = %label, reason = %rejection.reason, "forward failed")
                    }
                }
                return Err(rejection);
            }
        };

        let channel = match accept().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(forward = %label, error = %e, "channel accept failed");
                drop(socket);
                return Err(Rejection::failed(format!("channel accept failed: {e}")));
            }
        };

        info!(forward = %label, "forward established");
        Ok(spawn_splice(channel, socket, label))
    }
}

fn label(request: &ForwardRequest) -> String {
    format!(
        "{}:{} -> {}:{}",
        request.source, request.origin_port, request.dest_host, request.dest_port
    )
}
