//! Per-call state threaded through every stage of a chain.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::path::HopPosition;
use super::{MeshError, MeshResult};
use crate::protocols::{Connection, NetworkServiceEndpoint};

/// Candidates produced by discovery for the selection stage.
#[derive(Debug, Clone)]
pub struct Discovered {
    /// Service name the candidates were looked up under. Keys the rotation cursor.
    pub network_service: String,
    pub endpoints: Vec<NetworkServiceEndpoint>,
    /// Candidates are forwarders interposed in front of the requested service.
    pub interposed: bool,
}

/// State for one request or close call at one hop.
///
/// Created by whoever enters the chain (the RPC handler or a client) and passed by
/// mutable reference to each stage in turn.
#[derive(Debug)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    caller_token: Option<String>,
    hop: Option<HopPosition>,
    discovered: Option<Discovered>,
    target: Option<String>,
    dialed: Option<String>,
    established: Vec<Option<Connection>>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
            caller_token: None,
            hop: None,
            discovered: None,
            target: None,
            dialed: None,
            established: Vec::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keeps the earlier of the existing and the given deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Bearer token presented by the caller on the inbound call.
    pub fn with_caller_token(mut self, token: impl Into<String>) -> Self {
        self.caller_token = Some(token.into());
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when the call is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Per-attempt timeout clamped to the time left on the call.
    pub fn bounded_timeout(&self, per_attempt: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(per_attempt),
            None => per_attempt,
        }
    }

    /// Fails fast when the call was cancelled or its deadline passed before work
    /// towards `address` began.
    pub fn ensure_live(&self, address: &str) -> MeshResult<()> {
        if self.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        if self.remaining() == Some(Duration::ZERO) {
            return Err(MeshError::Timeout {
                address: address.to_string(),
                timeout_ms: 0,
            });
        }
        Ok(())
    }

    pub fn caller_token(&self) -> Option<&str> {
        self.caller_token.as_deref()
    }

    pub fn hop(&self) -> Option<&HopPosition> {
        self.hop.as_ref()
    }

    pub fn set_hop(&mut self, hop: Option<HopPosition>) {
        self.hop = hop;
    }

    /// Key identifying this hop's share of a connection: the hop's own path
    /// segment id, or the connection id for hops that do not sit on the path.
    pub fn hop_key(&self, connection: &Connection) -> String {
        match &self.hop {
            Some(hop) => hop.segment_id.clone(),
            None => connection.id.clone(),
        }
    }

    pub fn set_discovered(&mut self, discovered: Discovered) {
        self.discovered = Some(discovered);
    }

    pub fn take_discovered(&mut self) -> Option<Discovered> {
        self.discovered.take()
    }

    /// Address chosen by selection for the forwarding stage.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn set_target(&mut self, address: Option<String>) {
        self.target = address;
        self.dialed = None;
    }

    /// Address the forwarding stage actually dialed on the last attempt.
    pub fn dialed(&self) -> Option<&str> {
        self.dialed.as_deref()
    }

    pub fn set_dialed(&mut self, address: impl Into<String>) {
        self.dialed = Some(address.into());
    }

    pub(crate) fn reset_established(&mut self, depth: usize) {
        if self.established.len() <= depth {
            self.established.resize(depth + 1, None);
        }
        self.established[depth] = None;
    }

    pub(crate) fn mark_established(&mut self, depth: usize, connection: &Connection) {
        if self.established.len() <= depth {
            self.established.resize(depth + 1, None);
        }
        self.established[depth] = Some(connection.clone());
    }

    pub(crate) fn take_established(&mut self, depth: usize) -> Option<Connection> {
        self.established.get_mut(depth).and_then(Option::take)
    }
}
