//! Carrying requests to a server.

use crate::protocol::{
    Request, Response, decode_request, decode_response, encode_request, encode_response,
};
use crate::server::SessionServer;
use sqlentity_core::Result;
use std::sync::Arc;

/// One blocking round trip to the peer.
///
/// A transport only moves bytes; it neither retries nor reorders.
/// Mutation requests are not retry-safe (see [`Request`]), so an
/// implementation that loses a reply must report the failure and leave
/// recovery to the caller.
pub trait Transport: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn call(&self, request: Request) -> Result<Response>;
}

/// In-process transport driving a [`SessionServer`] directly.
///
/// Both legs still pass through the full encode/decode cycle, so every
/// call exercises exactly the representation a socket transport would
/// put on the wire.
pub struct Loopback {
    server: Arc<SessionServer>,
}

impl Loopback {
    pub fn new(server: Arc<SessionServer>) -> Self {
        Self { server }
    }
}

impl Transport for Loopback {
    fn call(&self, request: Request) -> Result<Response> {
        let encoded = encode_request(&request)?;
        tracing::trace!(op = request.label(), bytes = encoded.len(), "loopback call");
        let response = self.server.dispatch(decode_request(&encoded)?);
        decode_response(&encode_response(&response)?)
    }
}

impl std::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loopback")
            .field("server", &self.server)
            .finish()
    }
}
