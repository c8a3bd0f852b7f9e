//! Remote sessions for SQLEntity.
//!
//! Splits a logical connection across a wire: the client side is a
//! `RemoteBacking` that forwards whole operations, the server side a
//! `SessionServer` that runs them on per-session logical connections
//! against its own pool. The protocol is a serde request/reply pair
//! carried by a pluggable `Transport`; `Loopback` wires both halves
//! together in-process, which is also how the tests run.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{RemoteBacking, RemoteCursor};
pub use protocol::{
    Fault, Request, Response, WireRow, decode_request, decode_response, encode_request,
    encode_response,
};
pub use server::SessionServer;
pub use transport::{Loopback, Transport};
