//! Opaque rendezvous client: a TCP key-value store used only to bootstrap QP
//! connections. Data traffic never traverses it.
//!
//! The wire framing (length-prefixed `put`/`get`) follows the same
//! `stream_write`/`stream_read` shape used for QP endpoint exchange
//! elsewhere in this crate; here it is generalized into a small request/
//! response protocol against a single long-lived store process.

mod client;
mod wire;

pub use client::TcpRendezvousClient;

use crate::error::Result;

/// Opaque rendezvous operations: `put`/`get`/`barrier`/`allgather` over
/// an external KV store. Only the QP bootstrap uses this; it is never on the
/// data path.
pub trait Rendezvous {
    /// Store `value` under `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve the value stored under `key`, blocking until it appears.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Block until every member of `group` has called `barrier` with the
    /// same group name.
    fn barrier(&self, group: &str) -> Result<()>;

    /// Exchange `bytes` with every member of `group`; returns one entry per
    /// member, ordered by rank, including the caller's own contribution.
    fn allgather(&self, group: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>>;
}
