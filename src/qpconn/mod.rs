//! QP-Connection Manager: the per-peer connection state machine shared by
//! the three role variants ([`fixed`], [`bipartite`], [`joinable`]).
//!
//! All three drive the same per-peer progression
//! (`ServerWhitelistAdd -> ClientConnect -> QueryConnect -> ConnectQp ->
//! QueryQpState -> OPERATIONAL`, with `UpdateLocalMr`/`UpdateRemoteMr`
//! feeding back into `QueryQpState`); they differ only in how peers are
//! assigned the client/server role and in their membership-change policy.
//! [`common`] holds that shared dispatcher so each variant stays a thin
//! policy layer over it, per the "tagged variants with a shared core"
//! design note.

mod common;
pub mod bipartite;
pub mod fixed;
pub mod joinable;

pub use common::{ConnState, ConnectionChannel, DriveCtx, PeerRole, UserQpInfo};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::mrtable::RemoteMrTable;
use crate::net::NicAddr;

pub use crate::mrtable::MR_MAX_NUM;

/// Backoff applied after a socket-op failure before the same task retries.
pub const SOCKET_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff between whitelist-add retries.
pub const WHITELIST_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff between batch-connect retries.
pub const BATCH_CONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff between query-qp-state retries.
pub const QUERY_QP_STATE_BACKOFF: Duration = Duration::from_secs(1);

/// Budget constants for `WaitQpReady`: `BASE + PER_RANK * rank_count`, at a
/// `5ms` polling interval.
pub const WAIT_QP_READY_BASE: Duration = Duration::from_secs(30);
pub const WAIT_QP_READY_PER_RANK: Duration = Duration::from_millis(100);
pub const WAIT_QP_READY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Ceiling a background worker's condvar wait sleeps for between passes when
/// nothing wakes it early.
pub const WORKER_WAKE_CEILING: Duration = Duration::from_millis(300);

/// A peer's rank id and NIC address, as carried in `TransportOptions`.
/// `role` is only meaningful to the Bipartite variant, which must tell
/// Sender peers from Receiver peers to decide which peers to connect to at
/// all (same-role peers are ignored); Fixed and Joinable derive role purely
/// from rank-id comparison and leave it `None`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub rank_id: usize,
    pub nic: NicAddr,
    pub role: Option<crate::config::Role>,
}

/// Shared interface implemented by the three FSM variants.
pub trait QpConnManager: Send + Sync {
    /// Validate and adopt `peers` as the rank set to converge on, starting
    /// (or updating) the background worker(s).
    fn prepare(&self, peers: Vec<PeerInfo>) -> Result<()>;

    /// Kick off connection progression without blocking.
    fn async_connect(&self) -> Result<()>;

    /// Block until every prepared peer reaches at least `QP_READY`, or
    /// `timeout` elapses (`None` waits indefinitely).
    fn wait_for_connected(&self, timeout: Option<Duration>) -> Result<()>;

    /// Block until every prepared peer reaches `OPERATIONAL`, bounded by
    /// `BASE + PER_RANK * rank_count`.
    fn wait_qp_ready(&self, rank_count: usize) -> Result<()>;

    /// Tear down the given peers' connections; any of their in-flight
    /// streams are left for the caller to invalidate.
    fn remove_ranks(&self, ranks: &[usize]) -> Result<()>;

    /// Same as `prepare`, but against an already-running FSM: only the
    /// diff (additions) triggers new connection work.
    fn update_rank_options(&self, peers: Vec<PeerInfo>) -> Result<()>;

    /// Borrow the live QP handle for `rank`, bumping its reference count.
    /// Returns `None` if the peer was removed or never reached
    /// `OPERATIONAL`.
    fn get_qp_handle_with_rank_id(&self, rank: usize) -> Option<crate::driver::QpHandle>;

    /// Release a handle obtained from `get_qp_handle_with_rank_id`.
    fn put_qp_handle(&self, rank: usize);

    /// Ranks currently `OPERATIONAL`.
    fn operational_ranks(&self) -> Vec<usize>;

    /// The remote MR table tracking `rank`'s advertised memory regions,
    /// created lazily. `transport::Transport` feeds this from rendezvous-
    /// exchanged [`crate::net::MemoryKey`]s once a peer is `Operational`.
    fn remote_mr_table(&self, rank: usize) -> Arc<RemoteMrTable>;
}

/// Ordered by rank id: the software reference driver's accept-poll has no
/// way to tag an inbound connection with its peer's rank, so the server
/// side assigns newly accepted sockets to pending peers in ascending rank
/// order, which is stable only if iteration itself is ordered.
pub(crate) type PeerMap = BTreeMap<usize, ConnectionChannel>;
