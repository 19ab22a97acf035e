//! Joinable variant: peers may join or leave the rank set at any
//! time. Lower-ranked peers are dialed as clients; higher-ranked peers are
//! served. Two background threads drive the client half and the server
//! half of the rank set independently, each waking on the shared condvar
//! when the peer set changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::driver::QpHandle;
use crate::error::Result;
use crate::qpconn::common::{role_by_rank, spawn_worker, ConnState, DriveCtx, PeerRole, PeerTable};
use crate::qpconn::{PeerInfo, QpConnManager, WAIT_QP_READY_BASE, WAIT_QP_READY_PER_RANK};

/// Joinable-variant `QpConnManager`: the only variant whose rank set may
/// shrink as well as grow. Removal destroys the peer's QP (ref-count
/// decrement to zero) and closes its socket; a subsequent
/// `get_qp_handle_with_rank_id` then returns `None`.
pub struct JoinableQpConnManager {
    self_rank: usize,
    self_port: u16,
    ctx: Arc<DriveCtx>,
    table: Arc<PeerTable>,
    client_worker: Mutex<Option<thread::JoinHandle<()>>>,
    server_worker: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    listening: AtomicBool,
}

impl JoinableQpConnManager {
    pub fn new(self_rank: usize, self_port: u16, ctx: Arc<DriveCtx>) -> Self {
        Self {
            self_rank,
            self_port,
            ctx,
            table: Arc::new(PeerTable::default()),
            client_worker: Mutex::new(None),
            server_worker: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            listening: AtomicBool::new(false),
        }
    }

    fn ensure_listening(&self) -> Result<()> {
        if !self.listening.swap(true, Ordering::AcqRel) {
            self.ctx.socket.listen(self.self_port)?;
        }
        Ok(())
    }

    /// Starts the client-side worker (drives `new_clients_`) and the
    /// server-side worker (drives `new_servers_`) the first time either is
    /// needed; both share `table`'s single condvar, so either a join or a
    /// removal wakes both promptly.
    fn ensure_workers(&self) {
        let mut client_worker = self.client_worker.lock().unwrap();
        if client_worker.is_none() {
            *client_worker = Some(spawn_worker(
                self.table.clone(),
                self.ctx.clone(),
                self.shutdown.clone(),
                |c| c.role == PeerRole::Client,
                "bmft-joinable-client",
            ));
        }
        let mut server_worker = self.server_worker.lock().unwrap();
        if server_worker.is_none() {
            *server_worker = Some(spawn_worker(
                self.table.clone(),
                self.ctx.clone(),
                self.shutdown.clone(),
                |c| c.role == PeerRole::Server,
                "bmft-joinable-server",
            ));
        }
    }
}

impl QpConnManager for JoinableQpConnManager {
    fn prepare(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.table
            .diff_add_peers(self.self_rank, &peers, |p| Some(role_by_rank(self.self_rank, p.rank_id)));
        self.ensure_listening()?;
        self.ensure_workers();
        Ok(())
    }

    fn async_connect(&self) -> Result<()> {
        self.table.notify();
        Ok(())
    }

    fn wait_for_connected(&self, timeout: Option<Duration>) -> Result<()> {
        let ranks = self.table.tracked_ranks();
        self.table.wait_for_state(&ranks, ConnState::QpReady, timeout)
    }

    fn wait_qp_ready(&self, rank_count: usize) -> Result<()> {
        let ranks = self.table.tracked_ranks();
        let budget = WAIT_QP_READY_BASE + WAIT_QP_READY_PER_RANK * rank_count as u32;
        self.table
            .wait_for_state(&ranks, ConnState::Operational, Some(budget))
    }

    fn remove_ranks(&self, ranks: &[usize]) -> Result<()> {
        // `new_servers_`/`new_clients_` grow the tracked set; removal here
        // is the dual, shrinking it. Both halves share the same map, so one
        // removal call suffices regardless of which role the peer held.
        self.table
            .remove_ranks(ranks, self.ctx.nic.as_ref(), self.ctx.socket.as_ref());
        Ok(())
    }

    fn update_rank_options(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.table
            .diff_add_peers(self.self_rank, &peers, |p| Some(role_by_rank(self.self_rank, p.rank_id)));
        self.table.notify();
        Ok(())
    }

    fn get_qp_handle_with_rank_id(&self, rank: usize) -> Option<QpHandle> {
        self.table.get_qp_handle_with_rank_id(rank)
    }

    fn put_qp_handle(&self, rank: usize) {
        self.table.put_qp_handle(rank, self.ctx.nic.as_ref());
    }

    fn operational_ranks(&self) -> Vec<usize> {
        self.table.operational_ranks()
    }

    fn remote_mr_table(&self, rank: usize) -> std::sync::Arc<crate::mrtable::RemoteMrTable> {
        self.table.remote_mrs_for(rank)
    }
}

impl Drop for JoinableQpConnManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.table.notify();
        if let Some(handle) = self.client_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.server_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
