//! Bipartite variant: two disjoint roles, Sender and Receiver.
//! Same-role peers are never connected. Receivers whitelist and listen;
//! Senders dial. Peers may be added after startup; MR updates land on the
//! existing QPs without dropping them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Role;
use crate::driver::QpHandle;
use crate::error::Result;
use crate::qpconn::common::{spawn_worker, ConnState, DriveCtx, PeerRole, PeerTable};
use crate::qpconn::{PeerInfo, QpConnManager, WAIT_QP_READY_BASE, WAIT_QP_READY_PER_RANK};

/// Bipartite-variant `QpConnManager`: `Sender` peers dial `Receiver` peers;
/// same-role peers are ignored entirely (no channel is ever created for
/// them).
pub struct BipartiteQpConnManager {
    self_rank: usize,
    self_role: Role,
    self_port: u16,
    ctx: Arc<DriveCtx>,
    table: Arc<PeerTable>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    listening: AtomicBool,
}

impl BipartiteQpConnManager {
    pub fn new(self_rank: usize, self_role: Role, self_port: u16, ctx: Arc<DriveCtx>) -> Self {
        Self {
            self_rank,
            self_role,
            self_port,
            ctx,
            table: Arc::new(PeerTable::default()),
            worker: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            listening: AtomicBool::new(false),
        }
    }

    /// `Receiver` peers connected to this rank's NIC port only if this rank
    /// is itself a `Sender` (or vice versa) start a listener; a `Receiver`
    /// always listens since only Senders ever dial.
    fn ensure_listening(&self) -> Result<()> {
        if self.self_role != Role::Receiver {
            return Ok(());
        }
        if !self.listening.swap(true, Ordering::AcqRel) {
            self.ctx.socket.listen(self.self_port)?;
        }
        Ok(())
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            let table = self.table.clone();
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            *worker = Some(spawn_worker(
                table,
                ctx,
                shutdown,
                |_| true,
                "bmft-bipartite-fsm",
            ));
        }
    }

    fn role_for(&self, peer: &PeerInfo) -> Option<PeerRole> {
        let peer_role = peer.role?;
        if peer_role == self.self_role {
            return None;
        }
        Some(match self.self_role {
            Role::Sender => PeerRole::Client,
            Role::Receiver => PeerRole::Server,
            Role::Peer => return None,
        })
    }
}

impl QpConnManager for BipartiteQpConnManager {
    fn prepare(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.table
            .diff_add_peers(self.self_rank, &peers, |p| self.role_for(p));
        self.ensure_listening()?;
        self.ensure_worker();
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
        self.table
            .remove_ranks(ranks, self.ctx.nic.as_ref(), self.ctx.socket.as_ref());
        Ok(())
    }

    fn update_rank_options(&self, peers: Vec<PeerInfo>) -> Result<()> {
        // Concurrent peer addition: diff against the already-live
        // rank set and only connect what is new, leaving established QPs
        // untouched.
        self.table
            .diff_add_peers(self.self_rank, &peers, |p| self.role_for(p));
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

impl Drop for BipartiteQpConnManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.table.notify();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_role_peers_get_no_channel() {
        let sender = PeerInfo {
            rank_id: 1,
            nic: "tcp://127.0.0.1:1".parse().unwrap(),
            role: Some(Role::Sender),
        };
        let mgr_role = Role::Sender;
        let resolve = |p: &PeerInfo| -> Option<PeerRole> {
            let peer_role = p.role?;
            if peer_role == mgr_role {
                return None;
            }
            Some(PeerRole::Client)
        };
        assert!(resolve(&sender).is_none());
    }
}
