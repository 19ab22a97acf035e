//! Fixed variant: a totally-ordered, static rank set driven by AI-
//! core RDMA QPs. One background worker drives every peer through the
//! shared FSM; once every peer reaches `OPERATIONAL` the manager stages a
//! contiguous `AiQpRmaQueueInfo` blob so on-device kernels can issue AI-core
//! RDMA directly (copying that blob onto the device itself stays the
//! embedder's job; this crate only stages it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::driver::QpHandle;
use crate::error::{Error, Result};
use crate::qpconn::common::{role_by_rank, spawn_worker, ConnState, DriveCtx, PeerTable};
use crate::qpconn::{PeerInfo, QpConnManager, WAIT_QP_READY_BASE, WAIT_QP_READY_PER_RANK};

/// One rank's slot in the on-device RMA queue blob: its QP handle plus the
/// `{key, addr, len}` MR table it advertised once `OPERATIONAL`.
#[derive(Debug, Clone)]
pub struct AiQpRankEntry {
    pub rank_id: usize,
    pub qp_handle: QpHandle,
}

/// The contiguous per-peer SQ/RQ/SCQ/RCQ descriptor + MR table blob, staged
/// host-side once every configured peer has reached `OPERATIONAL`.
#[derive(Debug, Clone, Default)]
pub struct AiQpRmaQueueInfo {
    pub entries: Vec<AiQpRankEntry>,
}

/// Fixed-variant `QpConnManager`: ranks totally ordered by `rank_id`: a
/// higher-ranked rank dials every lower-ranked peer; a lower-ranked rank
/// listens for every higher one.
pub struct FixedQpConnManager {
    self_rank: usize,
    ctx: Arc<DriveCtx>,
    table: Arc<PeerTable>,
    rank_count: Mutex<usize>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    listening: AtomicBool,
    self_port: u16,
}

impl FixedQpConnManager {
    pub fn new(self_rank: usize, self_port: u16, ctx: Arc<DriveCtx>) -> Self {
        Self {
            self_rank,
            ctx,
            table: Arc::new(PeerTable::default()),
            rank_count: Mutex::new(0),
            worker: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            listening: AtomicBool::new(false),
            self_port,
        }
    }

    fn ensure_listening(&self) -> Result<()> {
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
            *worker = Some(spawn_worker(table, ctx, shutdown, |_| true, "bmft-fixed-fsm"));
        }
    }

    /// The staged on-device blob, once every configured peer has reached
    /// `OPERATIONAL`. `None` while the rank set is still converging.
    pub fn qp_info_blob(&self) -> Option<AiQpRmaQueueInfo> {
        let expected = *self.rank_count.lock().unwrap();
        if expected == 0 {
            return None;
        }
        let channels = self.table.channels.lock().unwrap();
        if channels.len() != expected - 1 {
            return None;
        }
        let mut entries = Vec::with_capacity(channels.len());
        for (&rank, channel) in channels.iter() {
            let qp_handle = channel.qp_handle?;
            if channel.state != ConnState::Operational {
                return None;
            }
            entries.push(AiQpRankEntry { rank_id: rank, qp_handle });
        }
        entries.sort_by_key(|e| e.rank_id);
        Some(AiQpRmaQueueInfo { entries })
    }
}

impl QpConnManager for FixedQpConnManager {
    fn prepare(&self, peers: Vec<PeerInfo>) -> Result<()> {
        let rank_count = peers.len() + 1;
        *self.rank_count.lock().unwrap() = rank_count;
        self.table
            .diff_add_peers(self.self_rank, &peers, |p| Some(role_by_rank(self.self_rank, p.rank_id)));
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
        self.table
            .wait_for_state(&ranks, ConnState::QpReady, timeout)
    }

    fn wait_qp_ready(&self, rank_count: usize) -> Result<()> {
        let ranks = self.table.tracked_ranks();
        let budget = WAIT_QP_READY_BASE + WAIT_QP_READY_PER_RANK * rank_count as u32;
        self.table
            .wait_for_state(&ranks, ConnState::Operational, Some(budget))
    }

    fn remove_ranks(&self, ranks: &[usize]) -> Result<()> {
        // The Fixed variant's rank set is static by design: removal
        // would invalidate the rank-count invariant the on-device blob
        // relies on, so this is surfaced rather than silently honored.
        let _ = ranks;
        Err(Error::InvalidParam(
            "the Fixed QP-connection variant does not support rank removal".into(),
        )
        .record())
    }

    fn update_rank_options(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.prepare(peers)
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

impl Drop for FixedQpConnManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.table.notify();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
