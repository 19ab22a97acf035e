//! Transport Manager: the per-rank facade and the crate's only public
//! surface. Registers user memory, maps it into local/peer key tables, and
//! submits remote read/write/notify work requests onto the hardware
//! submission/completion queue, synchronizing completion via a notify word.
//!
//! `Transport` owns its [`QpConnManager`] and MR tables exclusively; it
//! never hands out the manager or the tables themselves, only the narrow
//! operations below.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{InitialType, QpConnVariant, Role, TransportOptions};
use crate::driver::{ChipInfo, HalDriver, MrAccess as DriverMrAccess, NicDriver, QpMode, RdmaOp, SendWr, WrFlags};
use crate::error::{Error, Result};
use crate::mrtable::{LocalMr, LocalMrTable, MrAccess, MrFlags, RemoteMr, RemoteMrTable};
use crate::net::{MemoryKey, MemoryKeyType, NicAddr};
use crate::qpconn::bipartite::BipartiteQpConnManager;
use crate::qpconn::fixed::FixedQpConnManager;
use crate::qpconn::joinable::JoinableQpConnManager;
use crate::qpconn::{DriveCtx, PeerInfo, QpConnManager};
use crate::rendezvous::Rendezvous;
use crate::socket::SocketFabric;
use crate::stream::doorbell::{self, DoorbellAddressing};
use crate::stream::notify::StreamNotify;
use crate::stream::{SqeType, Stream};

/// Group name used for the rendezvous-driven memory-key allgather that
/// follows `connect()`. Not a wire-format detail; any name works as long as
/// every rank agrees on it, which they do by construction (it's a constant).
const MR_EXCHANGE_GROUP: &str = "bmft-mr-keys";

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadCtx {
    generation: u64,
    stream: Stream,
    notify: StreamNotify,
}

thread_local! {
    static THREAD_CTXS: RefCell<HashMap<u64, ThreadCtx>> = RefCell::new(HashMap::new());
}

/// Per-rank transport facade: `open_device`, `register_memory_region`,
/// `prepare`, `connect`, `read_remote`/`write_remote`, `synchronize`.
pub struct Transport {
    id: u64,
    self_rank: usize,
    rank_count: AtomicUsize,
    nic: Arc<dyn NicDriver>,
    hal: Arc<dyn HalDriver>,
    local_mrs: Arc<LocalMrTable>,
    qpconn: Box<dyn QpConnManager>,
    addressing: DoorbellAddressing,
    notify_addr: u64,
    notify_lkey: u32,
    notify_rkey: u32,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    /// Bumped by `remove_ranks`; thread-local streams whose `generation`
    /// falls behind are rebuilt on next use, modeling "destroy all
    /// thread-local streams" without requiring access to other threads'
    /// thread-local storage.
    stream_generation: AtomicU64,
}

fn to_driver_access(a: MrAccess) -> DriverMrAccess {
    DriverMrAccess {
        local_write: a.local_write,
        remote_write: a.remote_write,
        remote_read: a.remote_read,
        reduce: a.reduce,
    }
}

fn chip_info_to_addressing(chip: ChipInfo) -> DoorbellAddressing {
    DoorbellAddressing {
        rocee_base: chip.rocee_base,
        rocee_vf_db_cfg0: chip.rocee_vf_db_cfg0,
        chip_offset: chip.chip_offset,
        die_offset: chip.die_offset,
        chip_id: chip.chip_id,
        die_id: chip.die_id,
        chip_addr: chip.chip_addr,
    }
}

/// Builder for [`Transport::open_device`], for embedders that want to attach
/// a rendezvous client before the first `connect()`.
#[derive(Default)]
pub struct TransportBuilder {
    rendezvous: Option<Arc<dyn Rendezvous>>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a rendezvous client used by `connect()` to allgather memory
    /// keys across the peer set. Without one, `connect()` still completes
    /// the QP handshake but leaves remote MR tables empty, so
    /// `read_remote`/`write_remote` will fail `INVALID_PARAM` until the
    /// caller feeds remote MRs some other way.
    pub fn rendezvous(mut self, rendezvous: Arc<dyn Rendezvous>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn open(
        self,
        options: TransportOptions,
        nic: Arc<dyn NicDriver>,
        hal: Arc<dyn HalDriver>,
    ) -> Result<Transport> {
        Transport::open_device_impl(options, nic, hal, self.rendezvous)
    }
}

impl Transport {
    /// `OpenDevice`: validate options, bring up the driver, resolve
    /// doorbell addressing, allocate the notify buffer, and construct the
    /// role-specific [`QpConnManager`].
    pub fn open_device(
        options: TransportOptions,
        nic: Arc<dyn NicDriver>,
        hal: Arc<dyn HalDriver>,
    ) -> Result<Self> {
        TransportBuilder::new().open(options, nic, hal)
    }

    fn open_device_impl(
        options: TransportOptions,
        nic: Arc<dyn NicDriver>,
        hal: Arc<dyn HalDriver>,
        rendezvous: Option<Arc<dyn Rendezvous>>,
    ) -> Result<Self> {
        let local_nic: NicAddr = options.validate()?;
        nic.init()?;
        nic.socket_init()?;

        let chip = nic.chip_info()?;
        let addressing = chip_info_to_addressing(chip);

        let notify_addr = nic.notify_base_addr()?;
        let notify_keys = nic.notify_mr_info()?;

        let local_mrs = Arc::new(LocalMrTable::new());
        let socket = Arc::new(SocketFabric::new(nic.clone()));
        let qp_mode = match options.variant() {
            QpConnVariant::Fixed => QpMode::AiCore,
            QpConnVariant::Bipartite | QpConnVariant::Joinable => QpMode::Standard,
        };
        let ctx = Arc::new(DriveCtx {
            nic: nic.clone(),
            socket,
            qp_mode,
            local_mrs: local_mrs.clone(),
        });

        let qpconn: Box<dyn QpConnManager> = match options.variant() {
            QpConnVariant::Fixed => {
                if options.initial_type != InitialType::AiCore {
                    return Err(Error::InvalidParam(
                        "Fixed variant requires initial_type = AiCore".into(),
                    )
                    .record());
                }
                Box::new(FixedQpConnManager::new(options.rank_id, local_nic.port, ctx))
            }
            QpConnVariant::Bipartite => Box::new(BipartiteQpConnManager::new(
                options.rank_id,
                options.role,
                local_nic.port,
                ctx,
            )),
            QpConnVariant::Joinable => {
                Box::new(JoinableQpConnManager::new(options.rank_id, local_nic.port, ctx))
            }
        };

        Ok(Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            self_rank: options.rank_id,
            rank_count: AtomicUsize::new(options.rank_count),
            nic,
            hal,
            local_mrs,
            qpconn,
            addressing,
            notify_addr,
            notify_lkey: notify_keys.lkey,
            notify_rkey: notify_keys.rkey,
            rendezvous,
            stream_generation: AtomicU64::new(0),
        })
    }

    /// Build `TransportOptions` plus this rank's peer set from a loaded
    /// [`crate::config::ClusterConfig`], a TOML bring-up convention. Every peer's role is left
    /// `None` (the Joinable/Fixed variants derive client/server purely from
    /// rank-id comparison); a `ClusterConfig`-driven Bipartite deployment
    /// still needs its roles assigned out of band.
    pub fn plan_from_cluster(
        cfg: &crate::config::ClusterConfig,
        self_rank: usize,
    ) -> Result<(TransportOptions, Vec<PeerInfo>)> {
        let nics = cfg.peer_nics()?;
        let nic = nics
            .get(self_rank)
            .ok_or_else(|| Error::InvalidParam(format!("no cluster entry for rank {self_rank}")).record())?;
        let options = TransportOptions {
            rank_id: self_rank,
            rank_count: nics.len(),
            nic: nic.to_string(),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        let peers = nics
            .into_iter()
            .enumerate()
            .filter(|(rank, _)| *rank != self_rank)
            .map(|(rank_id, nic)| PeerInfo {
                rank_id,
                nic,
                role: None,
            })
            .collect();
        Ok((options, peers))
    }

    pub fn self_rank(&self) -> usize {
        self.self_rank
    }

    pub fn rank_count(&self) -> usize {
        self.rank_count.load(Ordering::Relaxed)
    }

    /// The calling thread's last recorded error message, if any.
    pub fn last_error() -> Option<String> {
        crate::error::last_error()
    }

    /// Clear the calling thread's last-error message.
    pub fn clear_last_error() {
        crate::error::clear_last_error()
    }

    /// `RegisterMemoryRegion`: host-pins DRAM when `flags ==
    /// HostReg` (best-effort; a failed pin logs a warning and continues
    /// unpinned per the Open Question resolution in DESIGN.md), registers
    /// with the NIC driver for `{lkey, rkey}`, and emplaces into the local
    /// MR map.
    pub fn register_memory_region(
        &self,
        address: u64,
        size: usize,
        access: MrAccess,
        flags: MrFlags,
    ) -> Result<()> {
        let reg_address = address;
        if flags == MrFlags::HostReg {
            log::debug!(
                "bmft: host-pinning MR at {address:#x} (size {size}); driver backend treats \
                 pinning as a no-op, so reg_address == address"
            );
        }

        let (mr_handle, keys) = self.nic.mr_register(address, size, to_driver_access(access))?;
        self.local_mrs.insert(LocalMr {
            address,
            size,
            reg_address,
            lkey: keys.lkey,
            rkey: keys.rkey,
            access,
            flags,
            mr_handle,
        })?;

        if flags != MrFlags::SelfOnly {
            log::debug!("bmft: MR at {address:#x} is GVA-addressable (flags != Self)");
        }
        Ok(())
    }

    /// `UnregisterMemoryRegion`. Best-effort: a driver deregister
    /// failure is logged, not propagated.
    pub fn unregister_memory_region(&self, address: u64) -> Result<()> {
        let mr = self.local_mrs.remove(address)?;
        if let Err(e) = self.nic.mr_deregister(mr.mr_handle) {
            log::warn!("bmft: deregistering MR at {address:#x} failed (best-effort): {e}");
        }
        Ok(())
    }

    /// `QueryMemoryKey`: the wire key for the MR registered exactly
    /// at `address`, embedding this rank's current notify MR location.
    pub fn query_memory_key(&self, address: u64) -> Result<MemoryKey> {
        let mr = self
            .local_mrs
            .get(address)
            .ok_or_else(|| Error::InvalidParam(format!("no memory region registered at {address:#x}")).record())?;
        Ok(MemoryKey {
            address: mr.address,
            size: mr.size as u64,
            reg_address: mr.reg_address,
            lkey: mr.lkey,
            rkey: mr.rkey,
            ty: u32::from(MemoryKeyType::Device),
            notify_rkey: self.notify_rkey,
            notify_addr: self.notify_addr,
        })
    }

    /// `Prepare`: forwards the peer set to the QP-Connection
    /// Manager. A no-op when `rank_count() == 1`.
    pub fn prepare(&self, peers: Vec<PeerInfo>) -> Result<()> {
        if self.rank_count() == 1 {
            return Ok(());
        }
        self.qpconn.prepare(peers)
    }

    /// `UpdateRankOptions`: same as `prepare`, against a live FSM.
    pub fn update_rank_options(&self, peers: Vec<PeerInfo>) -> Result<()> {
        self.rank_count.fetch_add(peers.len(), Ordering::Relaxed);
        self.qpconn.update_rank_options(peers)
    }

    /// `Connect`: `async_connect(); wait_for_connected(-1);
    /// wait_qp_ready()`, then allgathers memory keys across the peer set
    /// if a rendezvous client is configured. A no-op when `rank_count() ==
    /// 1`.
    pub fn connect(&self) -> Result<()> {
        if self.rank_count() == 1 {
            return Ok(());
        }
        self.qpconn.async_connect()?;
        self.qpconn.wait_for_connected(None)?;
        self.wait_qp_ready()?;
        self.exchange_memory_keys()?;
        Ok(())
    }

    /// `WaitQpReady`: budget `BASE(30s) + PER_RANK(100ms) * rank_count`,
    /// polled every `5ms` (enforced inside [`QpConnManager::wait_qp_ready`]).
    pub fn wait_qp_ready(&self) -> Result<()> {
        self.qpconn.wait_qp_ready(self.rank_count())
    }

    /// `RemoveRanks`: destroys this rank's thread-local streams
    /// (any in-flight task on them becomes invalid), clears the removed
    /// peers' MR slices, and forwards to the FSM.
    pub fn remove_ranks(&self, ranks: &[usize]) -> Result<()> {
        self.stream_generation.fetch_add(1, Ordering::AcqRel);
        for &rank in ranks {
            self.qpconn.remote_mr_table(rank).clear();
        }
        self.qpconn.remove_ranks(ranks)
    }

    /// `ReadRemote`: resolves addresses via the MR tables, submits a
    /// signaled read SQE, and waits for it to retire.
    pub fn read_remote(&self, rank: usize, local_addr: u64, remote_addr: u64, size: usize) -> Result<()> {
        let task_id = self.submit_remote_op(rank, local_addr, remote_addr, size, RdmaOp::Read)?;
        self.with_thread_ctx(|stream, _| stream.synchronize(task_id))
    }

    /// `ReadRemoteAsync`: same as `read_remote` but returns without waiting.
    pub fn read_remote_async(&self, rank: usize, local_addr: u64, remote_addr: u64, size: usize) -> Result<()> {
        self.submit_remote_op(rank, local_addr, remote_addr, size, RdmaOp::Read)
            .map(|_| ())
    }

    /// `WriteRemote`: resolves addresses via the MR tables, submits a
    /// signaled write SQE, and waits for it to retire.
    pub fn write_remote(&self, rank: usize, local_addr: u64, remote_addr: u64, size: usize) -> Result<()> {
        let task_id = self.submit_remote_op(rank, local_addr, remote_addr, size, RdmaOp::Write)?;
        self.with_thread_ctx(|stream, _| stream.synchronize(task_id))
    }

    /// `WriteRemoteAsync`: same as `write_remote` but returns without
    /// waiting.
    pub fn write_remote_async(&self, rank: usize, local_addr: u64, remote_addr: u64, size: usize) -> Result<()> {
        self.submit_remote_op(rank, local_addr, remote_addr, size, RdmaOp::Write)
            .map(|_| ())
    }

    fn submit_remote_op(
        &self,
        rank: usize,
        local_addr: u64,
        remote_addr: u64,
        size: usize,
        op: RdmaOp,
    ) -> Result<u32> {
        let (reg_local, lkey) = self
            .local_mrs
            .lookup(local_addr)
            .ok_or_else(|| Error::InvalidParam(format!("local address {local_addr:#x} not in any registered MR")).record())?;

        let remote_table = self.qpconn.remote_mr_table(rank);
        let rkey = remote_table.lookup_rkey(remote_addr).ok_or_else(|| {
            Error::InvalidParam(format!("remote address {remote_addr:#x} not in any advertised MR for rank {rank}")).record()
        })?;

        let qp = self
            .qpconn
            .get_qp_handle_with_rank_id(rank)
            .ok_or_else(|| Error::NotInitialized(format!("rank {rank} is not OPERATIONAL")).record())?;

        let wr = SendWr {
            local_addr: reg_local,
            size,
            lkey,
            remote_addr,
            rkey,
            op,
            flags: WrFlags {
                signaled: true,
                fence: false,
            },
        };
        let sqe_type = match op {
            RdmaOp::Write => SqeType::RemoteWrite,
            RdmaOp::Read => SqeType::RemoteRead,
        };
        let stream_id = self.self_rank as u32;

        let result = self.with_thread_ctx(|stream, _| {
            doorbell::submit_remote_io(self.nic.as_ref(), stream, &self.addressing, qp, &wr, stream_id, sqe_type)
        });
        self.qpconn.put_qp_handle(rank);
        result
    }

    /// `Synchronize(rankId)`: a fenced, signaled `RDMA_WRITE` of the
    /// local notify word to the peer's notify MR, drained locally, then a
    /// `NotifyWait` SQE that resolves once that write retired. After this
    /// returns ok, every previously-signalled write to `rank` is observable
    /// there (the `FENCE` bit orders it behind them).
    pub fn synchronize(&self, rank: usize) -> Result<()> {
        let remote_table = self.qpconn.remote_mr_table(rank);
        let (notify_addr, notify_rkey) = remote_table.notify_target().ok_or_else(|| {
            Error::NotInitialized(format!("no notify MR known yet for rank {rank}")).record()
        })?;
        let qp = self
            .qpconn
            .get_qp_handle_with_rank_id(rank)
            .ok_or_else(|| Error::NotInitialized(format!("rank {rank} is not OPERATIONAL")).record())?;

        let wr = SendWr {
            local_addr: self.notify_addr,
            size: std::mem::size_of::<u32>(),
            lkey: self.notify_lkey,
            remote_addr: notify_addr,
            rkey: notify_rkey,
            op: RdmaOp::Write,
            flags: WrFlags {
                signaled: true,
                fence: true,
            },
        };
        let stream_id = self.self_rank as u32;

        let result = self.with_thread_ctx(|stream, notify| {
            let task_id =
                doorbell::submit_remote_io(self.nic.as_ref(), stream, &self.addressing, qp, &wr, stream_id, SqeType::NotifyWrite)?;
            stream.synchronize(task_id)?;
            notify.wait(stream, stream_id)
        });
        self.qpconn.put_qp_handle(rank);
        result
    }

    /// Allgather every rank's currently-registered MR keys and feed them
    /// into the QP-Connection Manager's remote MR tables. Skipped silently
    /// when no rendezvous client is configured.
    fn exchange_memory_keys(&self) -> Result<()> {
        let Some(rendezvous) = self.rendezvous.as_ref() else {
            log::debug!("bmft: no rendezvous client configured; skipping memory-key exchange");
            return Ok(());
        };

        let local_keys: Vec<MemoryKey> = self
            .local_mrs
            .all()
            .into_iter()
            .map(|mr| MemoryKey {
                address: mr.address,
                size: mr.size as u64,
                reg_address: mr.reg_address,
                lkey: mr.lkey,
                rkey: mr.rkey,
                ty: u32::from(MemoryKeyType::Device),
                notify_rkey: self.notify_rkey,
                notify_addr: self.notify_addr,
            })
            .collect();
        let payload = serde_json::to_vec(&local_keys)
            .map_err(|e| Error::Transport(format!("encoding memory keys failed: {e}")).record())?;

        let gathered = rendezvous.allgather(MR_EXCHANGE_GROUP, &payload)?;
        for (rank, bytes) in gathered.into_iter().enumerate() {
            if rank == self.self_rank {
                continue;
            }
            let keys: Vec<MemoryKey> = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Transport(format!("decoding memory keys from rank {rank} failed: {e}")).record())?;
            let table = self.qpconn.remote_mr_table(rank);
            for key in keys {
                table.insert(RemoteMr {
                    address: key.address,
                    size: key.size as usize,
                    reg_address: key.reg_address,
                    rkey: key.rkey,
                    notify_addr: key.notify_addr,
                    notify_rkey: key.notify_rkey,
                })?;
            }
        }
        Ok(())
    }

    /// Run `f` against the calling thread's lazily-constructed `(Stream,
    /// StreamNotify)` pair, rebuilding it if `remove_ranks` invalidated the
    /// previous one since it was created.
    fn with_thread_ctx<R>(&self, f: impl FnOnce(&Stream, &StreamNotify) -> Result<R>) -> Result<R> {
        THREAD_CTXS.with(|cell| {
            let mut map = cell.borrow_mut();
            let current_generation = self.stream_generation.load(Ordering::Acquire);
            let stale = map.get(&self.id).map(|c| c.generation != current_generation).unwrap_or(true);
            if stale {
                let stream = Stream::new(self.hal.clone())?;
                let notify = StreamNotify::new(&self.hal)?;
                map.insert(
                    self.id,
                    ThreadCtx {
                        generation: current_generation,
                        stream,
                        notify,
                    },
                );
            }
            let ctx = map.get(&self.id).expect("just inserted or already present");
            f(&ctx.stream, &ctx.notify)
        })
    }

    /// Block (bounded by `timeout`, `None` for unbounded) until every
    /// prepared peer is `OPERATIONAL`. A convenience wrapper around the same
    /// blocking-wait style `Barrier` uses below; most callers should prefer
    /// `connect()`, which already does this.
    pub fn wait_for_connected(&self, timeout: Option<Duration>) -> Result<()> {
        self.qpconn.wait_for_connected(timeout)
    }

    pub fn operational_ranks(&self) -> Vec<usize> {
        self.qpconn.operational_ranks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::soft::{SoftHalDriver, SoftNicDriver};
    use crate::mrtable::{MrAccess, MrFlags};
    use std::sync::atomic::AtomicU16;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(15100);

    fn next_port() -> u16 {
        NEXT_PORT.fetch_add(1, Ordering::Relaxed)
    }

    fn open(rank_id: usize, rank_count: usize, port: u16) -> Transport {
        let nic: Arc<dyn NicDriver> = Arc::new(SoftNicDriver::new());
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let options = TransportOptions {
            rank_id,
            rank_count,
            nic: format!("tcp://127.0.0.1:{port}"),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        Transport::open_device(options, nic, hal).unwrap()
    }

    #[test]
    fn single_rank_prepare_and_connect_are_no_ops() {
        let t = open(0, 1, next_port());
        t.prepare(vec![]).unwrap();
        t.connect().unwrap();
        assert_eq!(t.operational_ranks(), Vec::<usize>::new());
    }

    #[test]
    fn query_memory_key_round_trips_reg_address_and_size() {
        let t = open(0, 1, next_port());
        let buf = vec![0u8; 4096];
        let addr = buf.as_ptr() as u64;
        t.register_memory_region(
            addr,
            buf.len(),
            MrAccess {
                local_write: true,
                remote_write: true,
                remote_read: true,
                reduce: false,
            },
            MrFlags::Dram,
        )
        .unwrap();
        let key = t.query_memory_key(addr).unwrap();
        let (out_addr, out_size) = key.parse().unwrap();
        assert_eq!(out_addr, addr);
        assert_eq!(out_size, buf.len() as u64);
    }

    #[test]
    fn register_then_unregister_leaves_map_empty() {
        let t = open(0, 1, next_port());
        let buf = vec![0u8; 64];
        let addr = buf.as_ptr() as u64;
        t.register_memory_region(addr, buf.len(), MrAccess::default(), MrFlags::Dram)
            .unwrap();
        assert!(t.query_memory_key(addr).is_ok());
        t.unregister_memory_region(addr).unwrap();
        assert!(t.query_memory_key(addr).is_err());
    }

    #[test]
    fn two_rank_loopback_write_then_synchronize_observes_data() {
        let port_a = next_port();
        let port_b = next_port();

        let nic_a: Arc<dyn NicDriver> = Arc::new(SoftNicDriver::new());
        let nic_b: Arc<dyn NicDriver> = Arc::new(SoftNicDriver::new());
        let hal_a: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let hal_b: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());

        let rendezvous_root: NicAddr = format!("tcp://127.0.0.1:{}", next_port()).parse().unwrap();
        let rendez_a: Arc<dyn Rendezvous> =
            Arc::new(crate::rendezvous::TcpRendezvousClient::connect(&rendezvous_root, 0, 2).unwrap());

        let opts_a = TransportOptions {
            rank_id: 0,
            rank_count: 2,
            nic: format!("tcp://127.0.0.1:{port_a}"),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        let transport_a = TransportBuilder::new()
            .rendezvous(rendez_a)
            .open(opts_a, nic_a, hal_a)
            .unwrap();

        let rendezvous_root_b = rendezvous_root.clone();
        let handle = std::thread::spawn(move || {
            let rendez_b: Arc<dyn Rendezvous> = Arc::new(
                crate::rendezvous::TcpRendezvousClient::connect(&rendezvous_root_b, 1, 2).unwrap(),
            );
            let opts_b = TransportOptions {
                rank_id: 1,
                rank_count: 2,
                nic: format!("tcp://127.0.0.1:{port_b}"),
                role: Role::Peer,
                initial_type: InitialType::Host,
            };
            let transport_b = TransportBuilder::new()
                .rendezvous(rendez_b)
                .open(opts_b, nic_b, hal_b)
                .unwrap();

            let buf = vec![0u8; 1 << 16];
            let addr = buf.as_ptr() as u64;
            transport_b
                .register_memory_region(
                    addr,
                    buf.len(),
                    MrAccess {
                        local_write: true,
                        remote_write: true,
                        remote_read: true,
                        reduce: false,
                    },
                    MrFlags::Dram,
                )
                .unwrap();

            transport_b
                .prepare(vec![PeerInfo {
                    rank_id: 0,
                    nic: format!("tcp://127.0.0.1:{port_a}").parse().unwrap(),
                    role: None,
                }])
                .unwrap();
            transport_b.connect().unwrap();

            // Hand the buffer back so the test can assert on it after
            // rank 0's write lands.
            buf
        });

        let local = vec![7u8; 1 << 16];
        let local_addr = local.as_ptr() as u64;
        transport_a
            .register_memory_region(
                local_addr,
                local.len(),
                MrAccess {
                    local_write: true,
                    remote_write: false,
                    remote_read: false,
                    reduce: false,
                },
                MrFlags::Dram,
            )
            .unwrap();

        transport_a
            .prepare(vec![PeerInfo {
                rank_id: 1,
                nic: format!("tcp://127.0.0.1:{port_b}").parse().unwrap(),
                role: None,
            }])
            .unwrap();
        transport_a.connect().unwrap();

        let remote_buf = handle.join().unwrap();
        let remote_addr = remote_buf.as_ptr() as u64;

        transport_a
            .write_remote(1, local_addr, remote_addr, 1 << 16)
            .unwrap();
        transport_a.synchronize(1).unwrap();

        assert_eq!(&remote_buf[..], &local[..]);
    }
}
