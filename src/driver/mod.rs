//! Opaque NIC and submission-queue driver surfaces.
//!
//! The NIC driver and the HAL submission-queue driver are external, abstract
//! callable surfaces (`RaXxx`/`HalXxx`) with no concrete implementation
//! given. We model that boundary as two traits —
//! [`NicDriver`] and [`HalDriver`] — and ship [`soft`], a single-process
//! software reference implementation so the rest of the crate (and its
//! tests) can run without real hardware, following the same
//! hardware-abstraction split `myrfy001-blue-rdma-driver` draws between its
//! `hw`, `sim`, and `mock` feature-gated backends.

pub mod soft;

use crate::error::Result;

/// Handle to a driver-managed socket connection. Opaque to callers.
pub type SocketHandle = u64;

/// Handle to a driver-managed queue pair. Opaque to callers.
pub type QpHandle = u64;

/// Handle to a driver-registered memory region. Opaque to callers.
pub type MrHandle = u64;

/// `RaQpCreate`'s queue-pair creation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpMode {
    /// `qpMode=2`, used by Bipartite and Joinable.
    Standard,
    /// AI-core extended-attribute mode, used by Fixed.
    AiCore,
}

/// `RaGetQpStatus` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Connecting,
    Ready,
}

/// Access flags of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrAccess {
    pub local_write: bool,
    pub remote_write: bool,
    pub remote_read: bool,
    pub reduce: bool,
}

/// `{lkey, rkey}` returned by a successful MR registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// Remote-I/O opcode, carried in the doorbell SQE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaOp {
    Write = 0,
    Read = 4,
}

/// Flags carried on a `send_wr_v2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WrFlags {
    pub signaled: bool,
    pub fence: bool,
}

/// A single scatter-gather remote I/O work request, as composed by the
/// doorbell construction step.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub local_addr: u64,
    pub size: usize,
    pub lkey: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub op: RdmaOp,
    pub flags: WrFlags,
}

/// The doorbell word a driver produces for a submitted `send_wr_v2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellInfo {
    pub db_info: u64,
}

/// The opaque NIC driver surface: per-process bring-up, socket
/// lifecycle, QP lifecycle, and MR registration.
///
/// Every method mirrors one `RaXxx` call; the mapping is noted per method
/// so a reader can trace behavior back to the external contract without
/// this crate depending on any real driver library.
pub trait NicDriver: Send + Sync {
    /// `RaInit` / `RaRdevInit` / `RaRdevGetHandle`: per-process, idempotent.
    fn init(&self) -> Result<()>;

    /// `RaSocketInit`.
    fn socket_init(&self) -> Result<()>;
    /// `RaSocketDeinit`.
    fn socket_deinit(&self) -> Result<()>;
    /// `RaSocketListenStart`.
    fn socket_listen_start(&self, local_port: u16) -> Result<()>;
    /// `RaSocketListenStop`.
    fn socket_listen_stop(&self, local_port: u16) -> Result<()>;
    /// `RaSocketBatchConnect`, at most 16 peers per call.
    fn socket_batch_connect(&self, peers: &[std::net::SocketAddrV4]) -> Result<Vec<SocketHandle>>;
    /// `RaSocketBatchClose`, at most 16 handles per call.
    fn socket_batch_close(&self, handles: &[SocketHandle]) -> Result<()>;
    /// `RaGetSockets`: resolve handles to their underlying fds.
    fn get_sockets(&self, handles: &[SocketHandle]) -> Result<Vec<i32>>;
    /// `RaSocketWhiteListAdd`.
    fn socket_whitelist_add(&self, peer: std::net::SocketAddrV4) -> Result<()>;
    /// `RaSocketWhiteListDel`.
    fn socket_whitelist_del(&self, peer: std::net::SocketAddrV4) -> Result<()>;
    /// `RaGetIfNum` + `RaGetIfaddrs`: local IPv4 addresses available for
    /// binding.
    fn get_ifaddrs(&self) -> Result<Vec<std::net::Ipv4Addr>>;

    /// `RaQpCreate` / `RaQpAiCreate` depending on `mode`.
    fn qp_create(&self, mode: QpMode) -> Result<QpHandle>;
    /// `RaQpDestroy`.
    fn qp_destroy(&self, qp: QpHandle) -> Result<()>;
    /// `RaQpConnectAsync`.
    fn qp_connect_async(&self, qp: QpHandle, socket_fd: i32) -> Result<()>;
    /// `RaGetQpStatus`.
    fn qp_status(&self, qp: QpHandle) -> Result<QpStatus>;

    /// `RaRegisterMR` / `RaMrReg`.
    fn mr_register(&self, addr: u64, size: usize, access: MrAccess) -> Result<(MrHandle, MrKeys)>;
    /// `RaDeregisterMR` / `RaMrDereg`.
    fn mr_deregister(&self, mr: MrHandle) -> Result<()>;

    /// `RaGetNotifyBaseAddr`.
    fn notify_base_addr(&self) -> Result<u64>;
    /// `RaGetNotifyMrInfo`.
    fn notify_mr_info(&self) -> Result<MrKeys>;

    /// `RaSendWr` / `RaSendWrV2`: compose a work request on `qp` and return
    /// the doorbell word the host must ring.
    fn send_wr(&self, qp: QpHandle, wr: &SendWr) -> Result<DoorbellInfo>;

    /// Chip/die identification, queried once at `open_device` time and
    /// cached by the caller to build a [`crate::stream::doorbell::DoorbellAddressing`].
    /// Not one of the named `RaXxx` calls — the exact chip-info query is
    /// left opaque (addressing parameters are resolved once at
    /// `open_device` via chip-info queries, then cached), so this gives
    /// that resolution step a concrete signature.
    fn chip_info(&self) -> Result<ChipInfo>;
}

/// Chip/die identification used to compute a doorbell MMIO address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub rocee_base: u64,
    pub rocee_vf_db_cfg0: u64,
    pub chip_offset: u64,
    pub die_offset: u64,
    pub chip_id: u64,
    pub die_id: u64,
    pub chip_addr: u64,
}

/// The opaque HAL submission-queue driver surface: ring allocation,
/// doorbell submission, and completion polling.
pub trait HalDriver: Send + Sync {
    /// `HalResourceIdAlloc`.
    fn resource_id_alloc(&self) -> Result<u32>;
    /// `HalResourceIdFree`.
    fn resource_id_free(&self, id: u32) -> Result<()>;

    /// `HalSqCqAllocate`: allocate a submission/completion ring pair of the
    /// given depth, returning an opaque ring id.
    fn sqcq_allocate(&self, depth: usize) -> Result<u32>;
    /// `HalSqCqFree`.
    fn sqcq_free(&self, ring: u32) -> Result<()>;
    /// `HalResourceConfig` bind/unbind of a logical CQ to a ring.
    fn bind_logic_cq(&self, ring: u32, cq: u32) -> Result<()>;
    fn unbind_logic_cq(&self, ring: u32, cq: u32) -> Result<()>;

    /// `HalSqTaskSend`: ring the doorbell for a single 64-byte SQE at
    /// `addr` with value `value`.
    fn sq_task_send(&self, ring: u32, addr: u64, value: u64) -> Result<()>;
    /// `HalCqReportRecv`: drain available completions, returning the last
    /// completed task id (inclusive) if any completed.
    fn cq_report_recv(&self, ring: u32) -> Result<Option<CqReport>>;
    /// `HalSqCqQuery`: the hardware-reported head of the ring (used to
    /// fast-forward past entries whose completion was never reported, e.g.
    /// after a synchronize on an already-drained queue).
    fn sqcq_query_head(&self, ring: u32) -> Result<u32>;

    /// `HalMemCreate` / `Reserve`: allocate pinned host memory for a notify
    /// word, returning its device-visible address.
    fn mem_create_notify(&self) -> Result<u64>;
    /// `HalMemRelease` / `Free`.
    fn mem_release_notify(&self, addr: u64) -> Result<()>;
    /// Notify id allocation + device-address offset query.
    fn notify_id_alloc(&self) -> Result<(u32, u64)>;
}

/// One reported completion: the last-completed task id and, if the
/// hardware surfaced one, an error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqReport {
    pub last_completed_task_id: u32,
    pub error: Option<CqError>,
}

/// CQE error categories a reported completion may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqError {
    Sdma,
    Fetch,
    Reduce,
    DataNaN,
}
