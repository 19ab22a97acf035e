//! Single-process software reference implementation of [`NicDriver`] and
//! [`HalDriver`].
//!
//! It exists so the rest of the crate, and its tests, can drive a full
//! two-rank loopback without real RDMA hardware: sockets are plain loopback
//! TCP, "queue pairs" are bookkeeping only, and a Write/Read work request is
//! carried out immediately as a `memcpy` between the two registered
//! addresses — both of which are real, valid pointers because the loopback
//! scenario runs both ranks in the same process. This mirrors the
//! `hw`/`sim`/`mock` backend split `myrfy001-blue-rdma-driver` uses to keep
//! its driver trait testable without a NIC attached.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::driver::{
    CqError, CqReport, DoorbellInfo, HalDriver, MrAccess, MrHandle, MrKeys, NicDriver, QpHandle,
    QpMode, QpStatus, RdmaOp, SendWr, SocketHandle,
};
use crate::error::{Error, Result};

struct QpState {
    socket_fd: i32,
    status: QpStatus,
}

struct RingState {
    depth: usize,
    next_task_id: u32,
    submitted: Vec<u32>,
}

/// A loopback-capable software NIC driver. One instance per simulated rank.
pub struct SoftNicDriver {
    sockets: Mutex<HashMap<SocketHandle, TcpStream>>,
    listeners: Mutex<HashMap<u16, TcpListener>>,
    whitelist: Mutex<std::collections::HashSet<Ipv4Addr>>,
    qps: RwLock<HashMap<QpHandle, QpState>>,
    next_handle: AtomicU64,
    next_key: AtomicU32,
    doorbell_seq: AtomicU64,
}

impl Default for SoftNicDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftNicDriver {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            whitelist: Mutex::new(std::collections::HashSet::new()),
            qps: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_key: AtomicU32::new(1),
            doorbell_seq: AtomicU64::new(1),
        }
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl NicDriver for SoftNicDriver {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn socket_init(&self) -> Result<()> {
        Ok(())
    }

    fn socket_deinit(&self) -> Result<()> {
        self.sockets.lock().unwrap().clear();
        self.listeners.lock().unwrap().clear();
        Ok(())
    }

    fn socket_listen_start(&self, local_port: u16) -> Result<()> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port);
        let listener = TcpListener::bind(addr)
            .map_err(|e| Error::DlFail(format!("socket_listen_start: {e}")).record())?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::DlFail(format!("socket_listen_start: {e}")).record())?;
        self.listeners.lock().unwrap().insert(local_port, listener);
        Ok(())
    }

    fn socket_listen_stop(&self, local_port: u16) -> Result<()> {
        self.listeners.lock().unwrap().remove(&local_port);
        Ok(())
    }

    fn socket_batch_connect(&self, peers: &[SocketAddrV4]) -> Result<Vec<SocketHandle>> {
        if peers.len() > 16 {
            return Err(Error::InvalidParam("socket_batch_connect: at most 16 peers".into()).record());
        }
        let mut handles = Vec::with_capacity(peers.len());
        let mut sockets = self.sockets.lock().unwrap();
        for peer in peers {
            let stream = TcpStream::connect(peer)
                .map_err(|e| Error::DlFail(format!("socket_batch_connect: {e}")).record())?;
            let handle = self.alloc_handle();
            sockets.insert(handle, stream);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn socket_batch_close(&self, handles: &[SocketHandle]) -> Result<()> {
        if handles.len() > 16 {
            return Err(Error::InvalidParam("socket_batch_close: at most 16 handles".into()).record());
        }
        let mut sockets = self.sockets.lock().unwrap();
        for h in handles {
            sockets.remove(h);
        }
        Ok(())
    }

    fn get_sockets(&self, handles: &[SocketHandle]) -> Result<Vec<i32>> {
        let sockets = self.sockets.lock().unwrap();
        handles
            .iter()
            .map(|h| {
                sockets
                    .get(h)
                    .map(|s| s.as_raw_fd())
                    .ok_or_else(|| Error::InvalidParam(format!("unknown socket handle {h}")).record())
            })
            .collect()
    }

    fn socket_whitelist_add(&self, peer: SocketAddrV4) -> Result<()> {
        self.whitelist.lock().unwrap().insert(*peer.ip());
        Ok(())
    }

    fn socket_whitelist_del(&self, peer: SocketAddrV4) -> Result<()> {
        self.whitelist.lock().unwrap().remove(peer.ip());
        Ok(())
    }

    fn get_ifaddrs(&self) -> Result<Vec<Ipv4Addr>> {
        Ok(vec![Ipv4Addr::LOCALHOST])
    }

    fn qp_create(&self, _mode: QpMode) -> Result<QpHandle> {
        let handle = self.alloc_handle();
        self.qps.write().unwrap().insert(
            handle,
            QpState {
                socket_fd: -1,
                status: QpStatus::Connecting,
            },
        );
        Ok(handle)
    }

    fn qp_destroy(&self, qp: QpHandle) -> Result<()> {
        self.qps.write().unwrap().remove(&qp);
        Ok(())
    }

    fn qp_connect_async(&self, qp: QpHandle, socket_fd: i32) -> Result<()> {
        let mut qps = self.qps.write().unwrap();
        let state = qps
            .get_mut(&qp)
            .ok_or_else(|| Error::InvalidParam(format!("unknown QP handle {qp}")).record())?;
        state.socket_fd = socket_fd;
        // The loopback driver has no real handshake latency to model.
        state.status = QpStatus::Ready;
        Ok(())
    }

    fn qp_status(&self, qp: QpHandle) -> Result<QpStatus> {
        self.qps
            .read()
            .unwrap()
            .get(&qp)
            .map(|s| s.status)
            .ok_or_else(|| Error::InvalidParam(format!("unknown QP handle {qp}")).record())
    }

    fn mr_register(&self, _addr: u64, _size: usize, _access: MrAccess) -> Result<(MrHandle, MrKeys)> {
        let handle = self.alloc_handle();
        let lkey = self.next_key.fetch_add(1, Ordering::Relaxed);
        let rkey = self.next_key.fetch_add(1, Ordering::Relaxed);
        Ok((handle, MrKeys { lkey, rkey }))
    }

    fn mr_deregister(&self, _mr: MrHandle) -> Result<()> {
        Ok(())
    }

    fn notify_base_addr(&self) -> Result<u64> {
        let word: Box<AtomicU32> = Box::new(AtomicU32::new(0));
        Ok(Box::into_raw(word) as u64)
    }

    fn notify_mr_info(&self) -> Result<MrKeys> {
        Ok(MrKeys {
            lkey: self.next_key.fetch_add(1, Ordering::Relaxed),
            rkey: self.next_key.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn send_wr(&self, _qp: QpHandle, wr: &SendWr) -> Result<DoorbellInfo> {
        // Software loopback: both addresses are real pointers in this
        // process, so the "RDMA" write/read is a direct memcpy.
        unsafe {
            match wr.op {
                RdmaOp::Write => std::ptr::copy_nonoverlapping(
                    wr.local_addr as *const u8,
                    wr.remote_addr as *mut u8,
                    wr.size,
                ),
                RdmaOp::Read => std::ptr::copy_nonoverlapping(
                    wr.remote_addr as *const u8,
                    wr.local_addr as *mut u8,
                    wr.size,
                ),
            }
        }
        let db_info = self.doorbell_seq.fetch_add(1, Ordering::Relaxed);
        Ok(DoorbellInfo { db_info })
    }

    fn chip_info(&self) -> Result<crate::driver::ChipInfo> {
        // A single simulated chip/die: nonzero constants so the fail-closed
        // zero-address check in `stream::doorbell` never trips in tests.
        Ok(crate::driver::ChipInfo {
            rocee_base: 0x1000_0000,
            rocee_vf_db_cfg0: 0x100,
            chip_offset: 0x10,
            die_offset: 0x1,
            chip_id: 0,
            die_id: 0,
            chip_addr: 0x8,
        })
    }
}

/// A software HAL driver: ring bookkeeping only, since [`SoftNicDriver`]
/// already performs each work request's data movement synchronously inside
/// `send_wr`. Completions are therefore always immediately available.
pub struct SoftHalDriver {
    rings: Mutex<HashMap<u32, RingState>>,
    next_ring: AtomicU32,
    notify_words: Mutex<HashMap<u64, Box<AtomicU32>>>,
    next_notify_id: AtomicU32,
}

impl Default for SoftHalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftHalDriver {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            next_ring: AtomicU32::new(1),
            notify_words: Mutex::new(HashMap::new()),
            next_notify_id: AtomicU32::new(1),
        }
    }
}

impl HalDriver for SoftHalDriver {
    fn resource_id_alloc(&self) -> Result<u32> {
        Ok(self.next_ring.fetch_add(1, Ordering::Relaxed))
    }

    fn resource_id_free(&self, _id: u32) -> Result<()> {
        Ok(())
    }

    fn sqcq_allocate(&self, depth: usize) -> Result<u32> {
        let id = self.next_ring.fetch_add(1, Ordering::Relaxed);
        self.rings.lock().unwrap().insert(
            id,
            RingState {
                depth,
                next_task_id: 0,
                submitted: Vec::new(),
            },
        );
        Ok(id)
    }

    fn sqcq_free(&self, ring: u32) -> Result<()> {
        self.rings.lock().unwrap().remove(&ring);
        Ok(())
    }

    fn bind_logic_cq(&self, _ring: u32, _cq: u32) -> Result<()> {
        Ok(())
    }

    fn unbind_logic_cq(&self, _ring: u32, _cq: u32) -> Result<()> {
        Ok(())
    }

    fn sq_task_send(&self, ring: u32, _addr: u64, _value: u64) -> Result<()> {
        let mut rings = self.rings.lock().unwrap();
        let state = rings
            .get_mut(&ring)
            .ok_or_else(|| Error::InvalidParam(format!("unknown ring {ring}")).record())?;
        let task_id = state.next_task_id;
        state.next_task_id = state.next_task_id.wrapping_add(1);
        if state.submitted.len() >= state.depth {
            return Err(Error::DlFail(format!("ring {ring} overflow")).record());
        }
        state.submitted.push(task_id);
        Ok(())
    }

    fn cq_report_recv(&self, ring: u32) -> Result<Option<CqReport>> {
        let mut rings = self.rings.lock().unwrap();
        let state = rings
            .get_mut(&ring)
            .ok_or_else(|| Error::InvalidParam(format!("unknown ring {ring}")).record())?;
        if state.submitted.is_empty() {
            return Ok(None);
        }
        let last = *state.submitted.last().unwrap();
        state.submitted.clear();
        Ok(Some(CqReport {
            last_completed_task_id: last,
            error: None::<CqError>,
        }))
    }

    fn sqcq_query_head(&self, ring: u32) -> Result<u32> {
        let rings = self.rings.lock().unwrap();
        let state = rings
            .get(&ring)
            .ok_or_else(|| Error::InvalidParam(format!("unknown ring {ring}")).record())?;
        // Every work request already completed synchronously inside
        // `NicDriver::send_wr`, so the hardware head is always caught up to
        // the last task id this ring has assigned.
        Ok(state.next_task_id)
    }

    fn mem_create_notify(&self) -> Result<u64> {
        let word = Box::new(AtomicU32::new(0));
        let addr = word.as_ref() as *const AtomicU32 as u64;
        self.notify_words.lock().unwrap().insert(addr, word);
        Ok(addr)
    }

    fn mem_release_notify(&self, addr: u64) -> Result<()> {
        self.notify_words.lock().unwrap().remove(&addr);
        Ok(())
    }

    fn notify_id_alloc(&self) -> Result<(u32, u64)> {
        let id = self.next_notify_id.fetch_add(1, Ordering::Relaxed);
        Ok((id, (id as u64) * 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_copies_bytes_between_registered_regions() {
        let nic = SoftNicDriver::new();
        let qp = nic.qp_create(QpMode::Standard).unwrap();
        nic.qp_connect_async(qp, -1).unwrap();
        assert_eq!(nic.qp_status(qp).unwrap(), QpStatus::Ready);

        let src = vec![7u8; 64];
        let mut dst = vec![0u8; 64];
        let wr = SendWr {
            local_addr: src.as_ptr() as u64,
            size: 64,
            lkey: 1,
            remote_addr: dst.as_mut_ptr() as u64,
            rkey: 2,
            op: RdmaOp::Write,
            flags: crate::driver::WrFlags {
                signaled: true,
                fence: false,
            },
        };
        nic.send_wr(qp, &wr).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn batch_connect_rejects_more_than_sixteen_peers() {
        let nic = SoftNicDriver::new();
        let peers: Vec<_> = (0..17)
            .map(|i| SocketAddrV4::new(Ipv4Addr::LOCALHOST, 20000 + i))
            .collect();
        assert!(nic.socket_batch_connect(&peers).is_err());
    }

    #[test]
    fn hal_reports_last_submitted_task_as_completed() {
        let hal = SoftHalDriver::new();
        let ring = hal.sqcq_allocate(2048).unwrap();
        hal.sq_task_send(ring, 0, 5).unwrap();
        hal.sq_task_send(ring, 0, 6).unwrap();
        let report = hal.cq_report_recv(ring).unwrap().unwrap();
        assert_eq!(report.last_completed_task_id, 6);
        assert!(hal.cq_report_recv(ring).unwrap().is_none());
    }
}
