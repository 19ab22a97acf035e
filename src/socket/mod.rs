//! Socket Fabric: listener lifecycle, batched connect, whitelist
//! maintenance, and socket-fd discovery, layered over a [`NicDriver`].
//!
//! The device IPC layer this sits on can only batch 16 peers per call
//! (`RaSocketBatchConnect`/`RaSocketBatchClose`); this module hides that
//! limit from callers by chunking.

use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::driver::{NicDriver, SocketHandle};
use crate::error::Result;

/// Device IPC batching width for `RaSocketBatchConnect`/`BatchClose`.
pub const BATCH_WIDTH: usize = 16;

/// A thin, chunking wrapper over [`NicDriver`]'s socket surface.
pub struct SocketFabric {
    driver: Arc<dyn NicDriver>,
}

impl SocketFabric {
    pub fn new(driver: Arc<dyn NicDriver>) -> Self {
        Self { driver }
    }

    /// Start listening on `local_port` and whitelist it for inbound peers.
    pub fn listen(&self, local_port: u16) -> Result<()> {
        self.driver.socket_listen_start(local_port)
    }

    pub fn stop_listen(&self, local_port: u16) -> Result<()> {
        self.driver.socket_listen_stop(local_port)
    }

    /// Add `peer` to the inbound whitelist, permitting its connect attempts.
    pub fn whitelist_add(&self, peer: SocketAddrV4) -> Result<()> {
        self.driver.socket_whitelist_add(peer)
    }

    pub fn whitelist_del(&self, peer: SocketAddrV4) -> Result<()> {
        self.driver.socket_whitelist_del(peer)
    }

    /// Connect to every address in `peers`, batching in groups of
    /// [`BATCH_WIDTH`]. Partial progress (earlier batches already
    /// connected) is preserved in the returned handles even if a later
    /// batch fails; the caller sees the error and the handles connected so
    /// far.
    pub fn batch_connect(&self, peers: &[SocketAddrV4]) -> Result<Vec<SocketHandle>> {
        let mut handles = Vec::with_capacity(peers.len());
        for chunk in peers.chunks(BATCH_WIDTH) {
            let mut batch = self.driver.socket_batch_connect(chunk)?;
            handles.append(&mut batch);
        }
        Ok(handles)
    }

    /// Close every handle in `handles`, batching in groups of
    /// [`BATCH_WIDTH`].
    pub fn batch_close(&self, handles: &[SocketHandle]) -> Result<()> {
        for chunk in handles.chunks(BATCH_WIDTH) {
            self.driver.socket_batch_close(chunk)?;
        }
        Ok(())
    }

    /// Resolve driver socket handles to raw fds.
    pub fn fds(&self, handles: &[SocketHandle]) -> Result<Vec<i32>> {
        self.driver.get_sockets(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::soft::SoftNicDriver;
    use std::net::Ipv4Addr;

    #[test]
    fn batch_connect_chunks_into_groups_of_sixteen() {
        let driver: Arc<dyn NicDriver> = Arc::new(SoftNicDriver::new());
        let fabric = SocketFabric::new(driver.clone());

        // 18 loopback listeners so batch_connect has something to dial.
        let mut ports = vec![];
        for p in 21000..21018u16 {
            fabric.listen(p).unwrap();
            ports.push(p);
        }
        let peers: Vec<_> = ports
            .iter()
            .map(|p| SocketAddrV4::new(Ipv4Addr::LOCALHOST, *p))
            .collect();
        let handles = fabric.batch_connect(&peers).unwrap();
        assert_eq!(handles.len(), 18);
    }
}
