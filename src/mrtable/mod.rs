//! Memory-Region Table: the local `{addr -> MR}` registry and the per-peer
//! `{addr -> RemoteMR}` maps.
//!
//! Lookups use `BTreeMap::range` to find the entry at or below the queried
//! address (a `lower_bound` search), then check containment. A read-write
//! lock lets lookups proceed concurrently with registration.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Where a registered region's bytes actually live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrFlags {
    Dram,
    HostReg,
    SelfOnly,
}

/// Access rights granted to a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MrAccess {
    pub local_write: bool,
    pub remote_write: bool,
    pub remote_read: bool,
    pub reduce: bool,
}

/// A locally registered memory region.
#[derive(Debug, Clone, Copy)]
pub struct LocalMr {
    pub address: u64,
    pub size: usize,
    /// `address` after optional host-pinning; equals `address` when the
    /// region was never host-pinned or pinning failed and was skipped.
    pub reg_address: u64,
    pub lkey: u32,
    pub rkey: u32,
    pub access: MrAccess,
    pub flags: MrFlags,
    /// Driver-level handle, needed to deregister on `unregister_memory_region`.
    pub mr_handle: u64,
}

/// Up to `MR_MAX_NUM - 1` remote MR slots are exchanged per peer; slot 0 of
/// the QP's MR array is reserved, so [`RemoteMrTable::insert`] rejects the
/// `MR_MAX_NUM`-th distinct address with `INVALID_PARAM`.
pub const MR_MAX_NUM: usize = 32;

/// A peer-advertised memory region, as reconstructed from its wire key.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMr {
    pub address: u64,
    pub size: usize,
    pub reg_address: u64,
    pub rkey: u32,
    pub notify_addr: u64,
    pub notify_rkey: u32,
}

fn lookup_containing<T>(map: &BTreeMap<u64, T>, addr: u64, size_of: impl Fn(&T) -> usize) -> Option<(u64, T)>
where
    T: Clone,
{
    let (&entry_addr, entry) = map
        .range((Bound::Unbounded, Bound::Included(addr)))
        .next_back()?;
    if addr < entry_addr + size_of(entry) as u64 {
        Some((entry_addr, entry.clone()))
    } else {
        None
    }
}

fn overlaps(map: &BTreeMap<u64, LocalMr>, addr: u64, size: usize) -> bool {
    let end = addr + size as u64;
    map.range((Bound::Unbounded, Bound::Excluded(end)))
        .next_back()
        .map(|(_, mr)| addr < mr.address + mr.size as u64)
        .unwrap_or(false)
}

/// Per-process registry of this rank's own memory regions.
#[derive(Default)]
pub struct LocalMrTable {
    entries: RwLock<BTreeMap<u64, LocalMr>>,
}

impl LocalMrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mr`. Fails with `INVALID_PARAM` if it overlaps any live MR
    /// already registered by this rank.
    pub fn insert(&self, mr: LocalMr) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if overlaps(&entries, mr.address, mr.size) {
            return Err(Error::InvalidParam(format!(
                "memory region at {:#x} (size {}) overlaps an existing registration",
                mr.address, mr.size
            ))
            .record());
        }
        entries.insert(mr.address, mr);
        Ok(())
    }

    /// Remove the MR registered at exactly `addr`.
    pub fn remove(&self, addr: u64) -> Result<LocalMr> {
        self.entries
            .write()
            .unwrap()
            .remove(&addr)
            .ok_or_else(|| Error::InvalidParam(format!("no memory region registered at {addr:#x}")).record())
    }

    /// Resolve `addr` to `(reg_address + offset, lkey)` via the MR that
    /// contains it, if any.
    pub fn lookup(&self, addr: u64) -> Option<(u64, u32)> {
        let entries = self.entries.read().unwrap();
        let (entry_addr, mr) = lookup_containing(&entries, addr, |mr| mr.size)?;
        let offset = addr - entry_addr;
        Some((mr.reg_address + offset, mr.lkey))
    }

    /// The full MR, if `addr` falls within one.
    pub fn get_containing(&self, addr: u64) -> Option<LocalMr> {
        let entries = self.entries.read().unwrap();
        lookup_containing(&entries, addr, |mr| mr.size).map(|(_, mr)| mr)
    }

    /// The MR registered at exactly `addr`, for `QueryMemoryKey`.
    pub fn get(&self, addr: u64) -> Option<LocalMr> {
        self.entries.read().unwrap().get(&addr).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Every currently registered region, for rendezvous-driven key export.
    pub fn all(&self) -> Vec<LocalMr> {
        self.entries.read().unwrap().values().copied().collect()
    }
}

/// Per-peer registry of that peer's advertised memory regions.
#[derive(Default)]
pub struct RemoteMrTable {
    entries: RwLock<BTreeMap<u64, RemoteMr>>,
    /// `{addr, rkey}` of the peer's notify word, carried redundantly on
    /// every advertised [`RemoteMr`] (every wire key embeds the exporting
    /// peer's current notify MR). `synchronize` targets this, not any one
    /// data MR.
    notify: RwLock<Option<(u64, u32)>>,
}

impl RemoteMrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer-advertised MR. Rejects a new address once `MR_MAX_NUM -
    /// 1` distinct remote MRs are already held for this peer (slot 0 of the
    /// QP's MR array is reserved for the notify word and is never handed out
    /// to a data registration).
    pub fn insert(&self, mr: RemoteMr) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if !entries.contains_key(&mr.address) && entries.len() >= MR_MAX_NUM - 1 {
            return Err(Error::InvalidParam(format!(
                "remote MR table full: already holding {} entries (cap {})",
                entries.len(),
                MR_MAX_NUM - 1
            ))
            .record());
        }
        *self.notify.write().unwrap() = Some((mr.notify_addr, mr.notify_rkey));
        entries.insert(mr.address, mr);
        Ok(())
    }

    /// The peer's notify word location, learned from the most recent MR
    /// advertisement. `None` until at least one remote MR has been
    /// registered for this peer.
    pub fn notify_target(&self) -> Option<(u64, u32)> {
        *self.notify.read().unwrap()
    }

    pub fn remove(&self, addr: u64) {
        self.entries.write().unwrap().remove(&addr);
    }

    /// Resolve `addr` to its `rkey` via the remote MR that contains it.
    pub fn lookup_rkey(&self, addr: u64) -> Option<u32> {
        let entries = self.entries.read().unwrap();
        lookup_containing(&entries, addr, |mr| mr.size).map(|(_, mr)| mr.rkey)
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mr(addr: u64, size: usize) -> LocalMr {
        LocalMr {
            address: addr,
            size,
            reg_address: addr,
            lkey: 1,
            rkey: 2,
            access: MrAccess::default(),
            flags: MrFlags::Dram,
            mr_handle: 0,
        }
    }

    #[test]
    fn lookup_resolves_any_address_inside_the_region() {
        let table = LocalMrTable::new();
        table.insert(mr(0x1000, 0x100)).unwrap();
        let (reg_addr, lkey) = table.lookup(0x1050).unwrap();
        assert_eq!(reg_addr, 0x1050);
        assert_eq!(lkey, 1);
    }

    #[test]
    fn lookup_misses_outside_the_region() {
        let table = LocalMrTable::new();
        table.insert(mr(0x1000, 0x100)).unwrap();
        assert!(table.lookup(0x1100).is_none());
        assert!(table.lookup(0x0fff).is_none());
    }

    #[test]
    fn rejects_overlapping_registration() {
        let table = LocalMrTable::new();
        table.insert(mr(0x1000, 0x100)).unwrap();
        assert!(table.insert(mr(0x1050, 0x10)).is_err());
    }

    #[test]
    fn adjacent_non_overlapping_regions_are_both_visible() {
        let table = LocalMrTable::new();
        table.insert(mr(0x1000, 0x100)).unwrap();
        table.insert(mr(0x1100, 0x100)).unwrap();
        // The junction address resolves to the later MR.
        let (reg_addr, _) = table.lookup(0x1100).unwrap();
        assert_eq!(reg_addr, 0x1100);
    }

    #[test]
    fn unregister_then_lookup_misses() {
        let table = LocalMrTable::new();
        table.insert(mr(0x1000, 0x100)).unwrap();
        table.remove(0x1000).unwrap();
        assert!(table.lookup(0x1050).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn remote_table_resolves_rkey_by_containment() {
        let table = RemoteMrTable::new();
        table
            .insert(RemoteMr {
                address: 0x2000,
                size: 0x100,
                reg_address: 0x2000,
                rkey: 7,
                notify_addr: 0x9000,
                notify_rkey: 8,
            })
            .unwrap();
        assert_eq!(table.lookup_rkey(0x2050), Some(7));
        assert_eq!(table.lookup_rkey(0x3000), None);
    }

    fn remote_mr(addr: u64) -> RemoteMr {
        RemoteMr {
            address: addr,
            size: 0x10,
            reg_address: addr,
            rkey: 1,
            notify_addr: 0x9000,
            notify_rkey: 8,
        }
    }

    #[test]
    fn remote_table_rejects_the_mr_max_num_th_distinct_address() {
        let table = RemoteMrTable::new();
        for slot in 0..MR_MAX_NUM - 1 {
            table.insert(remote_mr(0x4000 + slot as u64 * 0x10)).unwrap();
        }
        let overflow = table.insert(remote_mr(0x4000 + (MR_MAX_NUM as u64 - 1) * 0x10));
        assert!(matches!(overflow, Err(Error::InvalidParam(_))));
    }

    #[test]
    fn remote_table_reinserting_a_known_address_does_not_count_against_the_cap() {
        let table = RemoteMrTable::new();
        for slot in 0..MR_MAX_NUM - 1 {
            table.insert(remote_mr(0x5000 + slot as u64 * 0x10)).unwrap();
        }
        // Re-advertising an already-held address (e.g. a MR refreshed after
        // re-registration) must not be treated as new growth.
        table.insert(remote_mr(0x5000)).unwrap();
    }
}
