//! Two-rank loopback write/synchronize over the software reference driver,
//! exercised as a single process using two [`Transport`]s bound to two
//! loopback ports. Rank 0 writes 64 KiB into rank 1's registered buffer,
//! then a `synchronize` makes the write's completion visible before the
//! assertion reads rank 1's memory.
use std::sync::Arc;

use bmft::driver::soft::{SoftHalDriver, SoftNicDriver};
use bmft::driver::{HalDriver, NicDriver};
use bmft::prelude::*;
use bmft::rendezvous::{Rendezvous, TcpRendezvousClient};

fn open(rank_id: usize, rank_count: usize, port: u16, rendezvous_root: &NicAddr) -> anyhow::Result<Transport> {
    let nic: Arc<dyn NicDriver> = Arc::new(SoftNicDriver::new());
    let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
    let rendezvous: Arc<dyn Rendezvous> =
        Arc::new(TcpRendezvousClient::connect(rendezvous_root, rank_id, rank_count)?);
    let options = TransportOptions {
        rank_id,
        rank_count,
        nic: format!("tcp://127.0.0.1:{port}"),
        role: Role::Peer,
        initial_type: InitialType::Host,
    };
    Ok(TransportBuilder::new()
        .rendezvous(rendezvous)
        .open(options, nic, hal)?)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let (port_a, port_b) = (15900, 15901);
    let rendezvous_root: NicAddr = "tcp://127.0.0.1:15902".parse()?;

    let transport_a = open(0, 2, port_a, &rendezvous_root)?;
    let local = vec![0x14u8; 1 << 16];
    let local_addr = local.as_ptr() as u64;
    transport_a.register_memory_region(
        local_addr,
        local.len(),
        MrAccess {
            local_write: true,
            ..Default::default()
        },
        MrFlags::Dram,
    )?;

    let remote = vec![0u8; 1 << 16];
    let remote_addr = remote.as_ptr() as u64;
    let rendezvous_root_b = rendezvous_root.clone();
    let handle = std::thread::spawn(move || -> anyhow::Result<Vec<u8>> {
        let transport_b = open(1, 2, port_b, &rendezvous_root_b)?;
        transport_b.register_memory_region(
            remote_addr,
            remote.len(),
            MrAccess {
                local_write: true,
                remote_write: true,
                ..Default::default()
            },
            MrFlags::Dram,
        )?;
        transport_b.prepare(vec![PeerInfo {
            rank_id: 0,
            nic: format!("tcp://127.0.0.1:{port_a}").parse()?,
            role: None,
        }])?;
        transport_b.connect()?;
        Ok(remote)
    });

    transport_a.prepare(vec![PeerInfo {
        rank_id: 1,
        nic: format!("tcp://127.0.0.1:{port_b}").parse()?,
        role: None,
    }])?;
    transport_a.connect()?;

    let remote = handle.join().expect("rank 1 panicked")?;
    transport_a.write_remote(1, local_addr, remote.as_ptr() as u64, local.len())?;
    transport_a.synchronize(1)?;

    assert_eq!(&remote[..], &local[..]);
    println!("loopback write observed by rank 1 after synchronize");
    Ok(())
}
