//! Doorbell SQE construction: turns a remote read/write request into a
//! driver-produced doorbell word, then a ring-buffer SQE addressed at the
//! NIC's doorbell register.

use crate::driver::{DoorbellInfo, NicDriver, QpHandle, SendWr};
use crate::error::{Error, Result};
use crate::stream::{SqeType, Stream};

/// Chip/die addressing parameters, resolved once at `open_device` via chip
/// info queries and cached for the lifetime of the device.
#[derive(Debug, Clone, Copy)]
pub struct DoorbellAddressing {
    pub rocee_base: u64,
    pub rocee_vf_db_cfg0: u64,
    pub chip_offset: u64,
    pub die_offset: u64,
    pub chip_id: u64,
    pub die_id: u64,
    pub chip_addr: u64,
}

impl DoorbellAddressing {
    /// The doorbell MMIO address this device's doorbell writes target.
    pub fn address(&self) -> u64 {
        self.rocee_base
            + self.rocee_vf_db_cfg0
            + self.chip_offset * self.chip_id
            + self.die_offset * self.die_id
            + self.chip_addr
    }
}

/// Build the `send_wr_v2`, have the driver produce its doorbell word, and
/// submit the resulting SQE onto `stream`. Returns the assigned task id.
///
/// Fails closed (without submitting) if the doorbell address resolves to
/// zero.
#[allow(clippy::too_many_arguments)]
pub fn submit_remote_io(
    nic: &dyn NicDriver,
    stream: &Stream,
    addressing: &DoorbellAddressing,
    qp: QpHandle,
    wr: &SendWr,
    stream_id: u32,
    sqe_type: SqeType,
) -> Result<u32> {
    let addr = addressing.address();
    if addr == 0 {
        return Err(Error::InvalidParam(
            "doorbell address resolved to 0; refusing to submit".into(),
        )
        .record());
    }

    let DoorbellInfo { db_info } = nic.send_wr(qp, wr)?;
    stream.submit_tasks(stream_id, sqe_type, addr, db_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::soft::{SoftHalDriver, SoftNicDriver};
    use crate::driver::{HalDriver, MrAccess, QpMode, RdmaOp, WrFlags};
    use std::sync::Arc;

    fn addressing() -> DoorbellAddressing {
        DoorbellAddressing {
            rocee_base: 0x1000_0000,
            rocee_vf_db_cfg0: 0x100,
            chip_offset: 0x10,
            die_offset: 0x1,
            chip_id: 0,
            die_id: 0,
            chip_addr: 0x8,
        }
    }

    #[test]
    fn submits_after_driver_produces_doorbell_word() {
        let nic = SoftNicDriver::new();
        nic.init().unwrap();
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();

        let qp = nic.qp_create(QpMode::Standard).unwrap();
        nic.qp_connect_async(qp, -1).unwrap();
        let (_, keys) = nic
            .mr_register(0, 64, MrAccess::default())
            .unwrap();

        let src = vec![9u8; 64];
        let mut dst = vec![0u8; 64];
        let wr = SendWr {
            local_addr: src.as_ptr() as u64,
            size: 64,
            lkey: keys.lkey,
            remote_addr: dst.as_mut_ptr() as u64,
            rkey: keys.rkey,
            op: RdmaOp::Write,
            flags: WrFlags {
                signaled: true,
                fence: false,
            },
        };

        let task_id = submit_remote_io(
            &nic,
            &stream,
            &addressing(),
            qp,
            &wr,
            0,
            SqeType::RemoteWrite,
        )
        .unwrap();
        stream.synchronize(task_id).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn zero_address_fails_closed() {
        let addressing = DoorbellAddressing {
            rocee_base: 0,
            rocee_vf_db_cfg0: 0,
            chip_offset: 0,
            die_offset: 0,
            chip_id: 0,
            die_id: 0,
            chip_addr: 0,
        };
        let nic = SoftNicDriver::new();
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();
        let qp = nic.qp_create(QpMode::Standard).unwrap();
        let wr = SendWr {
            local_addr: 0,
            size: 0,
            lkey: 0,
            remote_addr: 0,
            rkey: 0,
            op: RdmaOp::Write,
            flags: WrFlags::default(),
        };
        assert!(submit_remote_io(&nic, &stream, &addressing, qp, &wr, 0, SqeType::RemoteWrite).is_err());
    }
}
