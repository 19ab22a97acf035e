//! Per-(thread, stream) notify object: submits a `NotifyWait` SQE and
//! drains the owning stream until it resolves.
//!
//! One notify object is bound to exactly one stream, resolving the
//! ambiguity over whether concurrent notifies on different streams of the
//! same thread can alias: they cannot, because each stream owns its own
//! notify object.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::HalDriver;
use crate::error::Result;
use crate::stream::{SqeType, Stream};

/// Hardware-level timeout on a `NotifyWait` SQE.
pub const TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A stream-bound notify object.
pub struct StreamNotify {
    notify_id: u32,
    device_addr_offset: u64,
}

impl StreamNotify {
    /// Allocate a driver notify id and compute its device-address offset.
    pub fn new(hal: &Arc<dyn HalDriver>) -> Result<Self> {
        let (notify_id, device_addr_offset) = hal.notify_id_alloc()?;
        Ok(Self {
            notify_id,
            device_addr_offset,
        })
    }

    pub fn notify_id(&self) -> u32 {
        self.notify_id
    }

    pub fn device_addr_offset(&self) -> u64 {
        self.device_addr_offset
    }

    /// Submit a `NotifyWait` SQE on `stream` then drain it, enforcing the
    /// hardware-level [`TASK_WAIT_TIMEOUT`]: a notify that never fires
    /// surfaces `Error::Timeout` rather than blocking forever.
    pub fn wait(&self, stream: &Stream, stream_id: u32) -> Result<()> {
        let task_id = stream.submit_tasks(
            stream_id,
            SqeType::NotifyWait,
            self.device_addr_offset,
            self.notify_id as u64,
        )?;
        stream.synchronize_timeout(task_id, TASK_WAIT_TIMEOUT)
    }
}
