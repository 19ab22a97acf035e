//! Stream / Submission Queue: a fixed-depth ring over the hardware SQ/CQ,
//! with per-thread doorbell construction and notify-word synchronization.

pub mod doorbell;
pub mod notify;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::driver::{CqError, HalDriver};
use crate::error::{Error, Result};

/// Ring depth (`HYBM_SQCQ_DEPTH`).
pub const DEPTH: usize = 2048;

/// Submission-queue entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqeType {
    RemoteWrite,
    RemoteRead,
    NotifyWrite,
    NotifyWait,
}

/// A single 64-byte submission-queue entry, as tracked by the ring (the
/// actual 64-byte hardware payload is opaque and owned by the driver; this
/// is the bookkeeping half the stream needs to report completion).
#[derive(Debug, Clone, Copy)]
pub struct Sqe {
    pub task_id: u32,
    pub stream_id: u32,
    pub sqe_type: SqeType,
    pub doorbell_value: u64,
    pub doorbell_addr: u64,
}

/// Sentinel meaning "drain the entire queue" for [`Stream::synchronize`].
pub const UNTIL_TASK_ALL: u32 = u32::MAX;

fn wrapping_ge(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < (u32::MAX / 2)
}

fn task_in_range(task: u32, head: u32, tail: u32) -> bool {
    wrapping_ge(task, head) && !wrapping_ge(task, tail)
}

struct RingState {
    head: u32,
    tail: u32,
    entries: Vec<Option<Sqe>>,
}

/// One thread-local stream: a ring buffer over one hardware SQ/CQ pair.
///
/// Streams are constructed lazily, one per (device, thread); destroying one
/// is only allowed once `running_task_count() == 0` or during teardown.
pub struct Stream {
    hal: Arc<dyn HalDriver>,
    ring_id: u32,
    state: Mutex<RingState>,
}

impl Stream {
    pub fn new(hal: Arc<dyn HalDriver>) -> Result<Self> {
        let ring_id = hal.sqcq_allocate(DEPTH)?;
        Ok(Self {
            hal,
            ring_id,
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                entries: vec![None; DEPTH],
            }),
        })
    }

    /// Number of tasks submitted but not yet retired at the head pointer.
    pub fn running_task_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.tail.wrapping_sub(state.head)
    }

    /// Submit one task onto the ring. If the ring is full, synchronizes
    /// first to reclaim space. Stamps and returns the assigned `task_id`.
    pub fn submit_tasks(
        &self,
        stream_id: u32,
        sqe_type: SqeType,
        doorbell_addr: u64,
        doorbell_value: u64,
    ) -> Result<u32> {
        {
            let full = {
                let state = self.state.lock().unwrap();
                state.tail.wrapping_sub(state.head) as usize >= DEPTH - 1
            };
            if full {
                let head = self.state.lock().unwrap().head;
                self.synchronize(head)?;
            }
        }

        if doorbell_addr == 0 {
            return Err(Error::InvalidParam(
                "doorbell address resolved to 0; refusing to submit".into(),
            )
            .record());
        }

        let mut state = self.state.lock().unwrap();
        let task_id = state.tail;
        let idx = (task_id as usize) % DEPTH;
        state.entries[idx] = Some(Sqe {
            task_id,
            stream_id,
            sqe_type,
            doorbell_value,
            doorbell_addr,
        });
        state.tail = state.tail.wrapping_add(1);
        drop(state);

        self.hal
            .sq_task_send(self.ring_id, doorbell_addr, doorbell_value)
            .map_err(|e| {
                let mut state = self.state.lock().unwrap();
                state.tail = state.tail.wrapping_sub(1);
                e
            })?;

        Ok(task_id)
    }

    /// Drain completions until `head` passes `until_task` (inclusive), or
    /// the whole queue if `until_task == UNTIL_TASK_ALL`.
    pub fn synchronize(&self, until_task: u32) -> Result<()> {
        self.drain(until_task, None)
    }

    /// Same as [`Stream::synchronize`], but fails with `Error::Timeout` if
    /// `until_task` hasn't retired within `timeout`.
    pub fn synchronize_timeout(&self, until_task: u32, timeout: Duration) -> Result<()> {
        self.drain(until_task, Some(timeout))
    }

    fn drain(&self, until_task: u32, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (head, tail) = {
                let state = self.state.lock().unwrap();
                (state.head, state.tail)
            };
            if head == tail {
                return Ok(());
            }
            if until_task != UNTIL_TASK_ALL && !task_in_range(until_task, head, tail) {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(format!(
                        "stream {} did not retire task {until_task} within {:?}",
                        self.ring_id,
                        timeout.unwrap()
                    ))
                    .record());
                }
            }

            match self.hal.cq_report_recv(self.ring_id)? {
                None => {
                    let hw_head = self.hal.sqcq_query_head(self.ring_id)?;
                    let mut state = self.state.lock().unwrap();
                    state.head = hw_head;
                }
                Some(report) => {
                    if let Some(err) = report.error {
                        return Err(Error::Transport(format!(
                            "completion error: {}",
                            describe_cq_error(err)
                        ))
                        .record());
                    }
                    let mut state = self.state.lock().unwrap();
                    let new_head = report.last_completed_task_id.wrapping_add(1);
                    for i in state.head..new_head {
                        state.entries[(i as usize) % DEPTH] = None;
                    }
                    state.head = new_head;
                }
            }
        }
    }
}

fn describe_cq_error(err: CqError) -> &'static str {
    match err {
        CqError::Sdma => "sdma",
        CqError::Fetch => "fetch",
        CqError::Reduce => "reduce",
        CqError::DataNaN => "data-nan",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::soft::SoftHalDriver;

    #[test]
    fn submit_then_synchronize_advances_head() {
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();
        let id = stream
            .submit_tasks(0, SqeType::RemoteWrite, 0x1000, 42)
            .unwrap();
        assert_eq!(stream.running_task_count(), 1);
        stream.synchronize(id).unwrap();
        assert_eq!(stream.running_task_count(), 0);
    }

    #[test]
    fn rejects_zero_doorbell_address() {
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();
        assert!(stream
            .submit_tasks(0, SqeType::RemoteWrite, 0, 1)
            .is_err());
    }

    #[test]
    fn full_queue_forces_synchronize_before_admitting_new_task() {
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();
        for _ in 0..DEPTH - 1 {
            stream
                .submit_tasks(0, SqeType::RemoteWrite, 0x1000, 1)
                .unwrap();
        }
        assert_eq!(stream.running_task_count() as usize, DEPTH - 1);
        // This submit must force a synchronize to reclaim space.
        stream
            .submit_tasks(0, SqeType::RemoteWrite, 0x1000, 1)
            .unwrap();
        assert!((stream.running_task_count() as usize) < DEPTH);
    }

    #[test]
    fn empty_queue_synchronize_is_a_no_op() {
        let hal: Arc<dyn HalDriver> = Arc::new(SoftHalDriver::new());
        let stream = Stream::new(hal).unwrap();
        stream.synchronize(UNTIL_TASK_ALL).unwrap();
    }
}
