//! BMF-T: a peer-to-peer RDMA transport that federates accelerator-rank
//! device memories into one symmetric Global Virtual Address (GVA) space
//! and serves read/write requests across it through reliable queue pairs.
//!
//! [`transport::Transport`] is the only public surface most callers need: it
//! opens a device, registers memory, connects to a peer set, and issues
//! remote reads/writes/synchronizes. Everything beneath it — the
//! per-peer connection state machine ([`qpconn`]), the memory-region table
//! ([`mrtable`]), and the submission-queue ring ([`stream`]) — is exposed
//! for embedders who need finer control or who are wiring in their own
//! [`driver::NicDriver`]/[`driver::HalDriver`] implementation.
//!
//! **WARNING: The interfaces are unstable and up to change!**
//!
//! # Example
//!
//! This example walks two ranks through a loopback write using the
//! software reference driver, the same scenario exercised in
//! `transport::tests::two_rank_loopback_write_then_synchronize_observes_data`.
//!
//! ```rust
#![doc = include_str!("../demos/loopback.rs")]
//! ```

/// Device/network vocabulary: NIC address parsing, rank maps, the wire
/// memory-key packet.
pub mod net;

/// Opaque rendezvous KV-store client used only to bootstrap QP connections.
pub mod rendezvous;

/// Socket Fabric: listener lifecycle, batched connect, whitelist
/// maintenance.
pub mod socket;

/// QP-Connection Manager: the per-peer connection state machine and its
/// three role variants.
pub mod qpconn;

/// Memory-Region Table: local and per-peer memory-region registries.
pub mod mrtable;

/// Stream / Submission Queue: the hardware SQ/CQ ring, doorbell
/// construction, and notify-word synchronization.
pub mod stream;

/// Transport Manager: the per-rank facade and crate's primary entry point.
pub mod transport;

/// Opaque NIC and HAL driver trait surfaces, plus a software reference
/// implementation.
pub mod driver;

/// Crate-wide error type and thread-local last-error slot.
pub mod error;

/// Transport configuration: per-rank options and on-disk cluster layout.
pub mod config;

/// The BMF-T prelude: re-exports of the types most callers need.
pub mod prelude;

pub use error::{Error, Result};
pub use transport::{Transport, TransportBuilder};
