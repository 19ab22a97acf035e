//! The BMF-T prelude.
//!
//! The purpose of this module is to alleviate imports of the types most
//! callers need to open a device, register memory, and drive a transport.

pub use crate::config::{ClusterConfig, InitialType, QpConnVariant, Role, TransportOptions};
pub use crate::driver::{HalDriver, NicDriver};
pub use crate::error::{Error, Result};
pub use crate::mrtable::{MrAccess, MrFlags};
pub use crate::net::{MemoryKey, NicAddr};
pub use crate::qpconn::PeerInfo;
pub use crate::transport::{Transport, TransportBuilder};
