//! Transport configuration: per-rank options and on-disk cluster layout.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net::NicAddr;

/// The role a rank plays within a [`crate::qpconn::QpConnManager`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Peer,
    Sender,
    Receiver,
}

/// Where a registered memory region physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitialType {
    AiCore,
    Host,
}

/// Per-rank transport options, the argument to `open_device`/`prepare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    pub rank_id: usize,
    pub rank_count: usize,
    pub nic: String,
    pub role: Role,
    pub initial_type: InitialType,
}

impl TransportOptions {
    /// Validate the invariants that hold regardless of which
    /// [`crate::qpconn::QpConnManager`] variant will be selected.
    pub fn validate(&self) -> Result<NicAddr> {
        if self.rank_id >= self.rank_count {
            return Err(Error::InvalidParam(format!(
                "rank_id {} must be < rank_count {}",
                self.rank_id, self.rank_count
            ))
            .record());
        }
        let nic: NicAddr = self
            .nic
            .parse()
            .map_err(|_| Error::InvalidParam(format!("malformed NIC address: {:?}", self.nic)))?;
        if nic.port == 0 {
            return Err(Error::InvalidParam("NIC port must be nonzero".into()).record());
        }
        Ok(nic)
    }

    /// Which `QpConnManager` variant these options select.
    ///
    /// Fixed when `initial_type == AiCore`; Bipartite for the
    /// sender/receiver roles; Joinable otherwise.
    pub fn variant(&self) -> QpConnVariant {
        match (self.initial_type, self.role) {
            (InitialType::AiCore, _) => QpConnVariant::Fixed,
            (_, Role::Sender) | (_, Role::Receiver) => QpConnVariant::Bipartite,
            _ => QpConnVariant::Joinable,
        }
    }
}

/// Which `QpConnManager` implementation `open_device` will construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpConnVariant {
    Fixed,
    Bipartite,
    Joinable,
}

impl fmt::Display for QpConnVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QpConnVariant::Fixed => "fixed",
            QpConnVariant::Bipartite => "bipartite",
            QpConnVariant::Joinable => "joinable",
        })
    }
}

/// Static cluster layout loaded from a TOML file: one NIC literal per rank
/// under a `[bmft]` table, mirroring how the rendezvous store is bootstrapped
/// before any rank has dialed another.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub bmft: ClusterPeers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterPeers {
    pub peers: Vec<String>,
    #[serde(default)]
    pub rendezvous: Option<String>,
}

impl ClusterConfig {
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidParam(format!("cannot read {:?}: {e}", path.as_ref())).record()
        })?;
        toml::from_str(&text)
            .map_err(|e| Error::InvalidParam(format!("malformed cluster config: {e}")).record())
    }

    /// NIC addresses of every peer, parsed and validated.
    pub fn peer_nics(&self) -> Result<Vec<NicAddr>> {
        self.bmft
            .peers
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::InvalidParam(format!("malformed peer NIC: {s:?}")).record())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_rank_id_out_of_range() {
        let opts = TransportOptions {
            rank_id: 2,
            rank_count: 2,
            nic: "tcp://127.0.0.1:10050".into(),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let opts = TransportOptions {
            rank_id: 0,
            rank_count: 2,
            nic: "tcp://0.0.0.0:0".into(),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn ai_core_selects_fixed_variant() {
        let opts = TransportOptions {
            rank_id: 0,
            rank_count: 2,
            nic: "tcp://127.0.0.1:10050".into(),
            role: Role::Peer,
            initial_type: InitialType::AiCore,
        };
        assert_eq!(opts.variant(), QpConnVariant::Fixed);
    }

    #[test]
    fn sender_receiver_select_bipartite() {
        let opts = TransportOptions {
            rank_id: 0,
            rank_count: 2,
            nic: "tcp://127.0.0.1:10050".into(),
            role: Role::Sender,
            initial_type: InitialType::Host,
        };
        assert_eq!(opts.variant(), QpConnVariant::Bipartite);
    }

    #[test]
    fn peer_host_selects_joinable() {
        let opts = TransportOptions {
            rank_id: 0,
            rank_count: 2,
            nic: "tcp://127.0.0.1:10050".into(),
            role: Role::Peer,
            initial_type: InitialType::Host,
        };
        assert_eq!(opts.variant(), QpConnVariant::Joinable);
    }

    #[test]
    fn loads_cluster_toml() {
        let tmp = std::env::temp_dir().join("bmft_test_cluster.toml");
        fs::write(
            &tmp,
            "[bmft]\npeers = [\"tcp://127.0.0.1:10050\", \"tcp://127.0.0.1:10051\"]\n",
        )
        .unwrap();
        let cfg = ClusterConfig::load_toml(&tmp).unwrap();
        assert_eq!(cfg.bmft.peers.len(), 2);
        assert_eq!(cfg.peer_nics().unwrap().len(), 2);
        let _ = fs::remove_file(&tmp);
    }
}
