//! Length-prefixed framing shared by every rendezvous request/response.

use std::io::{Read, Write};

use crate::error::{Error, Result};

pub(super) fn write_frame<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    w.write_all(&(buf.len() as u64).to_le_bytes())
        .map_err(|e| Error::Transport(format!("rendezvous write failed: {e}")).record())?;
    w.write_all(buf)
        .map_err(|e| Error::Transport(format!("rendezvous write failed: {e}")).record())
}

pub(super) fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf)
        .map_err(|e| Error::Transport(format!("rendezvous read failed: {e}")).record())?;
    let len = u64::from_le_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| Error::Transport(format!("rendezvous read failed: {e}")).record())?;
    Ok(buf)
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(super) enum Request {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    Barrier { group: String, rank: usize, size: usize },
    Allgather { group: String, rank: usize, size: usize, bytes: Vec<u8> },
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(super) enum Response {
    Ok,
    Value(Vec<u8>),
    Gathered(Vec<Vec<u8>>),
    Err(String),
}
