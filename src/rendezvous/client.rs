//! Concrete TCP rendezvous client and its embedded store server.
//!
//! Rank 0 of a group hosts the KV store (the same coordinator-at-rank-0
//! convention the barrier logic below uses); every other rank is a pure
//! client. One TCP connection per client is held open for the lifetime of
//! the rendezvous and serialized requests are sent down it.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::NicAddr;
use crate::rendezvous::wire::{read_frame, write_frame, Request, Response};
use crate::rendezvous::Rendezvous;

#[derive(Default)]
struct GroupState {
    barrier_waiting: usize,
    barrier_generation: u64,
    allgather_entries: Vec<Option<Vec<u8>>>,
    allgather_generation: u64,
}

#[derive(Default)]
struct Store {
    kv: HashMap<String, Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

struct Server {
    state: Mutex<Store>,
    cond: Condvar,
}

impl Server {
    fn handle(self: &Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().expect("clone rendezvous socket"));
        let mut writer = BufWriter::new(stream);
        loop {
            let frame = match read_frame(&mut reader) {
                Ok(f) => f,
                Err(_) => return, // peer disconnected
            };
            let req: Request = match serde_json::from_slice(&frame) {
                Ok(r) => r,
                Err(e) => {
                    let resp = Response::Err(format!("malformed request: {e}"));
                    let _ = respond(&mut writer, &resp);
                    continue;
                }
            };
            let resp = self.dispatch(req);
            if respond(&mut writer, &resp).is_err() {
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, req: Request) -> Response {
        match req {
            Request::Put { key, value } => {
                self.state.lock().unwrap().kv.insert(key, value);
                Response::Ok
            }
            Request::Get { key } => {
                let mut guard = self.state.lock().unwrap();
                loop {
                    if let Some(v) = guard.kv.get(&key) {
                        return Response::Value(v.clone());
                    }
                    guard = self.cond.wait(guard).unwrap();
                }
            }
            Request::Barrier { group, size, .. } => {
                let mut guard = self.state.lock().unwrap();
                let start_gen = guard.groups.entry(group.clone()).or_default().barrier_generation;
                {
                    let g = guard.groups.get_mut(&group).unwrap();
                    g.barrier_waiting += 1;
                    if g.barrier_waiting == size {
                        g.barrier_waiting = 0;
                        g.barrier_generation += 1;
                        self.cond.notify_all();
                    }
                }
                while guard.groups[&group].barrier_generation == start_gen {
                    guard = self.cond.wait(guard).unwrap();
                }
                Response::Ok
            }
            Request::Allgather {
                group,
                rank,
                size,
                bytes,
            } => {
                let mut guard = self.state.lock().unwrap();
                let g = guard.groups.entry(group.clone()).or_default();
                if g.allgather_entries.len() != size {
                    g.allgather_entries = vec![None; size];
                }
                let start_gen = g.allgather_generation;
                g.allgather_entries[rank] = Some(bytes);
                if g.allgather_entries.iter().all(Option::is_some) {
                    g.allgather_generation += 1;
                    self.cond.notify_all();
                }
                while guard.groups[&group].allgather_generation == start_gen {
                    guard = self.cond.wait(guard).unwrap();
                }
                let entries = guard.groups[&group]
                    .allgather_entries
                    .iter()
                    .map(|e| e.clone().unwrap_or_default())
                    .collect();
                Response::Gathered(entries)
            }
        }
    }
}

fn respond<W: std::io::Write>(w: &mut W, resp: &Response) -> Result<()> {
    let buf = serde_json::to_vec(resp)
        .map_err(|e| Error::Transport(format!("rendezvous encode failed: {e}")))?;
    write_frame(w, &buf)?;
    w.flush()
        .map_err(|e| Error::Transport(format!("rendezvous flush failed: {e}")).record())
}

/// A TCP-backed rendezvous client. Rank 0 hosts the store in a background
/// accept loop; every rank, including rank 0, talks to it over one held-open
/// connection.
pub struct TcpRendezvousClient {
    conn: Mutex<TcpStream>,
    rank: usize,
    size: usize,
}

impl TcpRendezvousClient {
    /// Connect to the rendezvous store reachable at `root`. If `rank == 0`,
    /// first spins up the store server on `root`'s port in a background
    /// thread (mirroring `ctrl::Barrier::wait_on_port`'s rank-0-listens
    /// convention), retrying the client connect until the listener is live.
    pub fn connect(root: &NicAddr, rank: usize, size: usize) -> Result<Self> {
        if rank == 0 {
            spawn_server(root.socket_addr())?;
        }

        let addr = root.socket_addr();
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(s) => break s,
                Err(_) => thread::sleep(Duration::from_millis(100)),
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(format!("set_nodelay failed: {e}")).record())?;

        Ok(Self {
            conn: Mutex::new(stream),
            rank,
            size,
        })
    }

    fn roundtrip(&self, req: Request) -> Result<Response> {
        let mut stream = self.conn.lock().unwrap();
        let buf = serde_json::to_vec(&req)
            .map_err(|e| Error::Transport(format!("rendezvous encode failed: {e}")))?;
        write_frame(&mut *stream, &buf)?;
        let frame = read_frame(&mut *stream)?;
        serde_json::from_slice(&frame)
            .map_err(|e| Error::Transport(format!("rendezvous decode failed: {e}")).record())
    }
}

fn spawn_server(addr: SocketAddrV4) -> Result<()> {
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        // A second local process/rank already raced us to bind: assume it
        // is the legitimate rank 0 and that the store is already running.
        Err(_) => return Ok(()),
    };
    let server = Arc::new(Server {
        state: Mutex::new(Store::default()),
        cond: Condvar::new(),
    });
    thread::spawn(move || {
        for incoming in listener.incoming() {
            let Ok(stream) = incoming else { continue };
            let server = server.clone();
            thread::spawn(move || server.handle(stream));
        }
    });
    // Give the just-bound listener a moment before the owning rank's own
    // client connect races it.
    thread::sleep(Duration::from_millis(10));
    Ok(())
}

impl Rendezvous for TcpRendezvousClient {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.roundtrip(Request::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })? {
            Response::Ok => Ok(()),
            Response::Err(e) => Err(Error::Transport(e).record()),
            _ => Err(Error::Transport("unexpected rendezvous response to put".into()).record()),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.roundtrip(Request::Get {
            key: key.to_string(),
        })? {
            Response::Value(v) => Ok(v),
            Response::Err(e) => Err(Error::Transport(e).record()),
            _ => Err(Error::Transport("unexpected rendezvous response to get".into()).record()),
        }
    }

    fn barrier(&self, group: &str) -> Result<()> {
        match self.roundtrip(Request::Barrier {
            group: group.to_string(),
            rank: self.rank,
            size: self.size,
        })? {
            Response::Ok => Ok(()),
            Response::Err(e) => Err(Error::Transport(e).record()),
            _ => Err(Error::Transport("unexpected rendezvous response to barrier".into()).record()),
        }
    }

    fn allgather(&self, group: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self.roundtrip(Request::Allgather {
            group: group.to_string(),
            rank: self.rank,
            size: self.size,
            bytes: bytes.to_vec(),
        })? {
            Response::Gathered(v) => Ok(v),
            Response::Err(e) => Err(Error::Transport(e).record()),
            _ => {
                Err(Error::Transport("unexpected rendezvous response to allgather".into()).record())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier as StdBarrier;

    #[test]
    fn put_then_get_round_trips() {
        let root: NicAddr = "tcp://127.0.0.1:18881".parse().unwrap();
        let client = TcpRendezvousClient::connect(&root, 0, 1).unwrap();
        client.put("k", b"v").unwrap();
        assert_eq!(client.get("k").unwrap(), b"v");
    }

    #[test]
    fn barrier_releases_all_ranks() {
        let root: NicAddr = "tcp://127.0.0.1:18882".parse().unwrap();
        let size = 3;
        let started = Arc::new(StdBarrier::new(size));
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let root = root.clone();
                let started = started.clone();
                thread::spawn(move || {
                    let client = TcpRendezvousClient::connect(&root, rank, size).unwrap();
                    started.wait();
                    client.barrier("g").unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn allgather_collects_every_rank_in_order() {
        let root: NicAddr = "tcp://127.0.0.1:18883".parse().unwrap();
        let size = 3;
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let root = root.clone();
                thread::spawn(move || {
                    let client = TcpRendezvousClient::connect(&root, rank, size).unwrap();
                    client.allgather("g", &[rank as u8]).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results {
            assert_eq!(r, &vec![vec![0u8], vec![1u8], vec![2u8]]);
        }
    }
}
