//! Connections the agent polls.
//!
//! Relayed frames arrive on short-lived UNIX connections from the launcher's
//! forwarder, one frame each. Direct links from other agents start as
//! temporary TCP connections until their greeting is verified, then become
//! persistent. Engines for temporary connections come from per-protocol
//! pools and are detached, not dropped, when the connection ends.

use crate::error::Result;
use crate::proto::{BaseHeader, Encoding, Engine, ServerProto};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;
use stepio::engine::Status;
use stepio::{Interest, Pool};

const POOL_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Unverified; `direct` is true for TCP links from other agents.
    Temp { direct: bool },
    Persistent { nodeid: u32 },
}

struct Conn {
    kind: ConnKind,
    engine: Arc<Engine>,
}

pub struct ConnRegistry {
    enc: Encoding,
    conns: Vec<Conn>,
    relay_pool: Pool<Arc<Engine>>,
    direct_pool: Pool<Arc<Engine>>,
}

impl ConnRegistry {
    pub fn new(enc: Encoding) -> Self {
        Self {
            enc,
            conns: Vec::new(),
            relay_pool: Pool::new(POOL_CAP),
            direct_pool: Pool::new(POOL_CAP),
        }
    }

    pub fn add_temp(&mut self, fd: OwnedFd, direct: bool) -> Result<()> {
        let enc = self.enc;
        let engine = if direct {
            self.direct_pool
                .take_or_else(|| Arc::new(Engine::new(ServerProto::direct(enc))))
        } else {
            self.relay_pool
                .take_or_else(|| Arc::new(Engine::new(ServerProto::relayed(enc))))
        };
        engine.attach(fd)?;
        self.conns.push(Conn {
            kind: ConnKind::Temp { direct },
            engine,
        });
        Ok(())
    }

    /// Takes over an engine bound to a verified peer link.
    pub fn add_persistent(&mut self, nodeid: u32, engine: Arc<Engine>) {
        self.conns.retain(|c| c.kind != ConnKind::Persistent { nodeid });
        self.conns.push(Conn {
            kind: ConnKind::Persistent { nodeid },
            engine,
        });
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn kind(&self, idx: usize) -> ConnKind {
        self.conns[idx].kind
    }

    /// `(index, fd, interest)` of every connection worth polling.
    pub fn poll_set(&self) -> Vec<(usize, RawFd, Interest)> {
        self.conns
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| {
                let fd = c.engine.fd()?;
                let interest = c.engine.interest();
                (!interest.is_empty()).then_some((idx, fd, interest))
            })
            .collect()
    }

    /// Moves data on connection `idx` and returns the frames that completed.
    /// An unverified direct link yields at most its greeting.
    pub fn progress(&mut self, idx: usize, readable: bool, writable: bool) -> Vec<(BaseHeader, Vec<u8>)> {
        let conn = &self.conns[idx];
        let greeting_only = conn.kind == ConnKind::Temp { direct: true };
        if writable {
            conn.engine.send_progress();
        }
        let mut frames = Vec::new();
        if readable {
            loop {
                conn.engine.progress_recv();
                match conn.engine.recv_extract() {
                    Some(frame) => frames.push(frame),
                    None => break,
                }
                if greeting_only {
                    break;
                }
            }
        }
        frames
    }

    /// Takes the fd out of temporary connection `idx`, which is then dropped
    /// on the next cleanup.
    pub fn take_fd(&mut self, idx: usize) -> Option<OwnedFd> {
        match self.conns[idx].kind {
            ConnKind::Temp { .. } => self.conns[idx].engine.detach(),
            ConnKind::Persistent { .. } => None,
        }
    }

    /// Drops finished connections. Returns the peers whose persistent link
    /// closed.
    pub fn cleanup(&mut self) -> Vec<u32> {
        let mut closed = Vec::new();
        let mut keep = Vec::with_capacity(self.conns.len());
        for conn in std::mem::take(&mut self.conns) {
            let status = conn.engine.status();
            match conn.kind {
                ConnKind::Temp { direct } => {
                    if status == Status::Operating {
                        keep.push(conn);
                        continue;
                    }
                    // hand the fd back to the kernel, keep the engine
                    drop(conn.engine.detach());
                    if direct {
                        self.direct_pool.put(conn.engine);
                    } else {
                        self.relay_pool.put(conn.engine);
                    }
                }
                ConnKind::Persistent { nodeid } => match status {
                    Status::Operating => keep.push(conn),
                    Status::ConnClosed => closed.push(nodeid),
                    // detached by a disconnect that already ran
                    Status::Init => {}
                },
            }
        }
        self.conns = keep;
        closed
    }
}
