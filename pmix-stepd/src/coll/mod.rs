//! Fence collectives.
//!
//! A collective is identified by its algorithm and the sorted set of
//! participating processes. Its state machine runs under one mutex and
//! returns the I/O it wants done as [`Action`]s, which are carried out after
//! the mutex is released. Send completions and the library's release of
//! delivered data re-enter the state machine through [`Completion`]s.

pub mod ring;
pub mod topo;
pub mod tree;

use crate::error::{Error, Result, Status};
use crate::libpmix::{Callback, ModexData};
use crate::nspace::Proc;
use crate::proto::{BaseHeader, MsgType, Reader, SendDone, ServerBuf};
use crate::server::{self, check_seq, Endpoint, SeqCheck};
use crate::step::Step;
use ring::Ring;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tree::{Tree, TreeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CollType {
    FenceTree = 0,
    FenceRing = 1,
}

impl TryFrom<u32> for CollType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::FenceTree),
            1 => Ok(Self::FenceRing),
            _ => Err(Error::BadParam(format!("unknown collective type {}", value))),
        }
    }
}

pub fn pack_key(buf: &mut ServerBuf, ctype: CollType, procs: &[Proc]) {
    buf.put_u32(ctype as u32);
    buf.put_u32(procs.len() as u32);
    for proc in procs {
        buf.put_str(&proc.nspace);
        buf.put_u32(proc.rank);
    }
}

pub fn unpack_key(rd: &mut Reader) -> Result<(CollType, Vec<Proc>)> {
    let ctype = CollType::try_from(rd.get_u32()?)?;
    let nprocs = rd.get_u32()?;
    let mut procs = Vec::new();
    for _ in 0..nprocs {
        let nspace = rd.get_str()?;
        procs.push(Proc::new(nspace, rd.get_u32()?));
    }
    Ok((ctype, procs))
}

/// Fixed facts about a collective, shared by both algorithms.
#[derive(Debug)]
pub struct CollInfo {
    pub ctype: CollType,
    /// Sorted.
    pub procs: Vec<Proc>,
    /// Hosts of the participating nodes, in node id order. Indices into this
    /// list are peer ids.
    pub peers: Vec<String>,
    /// Step node id of every peer.
    pub nodes: Vec<u32>,
    /// Our peer id.
    pub me: u32,
    pub direct: bool,
}

impl CollInfo {
    pub fn size(&self) -> u32 {
        self.peers.len() as u32
    }

    pub fn peer_of(&self, nodeid: u32) -> Option<u32> {
        self.nodes.iter().position(|&n| n == nodeid).map(|p| p as u32)
    }

    pub fn node(&self, peer: u32) -> u32 {
        self.nodes[peer as usize]
    }

    /// A frame buffer that already carries the collective key.
    pub fn key_buf(&self, payload: usize) -> ServerBuf {
        let mut buf = ServerBuf::with_capacity(payload + 64);
        pack_key(&mut buf, self.ctype, &self.procs);
        buf
    }
}

/// Re-entry points into a state machine. The generation tells stale
/// completions from a reset round apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    TreeUp(u64),
    TreeDown(u64),
    TreeLocal(u64),
    RingForward { ctx: usize, gen: u64 },
}

pub enum Action {
    Send {
        ep: Endpoint,
        mtype: MsgType,
        seq: u32,
        buf: ServerBuf,
        done: Option<Completion>,
    },
    Deliver {
        cb: Callback,
        status: Status,
        data: Vec<u8>,
        release: Option<Completion>,
    },
    Fatal(Error),
}

impl Action {
    pub fn fail(cb: Callback, err: &Error) -> Self {
        Self::Deliver {
            cb,
            status: Status::from(err),
            data: Vec::new(),
            release: None,
        }
    }
}

enum Algo {
    Tree(Tree),
    Ring(Ring),
}

pub struct Coll {
    pub info: CollInfo,
    algo: Mutex<Algo>,
}

impl Coll {
    pub fn new(info: CollInfo, width: u32) -> Self {
        let algo = match info.ctype {
            CollType::FenceTree => Algo::Tree(Tree::new(&info, width)),
            CollType::FenceRing => Algo::Ring(Ring::new(&info)),
        };
        Self {
            info,
            algo: Mutex::new(algo),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Algo> {
        self.algo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seq(&self) -> u32 {
        match &*self.lock() {
            Algo::Tree(tree) => tree.seq(),
            Algo::Ring(ring) => ring.seq(),
        }
    }

    pub fn tree_state(&self) -> Option<TreeState> {
        match &*self.lock() {
            Algo::Tree(tree) => Some(tree.state()),
            Algo::Ring(_) => None,
        }
    }

    /// Forwards made by the last finished ring round.
    pub fn ring_forwarded(&self) -> Option<u32> {
        match &*self.lock() {
            Algo::Tree(_) => None,
            Algo::Ring(ring) => Some(ring.last_forwarded()),
        }
    }

    /// This node's contribution.
    pub fn local(self: &Arc<Self>, step: &Arc<Step>, data: &[u8], cb: Callback) {
        let actions = match &mut *self.lock() {
            Algo::Tree(tree) => tree.local(&self.info, data, cb),
            Algo::Ring(ring) => ring.local(&self.info, data, cb),
        };
        self.execute(step, actions);
    }

    /// A frame from peer `from`; `body` follows the collective key.
    pub fn remote(self: &Arc<Self>, step: &Arc<Step>, mtype: MsgType, from: u32, seq: u32, body: &[u8]) {
        let mut algo = self.lock();
        let current = match &*algo {
            Algo::Tree(tree) => tree.seq(),
            Algo::Ring(ring) => ring.seq(),
        };
        match check_seq(current, seq) {
            SeqCheck::Progress => {}
            SeqCheck::Skip => {
                log::debug!("{:?}: dropping retransmit of round {} from peer {}", self.info.ctype, seq, from);
                return;
            }
            SeqCheck::Failure => {
                let err = Error::ProtocolViolation(format!(
                    "{:?} frame of round {} from peer {} during round {}",
                    mtype, seq, from, current
                ));
                let actions = match &mut *algo {
                    Algo::Tree(tree) => tree.fail(err),
                    Algo::Ring(ring) => ring.fail(err),
                };
                drop(algo);
                return self.execute(step, actions);
            }
        }

        let result = match (&mut *algo, mtype) {
            (Algo::Tree(tree), MsgType::FanIn) => tree.child(&self.info, from, seq, body),
            (Algo::Tree(tree), MsgType::FanOut) => tree.parent(&self.info, from, seq, body),
            (Algo::Ring(ring), MsgType::Ring) => ring.remote(&self.info, from, seq, body),
            (_, mtype) => Err(Error::ProtocolViolation(format!(
                "{:?} frame for a {:?} collective",
                mtype, self.info.ctype
            ))),
        };
        drop(algo);
        match result {
            Ok(actions) => self.execute(step, actions),
            Err(err) => log::warn!("{:?}: dropping frame from peer {}: {}", self.info.ctype, from, err),
        }
    }

    pub fn complete(self: &Arc<Self>, step: &Arc<Step>, c: Completion, result: Result<()>) {
        let actions = match &mut *self.lock() {
            Algo::Tree(tree) => tree.complete(&self.info, c, result),
            Algo::Ring(ring) => ring.complete(&self.info, c, result),
        };
        self.execute(step, actions);
    }

    /// Gives up on a round older than `timeout`.
    pub fn reset_if_timeout(self: &Arc<Self>, step: &Arc<Step>, now: Instant) {
        let timeout = step.config.timeout;
        let actions = match &mut *self.lock() {
            Algo::Tree(tree) => tree.reset_if_timeout(now, timeout),
            Algo::Ring(ring) => ring.reset_if_timeout(now, timeout),
        };
        self.execute(step, actions);
    }

    fn execute(self: &Arc<Self>, step: &Arc<Step>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send {
                    ep,
                    mtype,
                    seq,
                    buf,
                    done,
                } => {
                    let done = done.map(|c| -> SendDone {
                        let (coll, step) = (self.clone(), step.clone());
                        Box::new(move |result| coll.complete(&step, c, result))
                    });
                    server::send_nb(step, ep, mtype, seq, buf, done);
                }
                Action::Deliver {
                    cb,
                    status,
                    data,
                    release,
                } => {
                    let data = match release {
                        Some(c) => {
                            let (coll, step) = (self.clone(), step.clone());
                            ModexData::with_release(data, move || coll.complete(&step, c, Ok(())))
                        }
                        None => ModexData::new(data),
                    };
                    cb(status, data);
                }
                Action::Fatal(err) => step.fatal(&err),
            }
        }
    }
}

#[derive(Default)]
pub struct CollList {
    colls: Mutex<Vec<Arc<Coll>>>,
}

impl CollList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Coll>>> {
        self.colls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn find(&self, ctype: CollType, procs: &[Proc]) -> Option<Arc<Coll>> {
        let mut procs = procs.to_vec();
        procs.sort();
        self.lock()
            .iter()
            .find(|c| c.info.ctype == ctype && c.info.procs == procs)
            .cloned()
    }

    /// Looks the collective up, creating it on first use.
    pub fn get(&self, step: &Step, ctype: CollType, procs: &[Proc]) -> Result<Arc<Coll>> {
        let mut procs = procs.to_vec();
        procs.sort();
        procs.dedup();

        let mut colls = self.lock();
        if let Some(coll) = colls.iter().find(|c| c.info.ctype == ctype && c.info.procs == procs) {
            return Ok(coll.clone());
        }

        if !step.nspaces.belongs_local(&procs) {
            return Err(Error::BadParam(format!(
                "no local process takes part in {:?} collective over {} procs",
                ctype,
                procs.len()
            )));
        }
        let peers = step.nspaces.rankhosts(&procs)?;
        let nodes = peers
            .iter()
            .map(|host| {
                step.job
                    .nodeid_of(host)
                    .ok_or_else(|| Error::BadParam(format!("host {} is not part of the step", host)))
            })
            .collect::<Result<Vec<u32>>>()?;
        let me = nodes
            .iter()
            .position(|&n| n == step.job.nodeid)
            .ok_or_else(|| Error::Internal("local node missing from the collective".into()))?
            as u32;

        log::debug!(
            "new {:?} collective: {} procs on {} nodes, peer id {}",
            ctype,
            procs.len(),
            peers.len(),
            me
        );
        let coll = Arc::new(Coll::new(
            CollInfo {
                ctype,
                procs,
                peers,
                nodes,
                me,
                direct: step.dconn.enabled(),
            },
            step.config.tree_width,
        ));
        colls.push(coll.clone());
        Ok(coll)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timer sweep over all collectives.
    pub fn cleanup(&self, step: &Arc<Step>) {
        let now = Instant::now();
        let colls = self.lock().clone();
        for coll in colls {
            coll.reset_if_timeout(step, now);
        }
    }
}

/// Entry point for `FanIn`, `FanOut` and `Ring` frames.
pub fn handle_frame(step: &Arc<Step>, hdr: &BaseHeader, mtype: MsgType, body: &[u8]) {
    let mut rd = Reader::new(body);
    let (ctype, procs) = match unpack_key(&mut rd) {
        Ok(key) => key,
        Err(err) => {
            log::warn!("dropping {:?} frame from node {}: bad key: {}", mtype, hdr.nodeid, err);
            return;
        }
    };
    let expected = match mtype {
        MsgType::Ring => CollType::FenceRing,
        _ => CollType::FenceTree,
    };
    if ctype != expected {
        log::warn!("dropping {:?} frame from node {} for a {:?} collective", mtype, hdr.nodeid, ctype);
        return;
    }
    let coll = match step.colls.get(step, ctype, &procs) {
        Ok(coll) => coll,
        Err(err) => {
            log::warn!("dropping {:?} frame from node {}: {}", mtype, hdr.nodeid, err);
            return;
        }
    };
    let Some(from) = coll.info.peer_of(hdr.nodeid) else {
        log::warn!("dropping {:?} frame from node {}: not a participant", mtype, hdr.nodeid);
        return;
    };
    coll.remote(step, mtype, from, hdr.seq, rd.rest());
}

#[cfg(test)]
mod test {
    use crate::coll::*;

    #[test]
    fn key_layout() {
        let procs = vec![Proc::new("ns", 1), Proc::wildcard("other")];
        let mut buf = ServerBuf::new();
        pack_key(&mut buf, CollType::FenceRing, &procs);
        let raw = buf.payload();
        assert_eq!(&raw[..8], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&raw[8..14], &[0, 0, 0, 2, b'n', b's']);

        let mut rd = Reader::new(raw);
        assert_eq!(unpack_key(&mut rd).unwrap(), (CollType::FenceRing, procs));
        assert!(rd.rest().is_empty());
        assert!(unpack_key(&mut Reader::new(&raw[..10])).is_err());
        assert!(unpack_key(&mut Reader::new(&[0, 0, 0, 9, 0, 0, 0, 0])).is_err());
    }
}
