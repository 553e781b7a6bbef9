//! Ring fence: every contribution travels once around the ring, each node
//! passing on what it received from its predecessor until the chunk reaches
//! the node right before its origin.
//!
//! Two rounds can overlap, so state lives in a small array of contexts keyed
//! by round number.

use crate::coll::topo::ring_neighbors;
use crate::coll::{Action, CollInfo, Completion};
use crate::error::{Error, Result, Status};
use crate::libpmix::Callback;
use crate::proto::{MsgType, Reader, ServerBuf};
use crate::server::Endpoint;
use std::ops::Range;
use std::time::{Duration, Instant};
use stepio::Pool;

const CTX_COUNT: usize = 2;

/// Bytes of the ring header after its length field.
const RING_HDR_LEN: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Sync,
    Progress,
    /// All contributions are in; waiting for our forwards to complete.
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingHeader {
    /// Sender.
    pub nodeid: u32,
    pub msgsize: u32,
    pub seq: u32,
    /// Hops the contribution made before reaching the sender's successor.
    pub hop_seq: u32,
    /// Peer id of the contribution's origin.
    pub contrib_id: u32,
}

impl RingHeader {
    pub fn pack(&self, buf: &mut ServerBuf) {
        buf.put_u32(RING_HDR_LEN);
        buf.put_u32(self.nodeid);
        buf.put_u32(self.msgsize);
        buf.put_u32(self.seq);
        buf.put_u32(self.hop_seq);
        buf.put_u32(self.contrib_id);
    }

    pub fn unpack(rd: &mut Reader) -> Result<Self> {
        let len = rd.get_u32()?;
        if len != RING_HDR_LEN {
            return Err(Error::ProtocolViolation(format!("ring header of {} bytes", len)));
        }
        Ok(Self {
            nodeid: rd.get_u32()?,
            msgsize: rd.get_u32()?,
            seq: rd.get_u32()?,
            hop_seq: rd.get_u32()?,
            contrib_id: rd.get_u32()?,
        })
    }
}

struct RingCtx {
    in_use: bool,
    gen: u64,
    seq: u32,
    state: RingState,
    ts: Instant,
    contrib_local: bool,
    contrib_prev: u32,
    forward_cnt: u32,
    contrib_map: Vec<bool>,
    chunks: Vec<Option<Range<usize>>>,
    buf: Vec<u8>,
    cb: Option<Callback>,
}

impl RingCtx {
    fn new(n: u32) -> Self {
        Self {
            in_use: false,
            gen: 0,
            seq: 0,
            state: RingState::Sync,
            ts: Instant::now(),
            contrib_local: false,
            contrib_prev: 0,
            forward_cnt: 0,
            contrib_map: vec![false; n as usize],
            chunks: vec![None; n as usize],
            buf: Vec::new(),
            cb: None,
        }
    }

    /// Contributions concatenated in peer id order.
    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len());
        for chunk in self.chunks.iter().flatten() {
            out.extend_from_slice(&self.buf[chunk.clone()]);
        }
        out
    }
}

pub struct Ring {
    seq: u32,
    n: u32,
    me: u32,
    prev: u32,
    next: u32,
    ctxs: Vec<RingCtx>,
    last_forwarded: u32,
    bufs: Pool<Vec<u8>>,
}

impl Ring {
    pub fn new(info: &CollInfo) -> Self {
        let n = info.size();
        let (prev, next) = ring_neighbors(info.me, n);
        log::debug!("ring fence: peer {} of {}, prev {}, next {}", info.me, n, prev, next);
        Self {
            seq: 0,
            n,
            me: info.me,
            prev,
            next,
            ctxs: (0..CTX_COUNT).map(|_| RingCtx::new(n)).collect(),
            last_forwarded: 0,
            bufs: Pool::new(CTX_COUNT),
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn last_forwarded(&self) -> u32 {
        self.last_forwarded
    }

    fn claim(&mut self, idx: usize, seq: u32) {
        let ctx = &mut self.ctxs[idx];
        ctx.in_use = true;
        ctx.seq = seq;
        ctx.ts = Instant::now();
        ctx.buf = self.bufs.take_or_else(Vec::new);
    }

    fn release(&mut self, idx: usize) {
        let ctx = &mut self.ctxs[idx];
        ctx.in_use = false;
        ctx.gen += 1;
        ctx.state = RingState::Sync;
        ctx.contrib_local = false;
        ctx.contrib_prev = 0;
        ctx.forward_cnt = 0;
        ctx.contrib_map.iter_mut().for_each(|c| *c = false);
        ctx.chunks.iter_mut().for_each(|c| *c = None);
        ctx.cb = None;
        let mut buf = std::mem::take(&mut ctx.buf);
        buf.clear();
        self.bufs.put(buf);
    }

    /// Context of round `seq`, claiming a free one if needed.
    fn ctx_select(&mut self, seq: u32) -> Option<usize> {
        if let Some(idx) = self.ctxs.iter().position(|c| c.in_use && c.seq == seq) {
            return Some(idx);
        }
        let idx = self.ctxs.iter().position(|c| !c.in_use)?;
        self.claim(idx, seq);
        Some(idx)
    }

    /// Context for the next local contribution. Finalizing contexts only
    /// wait for their forwards, so their rounds are already over for us.
    fn ctx_new(&mut self) -> Option<usize> {
        let mut seq = self.seq;
        let mut found = None;
        let mut free = None;
        for (idx, ctx) in self.ctxs.iter().enumerate() {
            if !ctx.in_use {
                free = Some(idx);
                continue;
            }
            match ctx.state {
                RingState::Finalize => seq = seq.wrapping_add(1),
                RingState::Sync | RingState::Progress => {
                    if found.is_none() && !ctx.contrib_local {
                        found = Some(idx);
                    }
                }
            }
        }
        if found.is_none() {
            let idx = free?;
            self.claim(idx, seq);
            found = Some(idx);
        }
        found
    }

    fn contrib(&mut self, info: &CollInfo, idx: usize, contrib_id: u32, hop: u32, data: &[u8], actions: &mut Vec<Action>) {
        let ctx = &mut self.ctxs[idx];
        let start = ctx.buf.len();
        ctx.buf.extend_from_slice(data);
        ctx.chunks[contrib_id as usize] = Some(start..ctx.buf.len());
        ctx.contrib_map[contrib_id as usize] = true;

        if contrib_id != self.next {
            let mut buf = info.key_buf(data.len() + 24);
            RingHeader {
                nodeid: info.node(self.me),
                msgsize: data.len() as u32,
                seq: ctx.seq,
                hop_seq: hop,
                contrib_id,
            }
            .pack(&mut buf);
            buf.put_raw(data);
            actions.push(Action::Send {
                ep: Endpoint::NodeId(info.node(self.next)),
                mtype: MsgType::Ring,
                seq: ctx.seq,
                buf,
                done: Some(Completion::RingForward { ctx: idx, gen: ctx.gen }),
            });
        }
    }

    fn progress(&mut self, idx: usize, actions: &mut Vec<Action>) {
        loop {
            let ctx = &mut self.ctxs[idx];
            match ctx.state {
                RingState::Sync => {
                    if !ctx.contrib_local && ctx.contrib_prev == 0 {
                        return;
                    }
                    ctx.state = RingState::Progress;
                }
                RingState::Progress => {
                    if ctx.contrib_prev + u32::from(ctx.contrib_local) != self.n {
                        return;
                    }
                    ctx.state = RingState::Finalize;
                    log::debug!("ring fence round {}: all {} contributions in", ctx.seq, self.n);
                    if let Some(cb) = ctx.cb.take() {
                        actions.push(Action::Deliver {
                            cb,
                            status: Status::Success,
                            data: ctx.assemble(),
                            release: None,
                        });
                    }
                }
                RingState::Finalize => {
                    if ctx.forward_cnt != self.n - 1 {
                        return;
                    }
                    log::debug!("ring fence round {} complete", ctx.seq);
                    self.last_forwarded = ctx.forward_cnt;
                    self.seq = self.seq.wrapping_add(1);
                    self.release(idx);
                    return;
                }
            }
        }
    }

    pub fn local(&mut self, info: &CollInfo, data: &[u8], cb: Callback) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(idx) = self.ctx_new() else {
            let err = Error::Internal("no free ring context".into());
            log::error!("ring fence round {}: {}", self.seq, err);
            actions.push(Action::fail(cb, &err));
            return actions;
        };
        let me = self.me;
        self.contrib(info, idx, me, 0, data, &mut actions);
        let ctx = &mut self.ctxs[idx];
        ctx.contrib_local = true;
        ctx.cb = Some(cb);
        self.progress(idx, &mut actions);
        actions
    }

    /// A contribution passed on by our predecessor `from`.
    pub fn remote(&mut self, info: &CollInfo, from: u32, seq: u32, body: &[u8]) -> Result<Vec<Action>> {
        let mut rd = Reader::new(body);
        let hdr = RingHeader::unpack(&mut rd)?;
        if hdr.seq != seq {
            return Err(Error::ProtocolViolation(format!(
                "ring header of round {} in a frame of round {}",
                hdr.seq, seq
            )));
        }
        let data = rd.rest();
        if data.len() != hdr.msgsize as usize {
            return Err(Error::ProtocolViolation(format!(
                "ring header announces {} bytes, frame carries {}",
                hdr.msgsize,
                data.len()
            )));
        }
        if from != self.prev || info.peer_of(hdr.nodeid) != Some(self.prev) {
            return Err(Error::ProtocolViolation(format!(
                "ring frame from peer {}, expected our predecessor {}",
                from, self.prev
            )));
        }
        if hdr.contrib_id >= self.n {
            return Err(Error::ProtocolViolation(format!("contribution of peer {}", hdr.contrib_id)));
        }
        let expect_hop = ((self.me + self.n - hdr.contrib_id) % self.n).wrapping_sub(1);
        if hdr.hop_seq != expect_hop {
            return Err(Error::ProtocolViolation(format!(
                "contribution of peer {} after {} hops, expected {}",
                hdr.contrib_id, hdr.hop_seq, expect_hop
            )));
        }

        let idx = self
            .ctx_select(hdr.seq)
            .ok_or_else(|| Error::Internal(format!("no free ring context for round {}", hdr.seq)))?;
        if self.ctxs[idx].contrib_map[hdr.contrib_id as usize] {
            log::debug!(
                "ring fence round {}: duplicate contribution of peer {}",
                hdr.seq,
                hdr.contrib_id
            );
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        self.contrib(info, idx, hdr.contrib_id, hdr.hop_seq + 1, data, &mut actions);
        self.ctxs[idx].contrib_prev += 1;
        self.progress(idx, &mut actions);
        Ok(actions)
    }

    pub fn complete(&mut self, _info: &CollInfo, c: Completion, result: Result<()>) -> Vec<Action> {
        let mut actions = Vec::new();
        let Completion::RingForward { ctx: idx, gen } = c else {
            return actions;
        };
        let Some(ctx) = self.ctxs.get_mut(idx) else {
            return actions;
        };
        if !ctx.in_use || ctx.gen != gen {
            log::debug!("ring fence: stale forward completion");
            return actions;
        }
        match result {
            Ok(()) => {
                ctx.forward_cnt += 1;
                self.progress(idx, &mut actions);
            }
            Err(err) => {
                log::error!("ring fence round {}: forward failed: {}", ctx.seq, err);
                if let Some(cb) = ctx.cb.take() {
                    actions.push(Action::fail(cb, &err));
                }
                self.release(idx);
                actions.push(Action::Fatal(err));
            }
        }
        actions
    }

    pub fn reset_if_timeout(&mut self, now: Instant, timeout: Duration) -> Vec<Action> {
        let mut actions = Vec::new();
        for idx in 0..self.ctxs.len() {
            let ctx = &mut self.ctxs[idx];
            if !ctx.in_use || now.saturating_duration_since(ctx.ts) <= timeout {
                continue;
            }
            log::error!(
                "ring fence round {} timed out in {:?} with {} contributions",
                ctx.seq,
                ctx.state,
                ctx.contrib_prev + u32::from(ctx.contrib_local)
            );
            if let Some(cb) = ctx.cb.take() {
                actions.push(Action::fail(cb, &Error::Timeout));
            }
            self.release(idx);
        }
        actions
    }

    pub fn fail(&mut self, err: Error) -> Vec<Action> {
        log::error!("ring fence round {} failed: {}", self.seq, err);
        let mut actions = Vec::new();
        for idx in 0..self.ctxs.len() {
            if !self.ctxs[idx].in_use {
                continue;
            }
            if let Some(cb) = self.ctxs[idx].cb.take() {
                actions.push(Action::fail(cb, &err));
            }
            self.release(idx);
        }
        self.seq = self.seq.wrapping_add(1);
        actions.push(Action::Fatal(err));
        actions
    }
}

#[cfg(test)]
mod test {
    use crate::coll::ring::*;
    use crate::coll::CollType;
    use crate::libpmix::ModexData;
    use crate::nspace::Proc;
    use std::sync::mpsc;

    fn info(me: u32, n: u32) -> CollInfo {
        CollInfo {
            ctype: CollType::FenceRing,
            procs: vec![Proc::wildcard("ns")],
            peers: (0..n).map(|i| format!("n{}", i)).collect(),
            nodes: (0..n).collect(),
            me,
            direct: false,
        }
    }

    struct Sent {
        to: u32,
        body: Vec<u8>,
        done: Completion,
    }

    /// Runs deliveries; returns sends with the key stripped.
    fn run(actions: Vec<Action>) -> Vec<Sent> {
        let mut sent = Vec::new();
        for action in actions {
            match action {
                Action::Send {
                    ep: Endpoint::NodeId(to),
                    buf,
                    done,
                    ..
                } => {
                    let mut rd = Reader::new(buf.payload());
                    crate::coll::unpack_key(&mut rd).unwrap();
                    sent.push(Sent {
                        to,
                        body: rd.rest().to_vec(),
                        done: done.unwrap(),
                    });
                }
                Action::Send { .. } => panic!("ring frames go to one node"),
                Action::Deliver { cb, status, data, .. } => cb(status, ModexData::new(data)),
                Action::Fatal(err) => panic!("unexpected fatal: {}", err),
            }
        }
        sent
    }

    fn callback() -> (Callback, mpsc::Receiver<(Status, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let cb: Callback = Box::new(move |status, data: ModexData| {
            let _ = tx.send((status, data.to_vec()));
        });
        (cb, rx)
    }

    #[test]
    fn three_nodes_in_lockstep() {
        let infos: Vec<CollInfo> = (0..3).map(|me| info(me, 3)).collect();
        let mut rings: Vec<Ring> = infos.iter().map(Ring::new).collect();
        let contribs: [&[u8]; 3] = [b"xx", b"yyyy", b"z"];
        let mut rxs = Vec::new();
        let mut queue = Vec::new();

        for me in 0..3 {
            let (cb, rx) = callback();
            rxs.push(rx);
            for sent in run(rings[me].local(&infos[me], contribs[me], cb)) {
                queue.push((me as u32, sent));
            }
        }
        while let Some((from, sent)) = queue.pop() {
            let to = sent.to as usize;
            for next in run(rings[to].remote(&infos[to], from, 0, &sent.body).unwrap()) {
                queue.push((to as u32, next));
            }
            for done in run(rings[from as usize].complete(&infos[from as usize], sent.done, Ok(()))) {
                queue.push((from, done));
            }
        }

        for (me, rx) in rxs.iter().enumerate() {
            assert_eq!(rx.recv().unwrap(), (Status::Success, b"xxyyyyz".to_vec()));
            assert_eq!(rings[me].seq(), 1);
            assert_eq!(rings[me].last_forwarded(), 2);
            assert!(rings[me].ctxs.iter().all(|c| !c.in_use));
        }
    }

    #[test]
    fn single_node() {
        let info = info(0, 1);
        let mut ring = Ring::new(&info);
        let (cb, rx) = callback();
        assert!(run(ring.local(&info, b"solo", cb)).is_empty());
        assert_eq!(rx.recv().unwrap().1, b"solo".to_vec());
        assert_eq!(ring.seq(), 1);
    }

    #[test]
    fn wrong_hop_is_dropped() {
        let info = info(1, 3);
        let mut ring = Ring::new(&info);
        let mut buf = ServerBuf::new();
        // peer 2's chunk cannot reach peer 1 from peer 0 after zero hops
        RingHeader {
            nodeid: 0,
            msgsize: 1,
            seq: 0,
            hop_seq: 0,
            contrib_id: 2,
        }
        .pack(&mut buf);
        buf.put_raw(b"q");
        assert!(ring.remote(&info, 0, 0, buf.payload()).is_err());
        // and nobody but the predecessor may send
        assert!(ring.remote(&info, 2, 0, buf.payload()).is_err());
        assert!(ring.ctxs.iter().all(|c| !c.in_use));
    }

    fn frame(nodeid: u32, seq: u32, hop_seq: u32, contrib_id: u32, data: &[u8]) -> ServerBuf {
        let mut buf = ServerBuf::new();
        RingHeader {
            nodeid,
            msgsize: data.len() as u32,
            seq,
            hop_seq,
            contrib_id,
        }
        .pack(&mut buf);
        buf.put_raw(data);
        buf
    }

    #[test]
    fn duplicate_contribution_is_ignored() {
        let info = info(1, 3);
        let mut ring = Ring::new(&info);
        let (cb, rx) = callback();
        let mut sent = run(ring.local(&info, b"b", cb));

        let first = frame(0, 0, 0, 0, b"a");
        sent.extend(run(ring.remote(&info, 0, 0, first.payload()).unwrap()));
        assert_eq!(sent.len(), 2);
        assert!(ring.remote(&info, 0, 0, first.payload()).unwrap().is_empty());
        let ctx = ring.ctxs.iter().find(|c| c.in_use).unwrap();
        assert_eq!((ctx.state, ctx.contrib_prev), (RingState::Progress, 1));

        let last = frame(0, 0, 1, 2, b"c");
        assert!(run(ring.remote(&info, 0, 0, last.payload()).unwrap()).is_empty());
        assert_eq!(rx.recv().unwrap(), (Status::Success, b"abc".to_vec()));

        // still finalizing: a replay is dropped, not delivered again
        assert!(ring.remote(&info, 0, 0, first.payload()).unwrap().is_empty());
        for s in sent {
            run(ring.complete(&info, s.done, Ok(())));
        }
        assert_eq!(ring.seq(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ring_header_must_match_frame_round() {
        let info = info(1, 3);
        let mut ring = Ring::new(&info);
        let buf = frame(0, 0, 0, 0, b"a");
        assert!(matches!(
            ring.remote(&info, 0, 1, buf.payload()),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(ring.ctxs.iter().all(|c| !c.in_use));
    }

    #[test]
    fn next_round_uses_second_context() {
        let info = info(0, 2);
        let mut ring = Ring::new(&info);
        let (cb, rx) = callback();
        let sent = run(ring.local(&info, b"a", cb));
        assert_eq!(sent.len(), 1);

        let mut buf = ServerBuf::new();
        RingHeader {
            nodeid: 1,
            msgsize: 1,
            seq: 0,
            hop_seq: 0,
            contrib_id: 1,
        }
        .pack(&mut buf);
        buf.put_raw(b"b");
        assert!(run(ring.remote(&info, 1, 0, buf.payload()).unwrap()).is_empty());
        assert_eq!(rx.recv().unwrap().1, b"ab".to_vec());

        // round 0 still waits for its forward, round 1 starts next to it
        let (cb, _rx) = callback();
        run(ring.local(&info, b"c", cb));
        assert_eq!(ring.ctxs.iter().filter(|c| c.in_use).count(), 2);
        assert!(ring.ctxs.iter().any(|c| c.in_use && c.seq == 1));

        run(ring.complete(&info, sent[0].done, Ok(())));
        assert_eq!(ring.seq(), 1);
        assert_eq!(ring.ctxs.iter().filter(|c| c.in_use).count(), 1);
    }

    #[test]
    fn timeout_resets_context() {
        let info = info(0, 2);
        let mut ring = Ring::new(&info);
        let (cb, rx) = callback();
        run(ring.local(&info, b"a", cb));
        let later = Instant::now() + Duration::from_secs(10);
        run(ring.reset_if_timeout(later, Duration::from_secs(5)));
        assert_eq!(rx.recv().unwrap().0, Status::Timeout);
        assert_eq!(ring.seq(), 0);
        assert!(ring.ctxs.iter().all(|c| !c.in_use));
    }
}
