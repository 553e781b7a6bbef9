//! Direct connections between step agents.
//!
//! Every peer node has one record. The first frame for a peer travels over
//! the launcher relay with our endpoint attached; once both sides know each
//! other's endpoint the lower node id connects and later frames bypass the
//! relay.

pub mod tcp;

use crate::error::{Error, Result};
use crate::proto::{BaseHeader, Encoding, Engine, MsgType, OutMsg, SendDone, ServerBuf, ServerProto};
use crate::server;
use crate::step::Step;
use std::net::IpAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DconnState {
    Init,
    /// Our endpoint went out; frames queue until the link is up.
    EpSent,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    /// Both ends must take part in establishing the link.
    TwoSided,
    /// Knowing the peer's endpoint is enough to reach it.
    OneSided,
}

/// A point-to-point transport between agents.
pub trait DirectTransport: Send + Sync {
    fn semantics(&self) -> Semantics;

    /// Opaque address peers use to reach us.
    fn endpoint(&self) -> &[u8];

    fn connect(&self, addr: IpAddr, ep: &[u8]) -> Result<OwnedFd>;

    /// Listening fd for the agent's poll loop, if the transport accepts links.
    fn listener(&self) -> Option<RawFd>;

    /// Accepts one pending link without blocking.
    fn accept(&self) -> Result<Option<OwnedFd>>;
}

struct Record {
    state: DconnState,
    engine: Arc<Engine>,
}

pub struct DirectConns {
    recs: Vec<Mutex<Record>>,
    transport: Option<Box<dyn DirectTransport>>,
}

/// What to do after learning a peer's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Connect,
    /// Tell the peer our endpoint so it connects to us.
    Announce,
    Wait,
}

fn decide(state: DconnState, semantics: Semantics, me: u32, peer: u32) -> Decision {
    match (state, semantics) {
        (DconnState::Connected, _) => Decision::Wait,
        (_, Semantics::OneSided) => Decision::Connect,
        (DconnState::Init, Semantics::TwoSided) if peer < me => Decision::Announce,
        (DconnState::Init, Semantics::TwoSided) => Decision::Connect,
        (DconnState::EpSent, Semantics::TwoSided) if peer > me => Decision::Connect,
        (DconnState::EpSent, Semantics::TwoSided) => Decision::Wait,
    }
}

impl DirectConns {
    pub fn new(nnodes: u32, enc: Encoding, transport: Option<Box<dyn DirectTransport>>) -> Self {
        let recs = (0..nnodes)
            .map(|_| {
                Mutex::new(Record {
                    state: DconnState::Init,
                    engine: Arc::new(Engine::new(ServerProto::direct(enc))),
                })
            })
            .collect();
        Self { recs, transport }
    }

    pub fn enabled(&self) -> bool {
        self.transport.is_some()
    }

    fn rec(&self, nodeid: u32) -> Option<MutexGuard<'_, Record>> {
        self.recs
            .get(nodeid as usize)
            .map(|rec| rec.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    pub fn state(&self, nodeid: u32) -> Option<DconnState> {
        self.rec(nodeid).map(|rec| rec.state)
    }

    pub fn endpoint(&self) -> Option<&[u8]> {
        self.transport.as_ref().map(|t| t.endpoint())
    }

    pub fn listener(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(|t| t.listener())
    }

    pub fn accept(&self) -> Result<Option<OwnedFd>> {
        match &self.transport {
            Some(t) => t.accept(),
            None => Ok(None),
        }
    }

    /// Drops every link and fails whatever is still queued on them.
    pub fn fini(&self) {
        for id in 0..self.recs.len() as u32 {
            if let Some(mut rec) = self.rec(id) {
                rec.state = DconnState::Init;
                let engine = rec.engine.clone();
                drop(rec);
                engine.detach();
            }
        }
    }
}

/// Routes a frame to `nodeid`, over the direct link when there is one.
pub fn send(step: &Arc<Step>, nodeid: u32, mtype: MsgType, seq: u32, mut buf: ServerBuf, done: Option<SendDone>) {
    let relay_to = |buf: ServerBuf, ext: Option<&[u8]>| -> Result<()> {
        let host = step.host(nodeid)?.to_string();
        server::relay(step, &[host], mtype, seq, buf, ext)
    };

    let Some(ep) = step.dconn.endpoint().filter(|_| nodeid != step.job.nodeid) else {
        let result = relay_to(buf, None);
        if let Some(done) = done {
            done(result);
        }
        return;
    };

    let Some(mut rec) = step.dconn.rec(nodeid) else {
        if let Some(done) = done {
            done(Err(Error::BadParam(format!("node id {} out of range", nodeid))));
        }
        return;
    };
    match rec.state {
        DconnState::Init => {
            rec.state = DconnState::EpSent;
            drop(rec);
            log::debug!("announcing endpoint to node {} with {:?} frame", nodeid, mtype);
            let result = relay_to(buf, Some(ep));
            if let Some(done) = done {
                done(result);
            }
        }
        DconnState::EpSent | DconnState::Connected => {
            let engine = rec.engine.clone();
            drop(rec);
            buf.finalize(step.enc, mtype, seq, step.job.nodeid, None);
            engine.send_enqueue(OutMsg::new(buf, done));
            if engine.send_pending() && engine.fd().is_some() {
                step.wake();
            }
        }
    }
}

/// Reacts to the endpoint extension found on a relayed frame from `nodeid`.
pub fn on_endpoint(step: &Arc<Step>, nodeid: u32, ep: &[u8]) {
    let Some(transport) = &step.dconn.transport else {
        log::debug!("ignoring endpoint of node {}: direct connections are off", nodeid);
        return;
    };
    if nodeid == step.job.nodeid {
        return;
    }
    let Some(mut rec) = step.dconn.rec(nodeid) else { return };

    match decide(rec.state, transport.semantics(), step.job.nodeid, nodeid) {
        Decision::Wait => {}
        Decision::Announce => {
            rec.state = DconnState::EpSent;
            drop(rec);
            log::debug!("node {} announced itself, answering with our endpoint", nodeid);
            let result = step
                .host(nodeid)
                .map(|host| host.to_string())
                .and_then(|host| {
                    server::relay(step, &[host], MsgType::InitDirect, 0, ServerBuf::new(), Some(transport.endpoint()))
                });
            if let Err(err) = result {
                step.fatal(&err);
            }
        }
        Decision::Connect => {
            drop(rec);
            if let Err(err) = connect(step, nodeid, ep) {
                step.fatal(&err);
            }
        }
    }
}

fn connect(step: &Arc<Step>, nodeid: u32, ep: &[u8]) -> Result<()> {
    let Some(transport) = &step.dconn.transport else {
        return Err(Error::NotSupported);
    };
    let host = step.host(nodeid)?;
    let addr = step.launcher.host_addr(host)?;
    log::debug!("connecting to node {} ({} at {})", nodeid, host, addr);
    let fd = transport.connect(addr, ep)?;

    let mut init = ServerBuf::new();
    init.put_raw(&step.launcher.create_credential());
    init.finalize(step.enc, MsgType::InitDirect, 0, step.job.nodeid, Some(transport.endpoint()));

    let mut rec = step
        .dconn
        .rec(nodeid)
        .ok_or_else(|| Error::BadParam(format!("node id {} out of range", nodeid)))?;
    if rec.state == DconnState::Connected {
        log::debug!("node {} connected to us first, dropping our link", nodeid);
        return Ok(());
    }
    let engine = rec.engine.clone();
    // the greeting has to precede everything queued while waiting
    engine.send_urgent(OutMsg::new(init, None));
    engine.attach(fd)?;
    rec.state = DconnState::Connected;
    drop(rec);

    step.push_conn(nodeid, engine);
    Ok(())
}

/// Adopts a link the peer opened to us. `payload` is the body of its
/// `InitDirect` greeting.
pub fn accept(step: &Arc<Step>, hdr: &BaseHeader, payload: &[u8], fd: OwnedFd) -> Result<()> {
    let (_, cred) = step.enc.split_ext(hdr, payload)?;
    let uid = step
        .launcher
        .verify_credential(cred)
        .ok_or_else(|| Error::ProtocolViolation(format!("bad credential from node {}", hdr.nodeid)))?;
    if uid != step.job.uid {
        return Err(Error::ProtocolViolation(format!(
            "node {} connected as uid {}, step runs as {}",
            hdr.nodeid, uid, step.job.uid
        )));
    }
    if hdr.nodeid == step.job.nodeid {
        return Err(Error::ProtocolViolation("direct link from ourselves".into()));
    }

    let mut rec = step
        .dconn
        .rec(hdr.nodeid)
        .ok_or_else(|| Error::ProtocolViolation(format!("direct link from unknown node {}", hdr.nodeid)))?;
    if rec.state == DconnState::Connected {
        return Err(Error::ProtocolViolation(format!("node {} is already connected", hdr.nodeid)));
    }
    let engine = rec.engine.clone();
    engine.attach(fd)?;
    rec.state = DconnState::Connected;
    drop(rec);

    log::debug!("accepted direct link from node {}", hdr.nodeid);
    step.push_conn(hdr.nodeid, engine);
    Ok(())
}

/// The link to `nodeid` went away; the next frame announces us again.
pub fn disconnect(step: &Step, nodeid: u32) {
    let Some(mut rec) = step.dconn.rec(nodeid) else { return };
    rec.state = DconnState::Init;
    let engine = rec.engine.clone();
    drop(rec);
    log::debug!("direct link to node {} closed", nodeid);
    engine.detach();
}

/// Announces our endpoint to `peers` ahead of the first collective.
pub fn connect_early(step: &Arc<Step>, peers: &[u32]) {
    let Some(ep) = step.dconn.endpoint() else { return };
    for &peer in peers {
        if peer == step.job.nodeid {
            continue;
        }
        let Some(mut rec) = step.dconn.rec(peer) else { continue };
        if rec.state != DconnState::Init {
            continue;
        }
        rec.state = DconnState::EpSent;
        drop(rec);
        let result = step
            .host(peer)
            .map(|host| host.to_string())
            .and_then(|host| server::relay(step, &[host], MsgType::InitDirect, 0, ServerBuf::new(), Some(ep)));
        if let Err(err) = result {
            log::warn!("early connection to node {} failed: {}", peer, err);
            // the peer never heard of us, so the first real frame announces again
            if let Some(mut rec) = step.dconn.rec(peer) {
                if rec.state == DconnState::EpSent {
                    rec.state = DconnState::Init;
                }
            }
        }
    }
}
