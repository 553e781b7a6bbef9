//! Direct modex: fetching one remote process's published data on demand.

use crate::error::{Error, Result, Status};
use crate::libpmix::{Callback, ModexData};
use crate::nspace::Proc;
use crate::proto::{BaseHeader, MsgType, Reader, ServerBuf};
use crate::server::{self, Endpoint};
use crate::step::Step;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmdxMsg {
    Request {
        proc: Proc,
        /// Namespace of the requesting side.
        sender_ns: String,
    },
    Response {
        proc: Proc,
        status: i32,
        data: Vec<u8>,
    },
}

impl DmdxMsg {
    pub fn pack(&self, buf: &mut ServerBuf) {
        match self {
            Self::Request { proc, sender_ns } => {
                buf.put_u8(KIND_REQUEST);
                buf.put_str(&proc.nspace);
                buf.put_u32(proc.rank);
                buf.put_str(sender_ns);
            }
            Self::Response { proc, status, data } => {
                buf.put_u8(KIND_RESPONSE);
                buf.put_str(&proc.nspace);
                buf.put_u32(proc.rank);
                buf.put_i32(*status);
                buf.put_bytes(data);
            }
        }
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        let mut rd = Reader::new(raw);
        let kind = rd.get_u8()?;
        let nspace = rd.get_str()?;
        let proc = Proc::new(nspace, rd.get_u32()?);
        match kind {
            KIND_REQUEST => Ok(Self::Request {
                proc,
                sender_ns: rd.get_str()?,
            }),
            KIND_RESPONSE => Ok(Self::Response {
                proc,
                status: rd.get_i32()?,
                data: rd.get_bytes()?.to_vec(),
            }),
            _ => Err(Error::BadParam(format!("unknown direct modex message kind {}", kind))),
        }
    }
}

struct Tracker {
    seq: u32,
    ts: Instant,
    proc: Proc,
    cb: Callback,
}

/// Outstanding requests of this node, keyed by sequence number.
#[derive(Default)]
pub struct Dmdx {
    pending: Mutex<Vec<Tracker>>,
    next_seq: AtomicU32,
}

impl Dmdx {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Tracker>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn take(&self, seq: u32) -> Option<Tracker> {
        let mut pending = self.lock();
        let idx = pending.iter().position(|t| t.seq == seq)?;
        Some(pending.swap_remove(idx))
    }

    /// Fails every request older than the step timeout.
    pub fn cleanup(&self, step: &Step) {
        let now = Instant::now();
        let timeout = step.config.timeout;
        let expired: Vec<Tracker> = {
            let mut pending = self.lock();
            let (expired, alive) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|t| now.saturating_duration_since(t.ts) > timeout);
            *pending = alive;
            expired
        };
        for tracker in expired {
            log::error!(
                "direct modex request {} for {} timed out after {:?}",
                tracker.seq,
                tracker.proc,
                timeout
            );
            (tracker.cb)(Status::Timeout, ModexData::empty());
        }
    }
}

/// Fetches the modex data of `proc`, locally or from the node hosting it.
pub fn get(step: &Arc<Step>, proc: &Proc, cb: Callback) {
    let nodeid = match step.nspaces.resolve(&proc.nspace, proc.rank) {
        Ok(nodeid) => nodeid,
        Err(err) => {
            log::error!("direct modex for {}: {}", proc, err);
            return cb(Status::from(&err), ModexData::empty());
        }
    };
    if nodeid == step.job.nodeid {
        return step.lib.dmodex_request(proc, cb);
    }

    let seq = step.dmdx.next_seq.fetch_add(1, Ordering::Relaxed);
    step.dmdx.lock().push(Tracker {
        seq,
        ts: Instant::now(),
        proc: proc.clone(),
        cb,
    });

    let mut buf = ServerBuf::new();
    DmdxMsg::Request {
        proc: proc.clone(),
        sender_ns: step.job.nspace.clone(),
    }
    .pack(&mut buf);
    log::debug!("direct modex request {} for {} to node {}", seq, proc, nodeid);

    let step2 = step.clone();
    server::send_nb(
        step,
        Endpoint::NodeId(nodeid),
        MsgType::Dmdx,
        seq,
        buf,
        Some(Box::new(move |result| {
            if let Err(err) = result {
                log::error!("direct modex request {} could not be sent: {}", seq, err);
                if let Some(tracker) = step2.dmdx.take(seq) {
                    (tracker.cb)(Status::CommFailed, ModexData::empty());
                }
            }
        })),
    );
}

fn respond(step: &Arc<Step>, nodeid: u32, seq: u32, proc: Proc, status: Status, data: &[u8]) {
    let mut buf = ServerBuf::with_capacity(data.len() + 64);
    DmdxMsg::Response {
        proc,
        status: status.code(),
        data: data.to_vec(),
    }
    .pack(&mut buf);
    server::send_nb(
        step,
        Endpoint::NodeId(nodeid),
        MsgType::Dmdx,
        seq,
        buf,
        Some(Box::new(move |result| {
            if let Err(err) = result {
                log::error!("direct modex response {} to node {} lost: {}", seq, nodeid, err);
            }
        })),
    );
}

/// Checks that a request is for a process we host.
fn validate(step: &Step, proc: &Proc) -> Result<()> {
    let ns = step
        .nspaces
        .find(&proc.nspace)
        .ok_or_else(|| Error::InvalidNamespace(proc.nspace.clone()))?;
    if ns.resolve(proc.rank)? != step.job.nodeid {
        return Err(Error::BadParam(format!("{} does not run on this node", proc)));
    }
    Ok(())
}

/// Entry point for `Dmdx` frames.
pub fn handle(step: &Arc<Step>, hdr: &BaseHeader, body: &[u8]) {
    let msg = match DmdxMsg::unpack(body) {
        Ok(msg) => msg,
        Err(err) => {
            log::warn!("dropping direct modex frame from node {}: {}", hdr.nodeid, err);
            return;
        }
    };
    match msg {
        DmdxMsg::Request { proc, sender_ns } => {
            log::debug!(
                "direct modex request {} for {} from node {} ({})",
                hdr.seq,
                proc,
                hdr.nodeid,
                sender_ns
            );
            if let Err(err) = validate(step, &proc) {
                log::warn!("direct modex request {} from node {}: {}", hdr.seq, hdr.nodeid, err);
                return respond(step, hdr.nodeid, hdr.seq, proc, Status::from(&err), &[]);
            }
            let (step2, nodeid, seq, target) = (step.clone(), hdr.nodeid, hdr.seq, proc.clone());
            step.lib.dmodex_request(
                &proc,
                Box::new(move |status, data| respond(&step2, nodeid, seq, target, status, &data)),
            );
        }
        DmdxMsg::Response { proc, status, data } => {
            let Some(tracker) = step.dmdx.take(hdr.seq) else {
                log::debug!(
                    "direct modex response {} for {} from node {} has no request, dropping",
                    hdr.seq,
                    proc,
                    hdr.nodeid
                );
                return;
            };
            if tracker.proc != proc {
                log::warn!(
                    "direct modex response {} is for {}, request was for {}",
                    hdr.seq,
                    proc,
                    tracker.proc
                );
            }
            (tracker.cb)(Status::from_code(status), ModexData::new(data));
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dmdx::*;

    #[test]
    fn message_layout() {
        let req = DmdxMsg::Request {
            proc: Proc::new("ns", 7),
            sender_ns: "me".into(),
        };
        let mut buf = ServerBuf::new();
        req.pack(&mut buf);
        assert_eq!(buf.payload()[0], KIND_REQUEST);
        assert_eq!(DmdxMsg::unpack(buf.payload()).unwrap(), req);

        let resp = DmdxMsg::Response {
            proc: Proc::new("ns", 7),
            status: Status::InvalidNamespace.code(),
            data: Vec::new(),
        };
        let mut buf = ServerBuf::new();
        resp.pack(&mut buf);
        assert_eq!(DmdxMsg::unpack(buf.payload()).unwrap(), resp);

        assert!(DmdxMsg::unpack(&[3, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(DmdxMsg::unpack(&buf.payload()[..buf.payload().len() - 1]).is_err());
    }
}
