//! Server message layer: framing, routing and dispatch of inter-node frames.

use crate::error::{Error, Result};
use crate::proto::{BaseHeader, MsgType, SendDone, ServerBuf};
use crate::step::Step;
use crate::{coll, dconn, dmdx, pingpong};
use std::sync::Arc;

/// Where a frame goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Broadcast through the launcher's forwarder.
    HostList(Vec<String>),
    /// A single step node, possibly over a direct connection.
    NodeId(u32),
}

/// Outcome of comparing a frame's sequence number with the collective's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    Progress,
    /// A retransmit of the previous round.
    Skip,
    Failure,
}

pub fn check_seq(current: u32, seq: u32) -> SeqCheck {
    if seq == current || seq == current.wrapping_add(1) {
        SeqCheck::Progress
    } else if seq == current.wrapping_sub(1) {
        SeqCheck::Skip
    } else {
        SeqCheck::Failure
    }
}

/// Queues `buf` for `ep`. `done` runs exactly once, after the frame left or
/// could not be sent.
pub fn send_nb(
    step: &Arc<Step>,
    ep: Endpoint,
    mtype: MsgType,
    seq: u32,
    buf: ServerBuf,
    done: Option<SendDone>,
) {
    log::trace!("send_nb(ep: {:?}, type: {:?}, seq: {}, size: {})", ep, mtype, seq, buf.payload().len());
    match ep {
        Endpoint::HostList(hosts) => {
            let result = relay(step, &hosts, mtype, seq, buf, None);
            if let Some(done) = done {
                done(result);
            }
        }
        Endpoint::NodeId(nodeid) => dconn::send(step, nodeid, mtype, seq, buf, done),
    }
}

/// Sends through the launcher's forwarding RPC, stamping the header first.
pub fn relay(
    step: &Step,
    hosts: &[String],
    mtype: MsgType,
    seq: u32,
    mut buf: ServerBuf,
    ext: Option<&[u8]>,
) -> Result<()> {
    if hosts.is_empty() {
        return Ok(());
    }
    buf.finalize(step.enc, mtype, seq, step.job.nodeid, ext);
    stepd_send(step, hosts, buf.frame())
}

/// Forwarding with capped exponential backoff between attempts.
pub fn stepd_send(step: &Step, hosts: &[String], data: &[u8]) -> Result<()> {
    let addr = step.job.server_addr();
    let retry = step.config.retry;
    let attempts = retry.retries.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        match step.launcher.forward(hosts, &addr, data) {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::debug!(
                    "stepd_send(hosts: {:?}, attempt: {}/{}): {}",
                    hosts,
                    attempt + 1,
                    attempts,
                    err
                );
                last = Some(err);
            }
        }
        if attempt + 1 < attempts {
            std::thread::sleep(retry.delay(attempt));
        }
    }

    let err = last.map_or_else(|| "no attempt made".to_string(), |err| err.to_string());
    log::error!("send to {:?} failed after {} attempts: {}", hosts, attempts, err);
    Err(Error::CommFailed(err))
}

/// Routes a received frame to its handler. Malformed frames are dropped.
pub fn dispatch(step: &Arc<Step>, hdr: BaseHeader, payload: Vec<u8>) {
    let mtype = match hdr.msg_type() {
        Ok(mtype) => mtype,
        Err(err) => {
            log::warn!("dropping frame from node {}: {}", hdr.nodeid, err);
            return;
        }
    };
    if hdr.nodeid >= step.job.nnodes {
        log::warn!("dropping {:?} frame from unknown node {}", mtype, hdr.nodeid);
        return;
    }
    let (ext, body) = match step.enc.split_ext(&hdr, &payload) {
        Ok(split) => split,
        Err(err) => {
            log::warn!("dropping {:?} frame from node {}: {}", mtype, hdr.nodeid, err);
            return;
        }
    };
    log::trace!(
        "dispatch(type: {:?}, seq: {}, node: {}, size: {}, ext: {})",
        mtype,
        hdr.seq,
        hdr.nodeid,
        body.len(),
        ext.is_some()
    );

    if let Some(ep) = ext {
        dconn::on_endpoint(step, hdr.nodeid, ep);
    }

    match mtype {
        MsgType::FanIn | MsgType::FanOut | MsgType::Ring => coll::handle_frame(step, &hdr, mtype, body),
        MsgType::Dmdx => dmdx::handle(step, &hdr, body),
        MsgType::InitDirect => {
            log::debug!("endpoint announcement from node {}", hdr.nodeid);
        }
        MsgType::PingPong => pingpong::handle(step, &hdr, body),
    }
}

#[cfg(test)]
mod test {
    use crate::server::*;

    #[test]
    fn sequence_window() {
        assert_eq!(check_seq(5, 5), SeqCheck::Progress);
        assert_eq!(check_seq(5, 6), SeqCheck::Progress);
        assert_eq!(check_seq(5, 4), SeqCheck::Skip);
        assert_eq!(check_seq(5, 7), SeqCheck::Failure);
        assert_eq!(check_seq(5, 3), SeqCheck::Failure);
        assert_eq!(check_seq(0, u32::MAX), SeqCheck::Skip);
        assert_eq!(check_seq(u32::MAX, 0), SeqCheck::Progress);
    }
}
