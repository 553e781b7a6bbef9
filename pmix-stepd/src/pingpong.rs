//! Ping-pong round trips between agents, for measuring the server transport.

use crate::proto::{BaseHeader, MsgType, Reader, ServerBuf};
use crate::server::{self, Endpoint};
use crate::step::Step;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const PING: u8 = 0;
const PONG: u8 = 1;

pub struct PingPong {
    enabled: bool,
    sent: AtomicU32,
    pongs: AtomicU32,
}

impl PingPong {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sent: AtomicU32::new(0),
            pongs: AtomicU32::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Pongs received so far.
    pub fn pongs(&self) -> u32 {
        self.pongs.load(Ordering::SeqCst)
    }
}

fn message(kind: u8, counter: u32, size: usize) -> ServerBuf {
    let mut buf = ServerBuf::with_capacity(size + 5);
    buf.put_u8(kind);
    buf.put_u32(counter);
    buf.put_raw(&vec![0u8; size]);
    buf
}

/// Sends a ping carrying `size` filler bytes to `nodeid`.
pub fn ping(step: &Arc<Step>, nodeid: u32, size: usize) {
    if !step.pingpong.enabled() {
        log::debug!("ping-pong is disabled");
        return;
    }
    let counter = step.pingpong.sent.fetch_add(1, Ordering::SeqCst);
    log::debug!("ping {} ({} bytes) to node {}", counter, size, nodeid);
    server::send_nb(
        step,
        Endpoint::NodeId(nodeid),
        MsgType::PingPong,
        counter,
        message(PING, counter, size),
        Some(Box::new(move |result| {
            if let Err(err) = result {
                log::warn!("ping {} to node {} failed: {}", counter, nodeid, err);
            }
        })),
    );
}

/// Entry point for `PingPong` frames: pings are answered with a pong of the
/// same size.
pub fn handle(step: &Arc<Step>, hdr: &BaseHeader, body: &[u8]) {
    if !step.pingpong.enabled() {
        log::debug!("dropping ping-pong frame from node {}: disabled", hdr.nodeid);
        return;
    }
    let mut rd = Reader::new(body);
    let (kind, counter) = match (rd.get_u8(), rd.get_u32()) {
        (Ok(kind), Ok(counter)) => (kind, counter),
        _ => {
            log::warn!("dropping short ping-pong frame from node {}", hdr.nodeid);
            return;
        }
    };
    match kind {
        PING => {
            let size = rd.rest().len();
            server::send_nb(
                step,
                Endpoint::NodeId(hdr.nodeid),
                MsgType::PingPong,
                counter,
                message(PONG, counter, size),
                None,
            );
        }
        PONG => {
            let pongs = step.pingpong.pongs.fetch_add(1, Ordering::SeqCst) + 1;
            log::debug!("pong {} from node {}, {} so far", counter, hdr.nodeid, pongs);
        }
        _ => log::warn!("dropping ping-pong frame of kind {} from node {}", kind, hdr.nodeid),
    }
}
