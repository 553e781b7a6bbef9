//! Framed-message transceiver bound to one file descriptor.
//!
//! Receiving and sending are independent pipelines. The receive side is only
//! ever driven from the poll loop that owns the fd; the send side may be fed
//! from any thread and is serialized by its own mutex. Completion callbacks
//! run after that mutex is released so they are free to enqueue again.

use crate::{read_buf, writev_buf, Shutdown};
use bitflags::bitflags;
use std::collections::VecDeque;
use std::io::{Error, ErrorKind, IoSlice, Result};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard};

/// Upper bound on the number of queued messages folded into one `writev`.
const MAX_IOV: usize = 64;

bitflags! {
    /// Poll events an engine is currently interested in.
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Describes how frames on the wire are delimited.
pub trait Protocol: Send + Sync + 'static {
    type Header: Send + 'static;

    /// Bytes in front of every header that carry nothing for us.
    fn recv_padding(&self) -> usize {
        0
    }

    /// Size of the header as it appears on the wire.
    fn header_size(&self) -> usize;

    fn unpack_header(&self, raw: &[u8]) -> Result<Self::Header>;

    /// Number of payload bytes that follow `hdr`.
    fn payload_size(&self, hdr: &Self::Header) -> usize;
}

/// An outgoing message: a contiguous byte range plus a completion hook.
pub trait Message: Send {
    fn bytes(&self) -> &[u8];

    /// Called exactly once, after the last byte hit the socket or when the
    /// engine gives up on the message.
    fn complete(self: Box<Self>, result: Result<()>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No fd attached yet; sends are queued.
    Init,
    Operating,
    ConnClosed,
}

struct RecvState<H> {
    padding: Vec<u8>,
    padding_offs: usize,
    hdr: Vec<u8>,
    hdr_offs: usize,
    header: Option<H>,
    payload: Vec<u8>,
    payload_offs: usize,
    ready: bool,
}

impl<H> RecvState<H> {
    fn new(padding: usize, header: usize) -> Self {
        Self {
            padding: vec![0; padding],
            padding_offs: 0,
            hdr: vec![0; header],
            hdr_offs: 0,
            header: None,
            payload: Vec::new(),
            payload_offs: 0,
            ready: false,
        }
    }

    fn reset(&mut self) {
        self.padding_offs = 0;
        self.hdr_offs = 0;
        self.header = None;
        self.payload = Vec::new();
        self.payload_offs = 0;
        self.ready = false;
    }
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<Box<dyn Message>>,
    offs: usize,
}

pub struct IoEngine<P: Protocol> {
    proto: P,
    fd: Mutex<Option<OwnedFd>>,
    status: Mutex<(Status, Option<ErrorKind>)>,
    rcv: Mutex<RecvState<P::Header>>,
    snd: Mutex<SendState>,
    completed: Mutex<Vec<(Box<dyn Message>, Result<()>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<P: Protocol> IoEngine<P> {
    pub fn new(proto: P) -> Self {
        let rcv = RecvState::new(proto.recv_padding(), proto.header_size());
        Self {
            proto,
            fd: Mutex::new(None),
            status: Mutex::new((Status::Init, None)),
            rcv: Mutex::new(rcv),
            snd: Mutex::new(SendState::default()),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.proto
    }

    /// Binds `fd` to the engine. Messages queued before this point are sent
    /// on the next progress call.
    pub fn attach(&self, fd: OwnedFd) -> Result<()> {
        log::debug!("IoEngine::attach(fd: {})", fd.as_raw_fd());
        crate::fd_set_nonblocking(fd.as_raw_fd())?;
        let mut slot = lock(&self.fd);
        if slot.is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists, "engine already has an fd"));
        }
        *slot = Some(fd);
        *lock(&self.status) = (Status::Operating, None);
        lock(&self.rcv).reset();
        Ok(())
    }

    /// Takes the fd back and returns the engine to `Init`, ready for reuse.
    /// Pending sends are failed.
    pub fn detach(&self) -> Option<OwnedFd> {
        self.fail_pending(ErrorKind::NotConnected);
        lock(&self.rcv).reset();
        *lock(&self.status) = (Status::Init, None);
        lock(&self.fd).take()
    }

    pub fn fd(&self) -> Option<RawFd> {
        lock(&self.fd).as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn status(&self) -> Status {
        lock(&self.status).0
    }

    pub fn error(&self) -> Option<ErrorKind> {
        lock(&self.status).1
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::ConnClosed
    }

    pub fn interest(&self) -> Interest {
        let mut interest = Interest::empty();
        if self.status() != Status::Operating {
            return interest;
        }
        if !lock(&self.rcv).ready {
            interest |= Interest::READ;
        }
        if self.send_pending() {
            interest |= Interest::WRITE;
        }
        interest
    }

    fn close(&self, shutdown: Shutdown) {
        let kind = match &shutdown {
            Shutdown::Orderly => None,
            Shutdown::Error(err) => Some(err.kind()),
        };
        let fd = self.fd();
        let mut status = lock(&self.status);
        if status.0 != Status::ConnClosed {
            log::debug!("IoEngine::close(fd: {:?}, error: {:?})", fd, kind);
        }
        *status = (Status::ConnClosed, kind);
    }

    /// Marks the connection dead and fails every queued message.
    pub fn shutdown(&self) {
        self.close(Shutdown::Orderly);
        self.fail_pending(ErrorKind::ConnectionAborted);
    }

    fn fail_pending(&self, kind: ErrorKind) {
        let drained: Vec<_> = {
            let mut snd = lock(&self.snd);
            snd.offs = 0;
            snd.queue.drain(..).collect()
        };
        for msg in drained {
            msg.complete(Err(Error::new(kind, "message dropped by I/O engine")));
        }
        self.send_flush_completed();
    }

    /// Pulls as many bytes as the fd offers toward the next frame.
    pub fn progress_recv(&self) {
        let Some(fd) = self.fd() else { return };
        if self.status() != Status::Operating {
            return;
        }
        let mut rcv = lock(&self.rcv);
        if rcv.ready {
            return;
        }

        let rcv = &mut *rcv;

        if rcv.padding_offs < rcv.padding.len() {
            let (n, shutdown) = read_buf(fd, &mut rcv.padding[rcv.padding_offs..], false);
            rcv.padding_offs += n;
            if let Some(shutdown) = shutdown {
                return self.close(shutdown);
            }
            if rcv.padding_offs < rcv.padding.len() {
                return;
            }
        }

        if rcv.header.is_none() {
            let (n, shutdown) = read_buf(fd, &mut rcv.hdr[rcv.hdr_offs..], false);
            rcv.hdr_offs += n;
            if rcv.hdr_offs < rcv.hdr.len() {
                if let Some(shutdown) = shutdown {
                    self.close(shutdown);
                }
                return;
            }
            match self.proto.unpack_header(&rcv.hdr) {
                Ok(header) => {
                    let size = self.proto.payload_size(&header);
                    rcv.payload = vec![0; size];
                    rcv.payload_offs = 0;
                    rcv.header = Some(header);
                }
                Err(err) => {
                    log::error!("IoEngine::progress_recv(fd: {}): bad header: {}", fd, err);
                    return self.close(Shutdown::Error(err));
                }
            }
            if let Some(shutdown) = shutdown {
                if !rcv.payload.is_empty() {
                    return self.close(shutdown);
                }
            }
        }

        if rcv.payload_offs < rcv.payload.len() {
            let (n, shutdown) = read_buf(fd, &mut rcv.payload[rcv.payload_offs..], false);
            rcv.payload_offs += n;
            if rcv.payload_offs < rcv.payload.len() {
                if let Some(shutdown) = shutdown {
                    self.close(shutdown);
                }
                return;
            }
        }

        rcv.ready = true;
    }

    pub fn recv_ready(&self) -> bool {
        lock(&self.rcv).ready
    }

    /// Hands out the completed frame and rearms the receive pipeline.
    pub fn recv_extract(&self) -> Option<(P::Header, Vec<u8>)> {
        let mut rcv = lock(&self.rcv);
        if !rcv.ready {
            return None;
        }
        let header = rcv.header.take()?;
        let payload = std::mem::take(&mut rcv.payload);
        rcv.reset();
        Some((header, payload))
    }

    pub fn send_pending(&self) -> bool {
        !lock(&self.snd).queue.is_empty()
    }

    pub fn send_enqueue(&self, msg: Box<dyn Message>) {
        lock(&self.snd).queue.push_back(msg);
        self.send_progress();
    }

    /// Queues `msg` ahead of everything that has not started transmission.
    pub fn send_urgent(&self, msg: Box<dyn Message>) {
        {
            let mut snd = lock(&self.snd);
            // a partially written message has to finish first
            let at = if snd.offs > 0 { 1 } else { 0 };
            let at = at.min(snd.queue.len());
            snd.queue.insert(at, msg);
        }
        self.send_progress();
    }

    pub fn send_progress(&self) {
        if self.status() == Status::ConnClosed {
            self.fail_pending(ErrorKind::ConnectionAborted);
            return;
        }
        if let Some(fd) = self.fd() {
            let mut snd = lock(&self.snd);
            while !snd.queue.is_empty() {
                let offs = snd.offs;
                let (n, shutdown) = {
                    let iov: Vec<IoSlice> = snd
                        .queue
                        .iter()
                        .take(MAX_IOV)
                        .map(|msg| IoSlice::new(msg.bytes()))
                        .collect();
                    writev_buf(fd, &iov, offs)
                };

                let mut done = Vec::new();
                let mut consumed = offs + n;
                while let Some(front) = snd.queue.front() {
                    let len = front.bytes().len();
                    if consumed < len {
                        break;
                    }
                    consumed -= len;
                    if let Some(msg) = snd.queue.pop_front() {
                        done.push((msg, Ok(())));
                    }
                }
                snd.offs = consumed;
                lock(&self.completed).extend(done);

                if let Some(shutdown) = shutdown {
                    drop(snd);
                    self.close(shutdown);
                    self.fail_pending(ErrorKind::ConnectionAborted);
                    return;
                }
                if n == 0 {
                    break;
                }
            }
        }
        self.send_flush_completed();
    }

    /// Runs completion hooks of finished sends. Never called with the send
    /// mutex held.
    pub fn send_flush_completed(&self) {
        let done = std::mem::take(&mut *lock(&self.completed));
        for (msg, result) in done {
            msg.complete(result);
        }
    }
}

impl<P: Protocol> Drop for IoEngine<P> {
    fn drop(&mut self) {
        let pending: Vec<_> = lock(&self.snd).queue.drain(..).collect();
        for msg in pending {
            msg.complete(Err(Error::new(ErrorKind::ConnectionAborted, "I/O engine dropped")));
        }
        self.send_flush_completed();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    struct LenPrefixed;

    impl Protocol for LenPrefixed {
        type Header = u32;

        fn recv_padding(&self) -> usize {
            2
        }

        fn header_size(&self) -> usize {
            4
        }

        fn unpack_header(&self, raw: &[u8]) -> Result<u32> {
            let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if len > 1 << 20 {
                return Err(Error::new(ErrorKind::InvalidData, "frame too large"));
            }
            Ok(len)
        }

        fn payload_size(&self, hdr: &u32) -> usize {
            *hdr as usize
        }
    }

    struct Frame {
        bytes: Vec<u8>,
        done: mpsc::Sender<bool>,
    }

    impl Message for Frame {
        fn bytes(&self) -> &[u8] {
            &self.bytes
        }

        fn complete(self: Box<Self>, result: Result<()>) {
            let _ = self.done.send(result.is_ok());
        }
    }

    fn frame(payload: &[u8], done: &mpsc::Sender<bool>) -> Box<Frame> {
        let mut bytes = vec![0xee, 0xee];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        Box::new(Frame {
            bytes,
            done: done.clone(),
        })
    }

    fn pump(engine: &IoEngine<LenPrefixed>) -> Option<(u32, Vec<u8>)> {
        for _ in 0..1000 {
            engine.progress_recv();
            if let Some(frame) = engine.recv_extract() {
                return Some(frame);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn frames_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let tx = IoEngine::new(LenPrefixed);
        let rx = IoEngine::new(LenPrefixed);
        tx.attach(a.into()).unwrap();
        rx.attach(b.into()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        tx.send_enqueue(frame(b"first", &done_tx));
        tx.send_enqueue(frame(b"", &done_tx));
        tx.send_urgent(frame(b"urgent", &done_tx));

        let got: Vec<Vec<u8>> = (0..3).map(|_| pump(&rx).unwrap().1).collect();
        assert_eq!(got.len(), 3);
        assert!(got.contains(&b"first".to_vec()));
        assert!(got.contains(&b"urgent".to_vec()));
        assert!(got.contains(&Vec::new()));
        assert_eq!(done_rx.try_iter().filter(|ok| *ok).count(), 3);
    }

    #[test]
    fn queued_before_attach() {
        let (a, b) = UnixStream::pair().unwrap();
        let tx = IoEngine::new(LenPrefixed);
        let rx = IoEngine::new(LenPrefixed);
        let (done_tx, done_rx) = mpsc::channel();

        tx.send_enqueue(frame(b"early", &done_tx));
        assert_eq!(tx.status(), Status::Init);
        assert!(tx.send_pending());
        assert!(done_rx.try_recv().is_err());

        tx.attach(a.into()).unwrap();
        rx.attach(b.into()).unwrap();
        assert!(tx.interest().contains(Interest::WRITE));
        tx.send_progress();

        assert_eq!(pump(&rx).unwrap().1, b"early");
        assert_eq!(done_rx.recv().unwrap(), true);
    }

    #[test]
    fn peer_close_is_reported() {
        let (a, b) = UnixStream::pair().unwrap();
        let rx = IoEngine::new(LenPrefixed);
        rx.attach(b.into()).unwrap();
        drop(a);
        rx.progress_recv();
        assert!(rx.is_closed());
        assert_eq!(rx.error(), None);
        assert!(rx.recv_extract().is_none());
    }

    #[test]
    fn oversized_header_closes() {
        let (a, b) = UnixStream::pair().unwrap();
        let rx = IoEngine::new(LenPrefixed);
        rx.attach(b.into()).unwrap();
        nix::unistd::write(a.as_raw_fd(), &[0, 0, 0xff, 0xff, 0xff, 0xff]).unwrap();
        rx.progress_recv();
        assert!(rx.is_closed());
        assert_eq!(rx.error(), Some(ErrorKind::InvalidData));
    }

    #[test]
    fn shutdown_fails_queue() {
        let tx = IoEngine::new(LenPrefixed);
        let (done_tx, done_rx) = mpsc::channel();
        tx.send_enqueue(frame(b"never", &done_tx));
        tx.shutdown();
        assert_eq!(done_rx.recv().unwrap(), false);
        assert!(!tx.send_pending());
    }
}
