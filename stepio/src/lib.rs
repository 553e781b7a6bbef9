use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use std::io::{Error, ErrorKind, IoSlice, Result};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

pub mod dir;
pub mod engine;
pub mod net;
pub mod pool;

pub use engine::{Interest, IoEngine, Message, Protocol};
pub use pool::Pool;

/// Why a transfer stopped before the buffer was exhausted.
#[derive(Debug)]
pub enum Shutdown {
    /// The peer closed its end.
    Orderly,
    Error(Error),
}

/// Reads into `buf` until it is full, the fd would block or the peer goes away.
///
/// With `blocking` set the call waits for readability instead of returning on
/// `EAGAIN`. The byte count is always returned, even when the stream ended
/// part way through.
pub fn read_buf(fd: RawFd, buf: &mut [u8], blocking: bool) -> (usize, Option<Shutdown>) {
    let mut offs = 0;

    while offs < buf.len() {
        match nix::unistd::read(fd, &mut buf[offs..]) {
            Ok(0) => return (offs, Some(Shutdown::Orderly)),
            Ok(n) => offs += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                if !blocking {
                    break;
                }
                if let Err(err) = wait_fd(fd, PollFlags::POLLIN, None) {
                    return (offs, Some(Shutdown::Error(err)));
                }
            }
            Err(errno) => return (offs, Some(Shutdown::Error(errno.into()))),
        }
    }

    (offs, None)
}

/// Writes the scatter list `iov`, skipping the first `offset` bytes of it.
///
/// Returns the number of bytes written by this call, which is zero when the
/// socket buffer is full.
pub fn writev_buf(fd: RawFd, iov: &[IoSlice], offset: usize) -> (usize, Option<Shutdown>) {
    let mut skip = offset;
    let mut pending: Vec<IoSlice> = Vec::with_capacity(iov.len());
    for slice in iov {
        if skip >= slice.len() {
            skip -= slice.len();
            continue;
        }
        pending.push(IoSlice::new(&slice[skip..]));
        skip = 0;
    }

    let total: usize = pending.iter().map(|s| s.len()).sum();
    let mut written = 0;

    while written < total {
        let (first, rest) = advance(&pending, written);
        let mut slices = Vec::with_capacity(rest.len() + 1);
        slices.push(IoSlice::new(first));
        slices.extend(rest.iter().map(|s| IoSlice::new(s)));

        match nix::sys::uio::writev(fd, &slices) {
            Ok(0) => return (written, Some(Shutdown::Orderly)),
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => break,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                return (written, Some(Shutdown::Orderly))
            }
            Err(errno) => return (written, Some(Shutdown::Error(errno.into()))),
        }
    }

    (written, None)
}

// Locates the slice containing byte `pos` of the concatenated list.
fn advance<'a>(slices: &'a [IoSlice<'a>], mut pos: usize) -> (&'a [u8], &'a [IoSlice<'a>]) {
    for (i, slice) in slices.iter().enumerate() {
        if pos < slice.len() {
            return (&slice[pos..], &slices[i + 1..]);
        }
        pos -= slice.len();
    }
    (&[], &[])
}

/// Blocks until `fd` reports one of `events` or `timeout` expires.
pub fn wait_fd(fd: RawFd, events: PollFlags, timeout: Option<Duration>) -> Result<bool> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let ms = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_millis().min(i32::MAX as u128) as i32
            }
            None => -1,
        };
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, ms) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(Error::new(ErrorKind::BrokenPipe, "poll reported an fd error"));
                }
                return Ok(true);
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

pub fn fd_read_ready(fd: RawFd) -> Result<bool> {
    wait_fd(fd, PollFlags::POLLIN, Some(Duration::ZERO))
}

pub fn fd_set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub fn fd_set_cloexec(fd: RawFd) -> Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Self-pipe used to wake a poll loop from another thread.
pub struct Notifier {
    rd: OwnedFd,
    wr: OwnedFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let (rd, wr) = nix::unistd::pipe()?;
        // the pipe fds are fresh and owned by nobody else
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(rd), OwnedFd::from_raw_fd(wr)) };
        for fd in [&rd, &wr] {
            let raw = std::os::fd::AsRawFd::as_raw_fd(fd);
            fd_set_nonblocking(raw)?;
            fd_set_cloexec(raw)?;
        }
        Ok(Self { rd, wr })
    }

    pub fn fd(&self) -> RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.rd)
    }

    /// Never blocks; a full pipe already guarantees a wakeup.
    pub fn notify(&self) {
        let fd = std::os::fd::AsRawFd::as_raw_fd(&self.wr);
        loop {
            match nix::unistd::write(fd, &[1u8]) {
                Err(Errno::EINTR) => continue,
                Ok(_) | Err(Errno::EAGAIN) => return,
                Err(errno) => {
                    log::error!("Notifier::notify(fd: {}): {}", fd, errno);
                    return;
                }
            }
        }
    }

    /// Consumes pending wakeups and returns how many bytes were queued.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let (n, shutdown) = read_buf(self.fd(), &mut buf, false);
            total += n;
            if n < buf.len() || shutdown.is_some() {
                return total;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::*;
    use rand::{RngCore, SeedableRng};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn writev_with_offset() {
        let (a, b) = UnixStream::pair().unwrap();
        fd_set_nonblocking(b.as_raw_fd()).unwrap();

        let parts: [&[u8]; 3] = [b"hello ", b"step ", b"daemon"];
        let iov: Vec<IoSlice> = parts.iter().map(|p| IoSlice::new(p)).collect();

        let (n, shutdown) = writev_buf(a.as_raw_fd(), &iov, 8);
        assert!(shutdown.is_none());
        assert_eq!(n, 17 - 8);

        let mut buf = vec![0u8; n];
        let (got, shutdown) = read_buf(b.as_raw_fd(), &mut buf, false);
        assert!(shutdown.is_none());
        assert_eq!(got, n);
        assert_eq!(&buf, b"ep daemon");
    }

    #[test]
    fn read_reports_orderly_close() {
        let (a, b) = UnixStream::pair().unwrap();
        fd_set_nonblocking(b.as_raw_fd()).unwrap();
        nix::unistd::write(a.as_raw_fd(), b"abc").unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        let (n, shutdown) = read_buf(b.as_raw_fd(), &mut buf, false);
        assert_eq!(n, 3);
        assert!(matches!(shutdown, Some(Shutdown::Orderly)));
    }

    #[test]
    fn read_would_block() {
        let (_a, b) = UnixStream::pair().unwrap();
        fd_set_nonblocking(b.as_raw_fd()).unwrap();
        let mut buf = [0u8; 8];
        let (n, shutdown) = read_buf(b.as_raw_fd(), &mut buf, false);
        assert_eq!(n, 0);
        assert!(shutdown.is_none());
        assert!(!fd_read_ready(b.as_raw_fd()).unwrap());
    }

    #[test]
    fn large_transfer_drains_in_pieces() {
        let (a, b) = UnixStream::pair().unwrap();
        fd_set_nonblocking(a.as_raw_fd()).unwrap();
        fd_set_nonblocking(b.as_raw_fd()).unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut src = vec![0u8; 4 << 20];
        rng.fill_bytes(&mut src);

        let mut dst = vec![0u8; src.len()];
        let (mut sent, mut rcvd) = (0, 0);
        while rcvd < src.len() {
            if sent < src.len() {
                let (n, shutdown) = writev_buf(a.as_raw_fd(), &[IoSlice::new(&src)], sent);
                assert!(shutdown.is_none());
                sent += n;
            }
            let (n, shutdown) = read_buf(b.as_raw_fd(), &mut dst[rcvd..], false);
            assert!(shutdown.is_none());
            rcvd += n;
        }
        assert_eq!(src, dst);
    }

    #[test]
    fn notifier_wakes_poll() {
        let notifier = Notifier::new().unwrap();
        assert!(!fd_read_ready(notifier.fd()).unwrap());
        notifier.notify();
        notifier.notify();
        assert!(fd_read_ready(notifier.fd()).unwrap());
        assert_eq!(notifier.drain(), 2);
        assert!(!fd_read_ready(notifier.fd()).unwrap());
    }
}
