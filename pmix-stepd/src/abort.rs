//! Abort reporting: the launcher side collects the first non-zero exit
//! status any client aborted with; nodes report to it over TCP.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use nix::poll::PollFlags;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use stepio::Notifier;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener living in the launcher for the duration of the step.
pub struct AbortAgent {
    port: u16,
    status: Arc<AtomicI32>,
    stop: Arc<Notifier>,
    thread: Option<JoinHandle<()>>,
}

fn serve(mut conn: TcpStream, status: &AtomicI32) -> std::io::Result<()> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(IO_TIMEOUT))?;
    conn.set_write_timeout(Some(IO_TIMEOUT))?;
    let code = conn.read_i32::<BigEndian>()?;
    if code != 0 && status.compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
        log::info!("step aborted with status {}", code);
    }
    conn.write_u32::<BigEndian>(0)
}

impl AbortAgent {
    pub fn start() -> Result<Self> {
        let listener = stepio::net::tcp_listen(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), 64)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let status = Arc::new(AtomicI32::new(0));
        let stop = Arc::new(Notifier::new()?);

        let thread = {
            let (status, stop) = (status.clone(), stop.clone());
            std::thread::Builder::new()
                .name("pmix-abort".into())
                .spawn(move || Self::run(listener, &status, &stop))?
        };
        log::debug!("abort agent listening on port {}", port);
        Ok(Self {
            port,
            status,
            stop,
            thread: Some(thread),
        })
    }

    fn run(listener: TcpListener, status: &AtomicI32, stop: &Notifier) {
        loop {
            let mut fds = [
                nix::poll::PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN),
                nix::poll::PollFd::new(stop.fd(), PollFlags::POLLIN),
            ];
            match nix::poll::poll(&mut fds, -1) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("abort agent: poll failed: {}", err);
                    return;
                }
            }
            if fds[1].revents().map_or(false, |r| !r.is_empty()) {
                return;
            }
            loop {
                match listener.accept() {
                    Ok((conn, peer)) => {
                        if let Err(err) = serve(conn, status) {
                            log::warn!("abort agent: report from {} failed: {}", peer, err);
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        log::warn!("abort agent: accept failed: {}", err);
                        break;
                    }
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Variables telling the step where to report, `host` being the
    /// launcher's address.
    pub fn env(&self, host: &str) -> Vec<(String, String)> {
        vec![
            (crate::info::COMM_HOST_ENV.to_string(), host.to_string()),
            (crate::info::ABORT_PORT_ENV.to_string(), self.port.to_string()),
        ]
    }

    /// First non-zero status reported, or 0.
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) -> i32 {
        self.shutdown();
        self.status()
    }

    fn shutdown(&mut self) {
        self.stop.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AbortAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reports `status` to the launcher's abort agent at `addr`.
pub fn report(addr: SocketAddr, status: i32) -> Result<()> {
    let mut conn = stepio::net::tcp_connect(addr, Some(IO_TIMEOUT))
        .map_err(|err| Error::CommFailed(format!("abort agent at {}: {}", addr, err)))?;
    conn.set_read_timeout(Some(IO_TIMEOUT))?;
    conn.set_write_timeout(Some(IO_TIMEOUT))?;
    conn.write_i32::<BigEndian>(status)?;
    conn.read_u32::<BigEndian>()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::abort::*;

    #[test]
    fn first_status_wins() {
        let agent = AbortAgent::start().unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, agent.port()));
        report(addr, 0).unwrap();
        assert_eq!(agent.status(), 0);
        report(addr, 3).unwrap();
        report(addr, 9).unwrap();
        assert_eq!(agent.stop(), 3);
    }

    #[test]
    fn env_points_at_agent() {
        let agent = AbortAgent::start().unwrap();
        let env = agent.env("10.1.2.3");
        assert!(env.contains(&(crate::info::ABORT_PORT_ENV.to_string(), agent.port().to_string())));
        assert!(env.iter().any(|(_, v)| v == "10.1.2.3"));
    }

    #[test]
    fn unreachable_agent() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(report(addr, 1).is_err());
    }
}
