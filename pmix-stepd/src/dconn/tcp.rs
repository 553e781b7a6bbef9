//! TCP direct transport. The endpoint is the listening port, little endian.

use crate::dconn::{DirectTransport, Semantics};
use crate::error::{Error, Result};
use socket2::SockRef;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpTransport {
    listener: TcpListener,
    ep: [u8; 2],
}

/// Address to listen on: the first IPv4 address of the listed interfaces,
/// or every interface when none is given.
fn bind_addr(devices: Option<&str>) -> Result<IpAddr> {
    let Some(devices) = devices else {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    };
    let names: Vec<&str> = devices.split(',').map(str::trim).filter(|d| !d.is_empty()).collect();
    let ifaces = if_addrs::get_if_addrs()?;
    for name in &names {
        if let Some(iface) = ifaces.iter().find(|i| i.name == *name && i.ip().is_ipv4()) {
            log::debug!("direct connections bound to {} ({})", iface.name, iface.ip());
            return Ok(iface.ip());
        }
    }
    log::warn!("none of the interfaces {:?} has an IPv4 address, listening on all", names);
    Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

// direct links live as long as the step
fn tune(stream: &TcpStream) -> Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)?;
    Ok(())
}

impl TcpTransport {
    pub fn new(devices: Option<&str>) -> Result<Self> {
        let addr = SocketAddr::new(bind_addr(devices)?, 0);
        let listener = stepio::net::tcp_listen(addr, libc::SOMAXCONN)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        log::debug!("direct transport listening on port {}", port);
        Ok(Self {
            listener,
            ep: port.to_le_bytes(),
        })
    }

    pub fn port(&self) -> u16 {
        u16::from_le_bytes(self.ep)
    }
}

impl DirectTransport for TcpTransport {
    fn semantics(&self) -> Semantics {
        Semantics::TwoSided
    }

    fn endpoint(&self) -> &[u8] {
        &self.ep
    }

    fn connect(&self, addr: IpAddr, ep: &[u8]) -> Result<OwnedFd> {
        let port: [u8; 2] = ep
            .try_into()
            .map_err(|_| Error::ProtocolViolation(format!("TCP endpoint of {} bytes", ep.len())))?;
        let addr = SocketAddr::new(addr, u16::from_le_bytes(port));
        let stream = stepio::net::tcp_connect(addr, Some(CONNECT_TIMEOUT))
            .map_err(|err| Error::CommFailed(format!("connect to {}: {}", addr, err)))?;
        tune(&stream)?;
        Ok(stream.into())
    }

    fn listener(&self) -> Option<RawFd> {
        Some(self.listener.as_raw_fd())
    }

    fn accept(&self) -> Result<Option<OwnedFd>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                log::trace!("accepted direct link from {}", peer);
                tune(&stream)?;
                Ok(Some(stream.into()))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dconn::tcp::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn connect_through_endpoint() {
        let server = TcpTransport::new(None).unwrap();
        let client = TcpTransport::new(None).unwrap();
        assert_eq!(server.endpoint().len(), 2);
        assert!(server.accept().unwrap().is_none());

        let fd = client
            .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), server.endpoint())
            .unwrap();
        let mut out = TcpStream::from(fd);
        out.write_all(b"hi").unwrap();

        let mut accepted = None;
        for _ in 0..1000 {
            accepted = server.accept().unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut conn = TcpStream::from(accepted.unwrap());
        conn.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn rejects_bad_endpoint() {
        let client = TcpTransport::new(None).unwrap();
        assert!(client.connect(IpAddr::V4(Ipv4Addr::LOCALHOST), &[1, 2, 3]).is_err());
    }

    #[test]
    fn unknown_device_falls_back() {
        assert_eq!(
            bind_addr(Some("no-such-dev0")).unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }
}
