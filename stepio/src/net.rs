use socket2::{Domain, SockAddr, Socket, Type};
use std::io::Result;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::time::Duration;

/// Listens on `addr`; port 0 picks an ephemeral port.
pub fn tcp_listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    log::debug!("tcp_listen(addr: {}) = {:?}", addr, socket.local_addr()?.as_socket());
    Ok(socket.into())
}

pub fn tcp_connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_nodelay(true)?;
    match timeout {
        Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
        None => socket.connect(&addr.into())?,
    }
    Ok(socket.into())
}

/// Binds a UNIX stream listener, unlinking a stale socket file first.
pub fn unix_listen(path: &Path, backlog: i32) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog)?;
    log::debug!("unix_listen(path: {:?})", path);
    Ok(UnixListener::from(std::os::fd::OwnedFd::from(socket)))
}

#[cfg(test)]
mod test {
    use crate::net::*;
    use std::io::{Read, Write};

    #[test]
    fn tcp_ephemeral_port() {
        let listener = tcp_listen("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = tcp_connect(addr, Some(Duration::from_secs(1))).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn unix_rebinds_stale_path() {
        let path = std::env::temp_dir().join(format!("stepio-net-{}", std::process::id()));
        drop(unix_listen(&path, 4).unwrap());
        let listener = unix_listen(&path, 4).unwrap();
        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        assert!(listener.accept().is_ok());
        std::fs::remove_file(&path).unwrap();
    }
}
