use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

/// Services the embedding launcher provides to the plugin.
pub trait Launcher: Send + Sync + 'static {
    /// Delivers `data` to the agent listening on the UNIX socket `addr` on
    /// every host in `hosts`. The forwarder prefixes the frame with its
    /// length as a big-endian `u32`.
    fn forward(&self, hosts: &[String], addr: &Path, data: &[u8]) -> Result<()>;

    /// Terminates the whole step with SIGKILL.
    fn kill_step(&self);

    /// Address the direct transport of `host` is reachable at.
    fn host_addr(&self, host: &str) -> Result<IpAddr> {
        (host, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .next()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no address for {}", host)))
    }

    /// Credential proving the caller runs on behalf of the step owner.
    fn create_credential(&self) -> Vec<u8>;

    /// Returns the uid the credential was issued for.
    fn verify_credential(&self, cred: &[u8]) -> Option<u32>;

    /// Sink for plugin diagnostics.
    fn log(&self, level: log::Level, line: &str);
}
