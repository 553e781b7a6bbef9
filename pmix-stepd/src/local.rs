//! Single-host stand-ins for the launcher and the PMIx library, used to run
//! several step agents inside one process.

use crate::error::{Error, Result, Status};
use crate::launcher::Launcher;
use crate::libpmix::{Callback, Info, ModexData, PmixLibrary, ServerModule};
use crate::nspace::Proc;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const CRED_MAGIC: &[u8; 4] = b"RCRD";

/// Forwarder for nodes that all live on this host, each with its own spool
/// directory.
#[derive(Default)]
pub struct UnixRelay {
    spools: Mutex<HashMap<String, PathBuf>>,
    down: Mutex<Vec<String>>,
    kills: AtomicU32,
    uid: u32,
}

impl UnixRelay {
    pub fn new() -> Self {
        Self::with_uid(nix::unistd::Uid::effective().as_raw())
    }

    /// A relay issuing credentials for `uid`.
    pub fn with_uid(uid: u32) -> Self {
        Self {
            uid,
            ..Self::default()
        }
    }

    pub fn add_host(&self, host: &str, spool: impl Into<PathBuf>) {
        lock(&self.spools).insert(host.to_string(), spool.into());
    }

    /// Makes forwarding to `host` fail until it is brought back.
    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = lock(&self.down);
        hosts.retain(|h| h != host);
        if down {
            hosts.push(host.to_string());
        }
    }

    /// Times a step was killed through this relay.
    pub fn kills(&self) -> u32 {
        self.kills.load(Ordering::SeqCst)
    }

    fn deliver(&self, host: &str, addr: &Path, data: &[u8]) -> std::io::Result<()> {
        if lock(&self.down).iter().any(|h| h == host) {
            return Err(std::io::Error::new(ErrorKind::ConnectionRefused, format!("{} is down", host)));
        }
        let spool = lock(&self.spools)
            .get(host)
            .cloned()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, format!("unknown host {}", host)))?;
        let name = addr
            .file_name()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, format!("bad address {:?}", addr)))?;
        let mut conn = UnixStream::connect(spool.join(name))?;
        conn.write_all(&(data.len() as u32).to_be_bytes())?;
        conn.write_all(data)
    }
}

impl Launcher for UnixRelay {
    fn forward(&self, hosts: &[String], addr: &Path, data: &[u8]) -> std::io::Result<()> {
        for host in hosts {
            self.deliver(host, addr, data)?;
        }
        Ok(())
    }

    fn kill_step(&self) {
        log::warn!("relay: killing step");
        self.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn host_addr(&self, _host: &str) -> std::io::Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn create_credential(&self) -> Vec<u8> {
        let mut cred = CRED_MAGIC.to_vec();
        cred.extend_from_slice(&self.uid.to_be_bytes());
        cred
    }

    fn verify_credential(&self, cred: &[u8]) -> Option<u32> {
        let uid = cred.strip_prefix(CRED_MAGIC.as_slice())?;
        Some(u32::from_be_bytes(uid.try_into().ok()?))
    }

    fn log(&self, level: log::Level, line: &str) {
        eprintln!("{:<5} {}", level, line);
    }
}

/// Scripted PMIx library. Modex data becomes available once a test commits
/// it; requests that come earlier wait for the commit.
pub struct MockLibrary {
    version: (u32, u32, u32),
    module: Mutex<Option<Arc<dyn ServerModule>>>,
    nspaces: Mutex<Vec<(String, u32, Vec<Info>)>>,
    clients: Mutex<Vec<Proc>>,
    committed: Mutex<HashMap<Proc, Vec<u8>>>,
    waiting: Mutex<Vec<(Proc, Callback)>>,
    finalized: AtomicU32,
}

impl Default for MockLibrary {
    fn default() -> Self {
        Self::with_version((4, 2, 3))
    }
}

impl MockLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(version: (u32, u32, u32)) -> Self {
        Self {
            version,
            module: Mutex::new(None),
            nspaces: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            committed: Mutex::new(HashMap::new()),
            waiting: Mutex::new(Vec::new()),
            finalized: AtomicU32::new(0),
        }
    }

    /// The module handed over by `init_server`.
    pub fn module(&self) -> Option<Arc<dyn ServerModule>> {
        lock(&self.module).clone()
    }

    pub fn nspaces(&self) -> Vec<(String, u32, Vec<Info>)> {
        lock(&self.nspaces).clone()
    }

    pub fn clients(&self) -> Vec<Proc> {
        lock(&self.clients).clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst) > 0
    }

    /// Publishes the modex blob of local client `proc`.
    pub fn commit(&self, proc: &Proc, data: &[u8]) {
        lock(&self.committed).insert(proc.clone(), data.to_vec());
        let ready: Vec<(Proc, Callback)> = {
            let mut waiting = lock(&self.waiting);
            let (ready, rest) = std::mem::take(&mut *waiting)
                .into_iter()
                .partition(|(p, _)| p == proc);
            *waiting = rest;
            ready
        };
        for (_, cb) in ready {
            cb(Status::Success, ModexData::new(data.to_vec()));
        }
    }
}

impl PmixLibrary for MockLibrary {
    fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    fn init_server(&self, tmpdir: &Path, module: Arc<dyn ServerModule>) -> Result<()> {
        log::debug!("mock library serving from {:?}", tmpdir);
        *lock(&self.module) = Some(module);
        Ok(())
    }

    fn register_nspace(&self, nspace: &str, nlocal: u32, info: Vec<Info>) -> Result<()> {
        lock(&self.nspaces).push((nspace.to_string(), nlocal, info));
        Ok(())
    }

    fn register_client(&self, proc: &Proc, _uid: u32, _gid: u32) -> Result<()> {
        lock(&self.clients).push(proc.clone());
        Ok(())
    }

    fn deregister_nspace(&self, nspace: &str) {
        lock(&self.nspaces).retain(|(name, _, _)| name != nspace);
    }

    fn setup_fork(&self, proc: &Proc) -> Result<Vec<(String, String)>> {
        if !lock(&self.clients).contains(proc) {
            return Err(Error::BadParam(format!("{} is not a registered client", proc)));
        }
        Ok(vec![
            ("PMIX_NAMESPACE".to_string(), proc.nspace.clone()),
            ("PMIX_RANK".to_string(), proc.rank.to_string()),
        ])
    }

    fn dmodex_request(&self, proc: &Proc, cb: Callback) {
        let data = lock(&self.committed).get(proc).cloned();
        match data {
            Some(data) => cb(Status::Success, ModexData::new(data)),
            None => lock(&self.waiting).push((proc.clone(), cb)),
        }
    }

    fn finalize(&self) -> Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        *lock(&self.module) = None;
        Ok(())
    }
}
