//! Contract with the external PMIx server library.
//!
//! The library calls into the plugin through [`ServerModule`]; the plugin
//! drives the library through [`PmixLibrary`].

use crate::error::{Result, Status};
use crate::nspace::Proc;
use std::path::Path;
use std::sync::Arc;

pub mod keys {
    pub const JOBID: &str = "pmix.jobid";
    pub const NODEID: &str = "pmix.nodeid";
    pub const PROC_DATA: &str = "pmix.pdata";
    pub const RANK: &str = "pmix.rank";
    pub const APPNUM: &str = "pmix.appnum";
    pub const APPRANK: &str = "pmix.apprank";
    pub const GLOBAL_RANK: &str = "pmix.grank";
    pub const LOCAL_RANK: &str = "pmix.lrank";
    pub const NODE_RANK: &str = "pmix.nrank";
    pub const HOSTNAME: &str = "pmix.hname";
    pub const UNIV_SIZE: &str = "pmix.univ.size";
    pub const JOB_SIZE: &str = "pmix.job.size";
    pub const LOCAL_SIZE: &str = "pmix.local.size";
    pub const NODE_SIZE: &str = "pmix.node.size";
    pub const MAX_PROCS: &str = "pmix.max.size";
    pub const NODE_MAP: &str = "pmix.nmap";
    pub const PROC_MAP: &str = "pmix.pmap";
    pub const LOCAL_PEERS: &str = "pmix.lpeers";
    pub const LOCALLDR: &str = "pmix.lldr";
    pub const TMPDIR: &str = "pmix.tmpdir";
    pub const NSDIR: &str = "pmix.nsdir";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    Str(String),
    Array(Vec<Info>),
}

/// A key/value pair handed to the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub key: String,
    pub value: Value,
}

impl Info {
    pub fn u32(key: &str, v: u32) -> Self {
        Self {
            key: key.to_string(),
            value: Value::U32(v),
        }
    }

    pub fn str(key: &str, v: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: Value::Str(v.into()),
        }
    }

    pub fn array(key: &str, v: Vec<Info>) -> Self {
        Self {
            key: key.to_string(),
            value: Value::Array(v),
        }
    }
}

/// Data returned to the library. The release hook runs when the library
/// drops it.
pub struct ModexData {
    data: Vec<u8>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ModexData {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            release: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_release(data: Vec<u8>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data,
            release: Some(Box::new(release)),
        }
    }
}

impl std::ops::Deref for ModexData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for ModexData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModexData")
            .field("len", &self.data.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl Drop for ModexData {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Completion of a fence or a direct modex request.
pub type Callback = Box<dyn FnOnce(Status, ModexData) + Send>;

/// Callbacks the library invokes on behalf of local clients.
pub trait ServerModule: Send + Sync {
    fn client_connected(&self, proc: &Proc) -> Status;
    fn client_finalized(&self, proc: &Proc) -> Status;
    fn abort(&self, proc: &Proc, status: i32, msg: &str, targets: &[Proc]) -> Status;
    /// The outcome, errors included, arrives through `cb`; the return value
    /// only tells whether the request was taken.
    fn fence_nb(&self, procs: &[Proc], collect: bool, data: &[u8], cb: Callback) -> Status;
    fn direct_modex(&self, proc: &Proc, cb: Callback) -> Status;
    fn publish(&self, proc: &Proc, info: &[Info]) -> Status;
    fn lookup(&self, proc: &Proc, keys: &[String]) -> Status;
    fn unpublish(&self, proc: &Proc, keys: &[String]) -> Status;
    fn spawn(&self, proc: &Proc, apps: &[Info]) -> Status;
    fn connect(&self, procs: &[Proc]) -> Status;
    fn disconnect(&self, procs: &[Proc]) -> Status;
    fn job_control(&self, requestor: &Proc, targets: &[Proc], directives: &[Info]) -> Status;
    fn error(&self, status: Status, msg: &str);
}

pub trait PmixLibrary: Send + Sync + 'static {
    /// `(major, minor, release)`
    fn version(&self) -> (u32, u32, u32);

    /// Starts the library's server side with `tmpdir` as its rendezvous dir.
    fn init_server(&self, tmpdir: &Path, module: Arc<dyn ServerModule>) -> Result<()>;

    fn register_nspace(&self, nspace: &str, nlocal: u32, info: Vec<Info>) -> Result<()>;

    fn register_client(&self, proc: &Proc, uid: u32, gid: u32) -> Result<()>;

    fn deregister_nspace(&self, nspace: &str);

    /// Environment a client process needs to connect to the server.
    fn setup_fork(&self, proc: &Proc) -> Result<Vec<(String, String)>>;

    /// Fetches the modex blob of the local process `proc`. Failures are
    /// reported through `cb` as well.
    fn dmodex_request(&self, proc: &Proc, cb: Callback);

    fn generate_regex(&self, input: &str) -> Result<String> {
        Ok(input.to_string())
    }

    fn generate_ppn(&self, input: &str) -> Result<String> {
        Ok(input.to_string())
    }

    fn finalize(&self) -> Result<()>;
}

#[cfg(test)]
mod test {
    use crate::libpmix::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn release_runs_on_drop() {
        let released = Arc::new(AtomicU32::new(0));
        let counter = released.clone();
        let data = ModexData::with_release(b"abc".to_vec(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(&data[..], b"abc");
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(data);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        drop(ModexData::empty());
    }
}
