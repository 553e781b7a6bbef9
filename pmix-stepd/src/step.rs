//! Shared state of one job step on this node.

use crate::coll::CollList;
use crate::config::{Config, Policy};
use crate::dconn::{DirectConns, DirectTransport};
use crate::dmdx::Dmdx;
use crate::error::{Error, Result};
use crate::info::JobInfo;
use crate::launcher::Launcher;
use crate::libpmix::PmixLibrary;
use crate::nspace::{Nspace, NspaceTable};
use crate::pingpong::PingPong;
use crate::proto::{Encoding, Engine};
use stepio::Notifier;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct Step {
    pub job: JobInfo,
    pub config: Config,
    pub enc: Encoding,
    pub launcher: Arc<dyn Launcher>,
    pub lib: Arc<dyn PmixLibrary>,
    pub nspaces: NspaceTable,
    pub colls: CollList,
    pub dconn: DirectConns,
    pub dmdx: Dmdx,
    pub pingpong: PingPong,
    wake: Notifier,
    /// Direct connections established off the agent thread, waiting to be
    /// polled.
    new_conns: Mutex<Vec<(u32, Arc<Engine>)>>,
    stopping: AtomicBool,
}

impl Step {
    pub fn new(
        job: JobInfo,
        config: Config,
        launcher: Arc<dyn Launcher>,
        lib: Arc<dyn PmixLibrary>,
        transport: Option<Box<dyn DirectTransport>>,
    ) -> Result<Arc<Self>> {
        let enc = Encoding::from_same_arch(config.same_arch());
        let nspaces = NspaceTable::new();
        nspaces.add(Nspace::from_job(&job)?)?;
        let dconn = DirectConns::new(job.nnodes, enc, transport);
        let pingpong = PingPong::new(config.policy.contains(Policy::PINGPONG));
        Ok(Arc::new(Self {
            enc,
            launcher,
            lib,
            nspaces,
            colls: CollList::new(),
            dconn,
            dmdx: Dmdx::new(),
            pingpong,
            wake: Notifier::new()?,
            new_conns: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            job,
            config,
        }))
    }

    pub fn host(&self, nodeid: u32) -> Result<&str> {
        self.job
            .host(nodeid)
            .ok_or_else(|| Error::BadParam(format!("node id {} out of range", nodeid)))
    }

    /// Wakes the agent's poll loop.
    pub fn wake(&self) {
        self.wake.notify();
    }

    pub fn wake_fd(&self) -> RawFd {
        self.wake.fd()
    }

    pub fn drain_wake(&self) {
        self.wake.drain();
    }

    /// Hands a freshly connected direct engine to the agent.
    pub fn push_conn(&self, nodeid: u32, engine: Arc<Engine>) {
        self.new_conns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((nodeid, engine));
        self.wake();
    }

    pub fn take_conns(&self) -> Vec<(u32, Arc<Engine>)> {
        std::mem::take(
            &mut *self
                .new_conns
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Unrecoverable for the whole step: log and have the launcher kill it.
    pub fn fatal(&self, err: &Error) {
        log::error!("fatal error, killing step {}.{}: {}", self.job.jobid, self.job.stepid, err);
        self.launcher.kill_step();
    }
}
