//! PMIx server side of a per-node step agent.
//!
//! [`Plugin`] is what the launcher drives: one instance per node, one step
//! at a time. Everything else hangs off the [`step::Step`] it creates.

pub mod abort;
pub mod agent;
pub mod coll;
pub mod config;
pub mod conn;
pub mod dconn;
pub mod dmdx;
pub mod error;
pub mod hostlist;
pub mod info;
pub mod launcher;
pub mod libpmix;
pub mod local;
pub mod logger;
pub mod mapping;
pub mod module;
pub mod nspace;
pub mod pingpong;
pub mod proto;
pub mod server;
pub mod step;

use crate::agent::Agent;
use crate::coll::topo;
use crate::config::{Config, Policy};
use crate::dconn::tcp::TcpTransport;
use crate::dconn::DirectTransport;
use crate::error::{Error, Result};
use crate::info::{JobInfo, StepRecord};
use crate::launcher::Launcher;
use crate::libpmix::PmixLibrary;
use crate::logger::Logger;
use crate::module::Module;
use crate::nspace::Proc;
use crate::step::Step;
use nix::unistd::{chown, Gid, Uid};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

/// PMIx major versions the server side works with.
const SUPPORTED_MAJOR: std::ops::RangeInclusive<u32> = 2..=5;

struct Running {
    step: Arc<Step>,
    agent: Option<Agent>,
    socket: PathBuf,
}

fn direct_transport(config: &Config) -> Result<Option<Box<dyn DirectTransport>>> {
    if !config.direct_conn() {
        return Ok(None);
    }
    if config.policy.contains(Policy::DIRECT_CONN_UCX) {
        log::warn!("UCX direct connections are not available, falling back to TCP");
        if let Some(tls) = &config.tls {
            log::warn!("UCX transports {:?} are ignored", tls);
        }
    }
    Ok(Some(Box::new(TcpTransport::new(config.net_devices.as_deref())?)))
}

pub struct Plugin {
    config: Config,
    launcher: Arc<dyn Launcher>,
    lib: Arc<dyn PmixLibrary>,
    running: Option<Running>,
}

impl Plugin {
    pub fn init(config: Config, launcher: Arc<dyn Launcher>, lib: Arc<dyn PmixLibrary>) -> Result<Self> {
        if Logger::init(config.log_level(), launcher.clone()).is_err() {
            log::debug!("a logger is already installed");
        }
        let (major, minor, release) = lib.version();
        if !SUPPORTED_MAJOR.contains(&major) {
            log::error!("PMIx v{}.{}.{} is not supported", major, minor, release);
            return Err(Error::NotSupported);
        }
        log::info!("using PMIx v{}.{}.{}", major, minor, release);
        Ok(Self {
            config,
            launcher,
            lib,
            running: None,
        })
    }

    pub fn step(&self) -> Option<&Arc<Step>> {
        self.running.as_ref().map(|r| &r.step)
    }

    /// Sets the step up on this node before any task is forked.
    pub fn prefork(&mut self, record: &StepRecord) -> Result<Arc<Step>> {
        if self.running.is_some() {
            return Err(Error::BadParam("a step is already running".into()));
        }
        let mut config = self.config.clone();
        config.apply_env(record.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        log::set_max_level(config.log_level());

        let job = JobInfo::new(record, &config)?;
        Logger::set_node(&job.hostname, job.nodeid);
        log::debug!(
            "prefork(step: {}.{}, nodes: {}, tasks: {}/{})",
            job.jobid,
            job.stepid,
            job.nnodes,
            job.node_tasks(),
            job.ntasks
        );

        stepio::dir::mkdir(&job.server_tmpdir, job.uid, job.gid)?;
        stepio::dir::mkdir(&job.lib_tmpdir, job.uid, job.gid)?;

        let socket = job.server_addr();
        let listener = stepio::net::unix_listen(&socket, libc::SOMAXCONN)?;
        std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o700))?;
        let (uid, gid) = (Uid::from_raw(job.uid), Gid::from_raw(job.gid));
        if Uid::effective() != uid {
            chown(&socket, Some(uid), Some(gid)).map_err(std::io::Error::from)?;
        }

        let transport = direct_transport(&config)?;
        let step = Step::new(job, config, self.launcher.clone(), self.lib.clone(), transport)?;
        self.lib
            .init_server(&step.job.lib_tmpdir, Module::new(step.clone()))?;
        module::job_set(&step)?;
        let agent = Agent::start(step.clone(), listener)?;

        if step.dconn.enabled() && step.config.policy.contains(Policy::DIRECT_CONN_EARLY) {
            let (me, n) = (step.job.nodeid, step.job.nnodes);
            let mut peers: Vec<u32> = topo::tree_topo(me, n, step.config.tree_width)
                .parent
                .into_iter()
                .collect();
            peers.push(topo::ring_neighbors(me, n).1);
            peers.dedup();
            dconn::connect_early(&step, &peers);
        }

        self.running = Some(Running {
            step: step.clone(),
            agent: Some(agent),
            socket,
        });
        Ok(step)
    }

    /// Environment for the task with global rank `rank`.
    pub fn fork_env(&self, rank: u32) -> Result<Vec<(String, String)>> {
        let step = self
            .step()
            .ok_or_else(|| Error::BadParam("no step is running".into()))?;
        let mut env = self.lib.setup_fork(&Proc::new(step.job.nspace.as_str(), rank))?;
        env.push((
            info::SERVER_TMPDIR_ENV.to_string(),
            step.job.lib_tmpdir.to_string_lossy().into_owned(),
        ));
        env.extend(step.config.env.iter().cloned());
        if step.config.debug > 0 {
            env.push(("PMIX_DEBUG".to_string(), step.config.debug.to_string()));
        }
        Ok(env)
    }

    pub fn fini(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let step = running.step;
        log::debug!("fini(step: {}.{})", step.job.jobid, step.job.stepid);
        if let Some(agent) = running.agent.take() {
            agent.stop();
        }
        self.lib.deregister_nspace(&step.job.nspace);
        let result = self.lib.finalize();
        if let Err(err) = &result {
            log::error!("library finalize failed: {}", err);
        }
        step.dconn.fini();
        for dir in [&step.job.server_tmpdir, &step.job.lib_tmpdir] {
            if let Err(err) = stepio::dir::rmdir_recursively(dir) {
                log::warn!("cannot remove {:?}: {}", dir, err);
            }
        }
        if let Err(err) = std::fs::remove_file(&running.socket) {
            log::debug!("cannot remove {:?}: {}", running.socket, err);
        }
        result
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if let Err(err) = self.fini() {
            log::error!("fini: {}", err);
        }
    }
}

enum Mapping {
    Packing,
    Ready(String),
}

/// Launcher side: packs the process map once per step. Components of a
/// heterogeneous step asking concurrently wait for the first one.
#[derive(Default)]
pub struct Prelaunch {
    maps: Mutex<HashMap<(u32, u32), Mapping>>,
    ready: Condvar,
}

impl Prelaunch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `(name, value)` pair exporting the process map of the step.
    pub fn client_prelaunch(&self, jobid: u32, stepid: u32, tasks: &[Vec<u32>]) -> Result<(String, String)> {
        let key = (jobid, stepid);
        let mut maps = self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match maps.get(&key) {
                Some(Mapping::Ready(map)) => return Ok((info::MAPPING_ENV.to_string(), map.clone())),
                Some(Mapping::Packing) => {
                    maps = self
                        .ready
                        .wait(maps)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                None => break,
            }
        }
        maps.insert(key, Mapping::Packing);
        drop(maps);

        let packed = mapping::pack(tasks);
        let mut maps = self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &packed {
            Ok(map) => maps.insert(key, Mapping::Ready(map.clone())),
            Err(_) => maps.remove(&key),
        };
        self.ready.notify_all();
        packed.map(|map| (info::MAPPING_ENV.to_string(), map))
    }
}
