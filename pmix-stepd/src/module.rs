//! The server module the PMIx library calls back into, and the job
//! registration done when the step starts.

use crate::coll::CollType;
use crate::config::{Config, FenceAlgo, Policy};
use crate::error::{Error, Result, Status};
use crate::libpmix::{keys, Callback, Info, ModexData, ServerModule};
use crate::nspace::Proc;
use crate::step::Step;
use crate::{abort, dmdx};
use std::sync::Arc;

pub struct Module {
    step: Arc<Step>,
}

impl Module {
    pub fn new(step: Arc<Step>) -> Arc<Self> {
        Arc::new(Self { step })
    }
}

/// Tree for barriers and empty contributions unless configured otherwise.
fn fence_type(config: &Config, collect: bool, ndata: usize) -> CollType {
    match config.fence {
        FenceAlgo::Tree => CollType::FenceTree,
        FenceAlgo::Ring => CollType::FenceRing,
        FenceAlgo::Auto if !collect || ndata == 0 => CollType::FenceTree,
        FenceAlgo::Auto => CollType::FenceRing,
    }
}

impl ServerModule for Module {
    fn client_connected(&self, proc: &Proc) -> Status {
        log::debug!("client {} connected", proc);
        Status::Success
    }

    fn client_finalized(&self, proc: &Proc) -> Status {
        log::debug!("client {} finalized", proc);
        Status::Success
    }

    fn abort(&self, proc: &Proc, status: i32, msg: &str, targets: &[Proc]) -> Status {
        log::error!("{} aborted with status {} ({} targets): {}", proc, status, targets.len(), msg);
        match self.step.job.abort_addr {
            Some(addr) => {
                if let Err(err) = abort::report(addr, status) {
                    log::error!("abort status lost: {}", err);
                }
            }
            None => log::warn!("no abort agent to report status {} to", status),
        }
        self.step.launcher.kill_step();
        Status::Success
    }

    fn fence_nb(&self, procs: &[Proc], collect: bool, data: &[u8], cb: Callback) -> Status {
        let config = &self.step.config;
        // barrier-only mode turns every fence into an empty one
        let collect = collect && !config.policy.contains(Policy::FENCE_BARRIER);
        let data = if collect { data } else { &[] };
        let ctype = fence_type(config, collect, data.len());
        log::debug!(
            "fence_nb(procs: {}, collect: {}, size: {}) as {:?}",
            procs.len(),
            collect,
            data.len(),
            ctype
        );
        match self.step.colls.get(&self.step, ctype, procs) {
            Ok(coll) => coll.local(&self.step, data, cb),
            Err(err) => {
                log::error!("fence over {} procs: {}", procs.len(), err);
                cb(Status::from(&err), ModexData::empty());
            }
        }
        Status::Success
    }

    fn direct_modex(&self, proc: &Proc, cb: Callback) -> Status {
        dmdx::get(&self.step, proc, cb);
        Status::Success
    }

    fn publish(&self, proc: &Proc, _info: &[Info]) -> Status {
        log::debug!("publish from {} is not supported", proc);
        Status::NotSupported
    }

    fn lookup(&self, proc: &Proc, _keys: &[String]) -> Status {
        log::debug!("lookup from {} is not supported", proc);
        Status::NotSupported
    }

    fn unpublish(&self, proc: &Proc, _keys: &[String]) -> Status {
        log::debug!("unpublish from {} is not supported", proc);
        Status::NotSupported
    }

    fn spawn(&self, proc: &Proc, _apps: &[Info]) -> Status {
        log::debug!("spawn from {} is not supported", proc);
        Status::NotSupported
    }

    fn connect(&self, _procs: &[Proc]) -> Status {
        Status::NotSupported
    }

    fn disconnect(&self, _procs: &[Proc]) -> Status {
        Status::NotSupported
    }

    fn job_control(&self, requestor: &Proc, _targets: &[Proc], _directives: &[Info]) -> Status {
        log::debug!("job control from {} is not supported", requestor);
        Status::NotSupported
    }

    fn error(&self, status: Status, msg: &str) {
        self.step
            .fatal(&Error::Internal(format!("library reported {:?}: {}", status, msg)));
    }
}

fn join<T: ToString>(items: impl IntoIterator<Item = T>, sep: &str) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

/// Everything the library tells clients about the job.
pub fn job_info(step: &Step) -> Result<Vec<Info>> {
    let job = &step.job;
    let ns = step
        .nspaces
        .find(&job.nspace)
        .ok_or_else(|| Error::InvalidNamespace(job.nspace.clone()))?;

    let mut info = vec![
        Info::str(keys::JOBID, job.nspace.as_str()),
        Info::u32(keys::NODEID, job.nodeid),
    ];
    for rank in 0..job.ntasks {
        let nodeid = ns.resolve(rank)?;
        let mut pdata = vec![
            Info::u32(keys::RANK, rank),
            Info::u32(keys::APPNUM, 0),
            Info::u32(keys::APPRANK, rank),
            Info::u32(keys::GLOBAL_RANK, rank),
        ];
        if let Some(lrank) = job.local_id(rank) {
            pdata.push(Info::u32(keys::LOCAL_RANK, lrank));
            pdata.push(Info::u32(keys::NODE_RANK, lrank));
        }
        pdata.push(Info::str(keys::HOSTNAME, step.host(nodeid)?));
        pdata.push(Info::u32(keys::NODEID, nodeid));
        info.push(Info::array(keys::PROC_DATA, pdata));
    }

    info.push(Info::u32(keys::UNIV_SIZE, job.ntasks));
    info.push(Info::u32(keys::JOB_SIZE, job.ntasks));
    info.push(Info::u32(keys::LOCAL_SIZE, job.node_tasks()));
    info.push(Info::u32(keys::NODE_SIZE, job.node_tasks()));
    info.push(Info::u32(keys::MAX_PROCS, job.ntasks));

    let node_map = step.lib.generate_regex(&job.hosts.join(","))?;
    let ppn = join((0..job.nnodes).map(|n| join(ns.node_ranks(n), ",")), ";");
    let proc_map = step.lib.generate_ppn(&ppn)?;
    info.push(Info::str(keys::NODE_MAP, node_map));
    info.push(Info::str(keys::PROC_MAP, proc_map));

    info.push(Info::str(keys::LOCAL_PEERS, join(&job.gtids, ",")));
    if let Some(&leader) = job.gtids.first() {
        info.push(Info::u32(keys::LOCALLDR, leader));
    }
    info.push(Info::str(keys::TMPDIR, job.cli_tmpdir_base.to_string_lossy()));
    info.push(Info::str(keys::NSDIR, job.lib_tmpdir.to_string_lossy()));
    Ok(info)
}

/// Registers the namespace and every local client with the library.
pub fn job_set(step: &Step) -> Result<()> {
    let job = &step.job;
    let info = job_info(step)?;
    log::debug!("registering {} with {} keys, {} local clients", job.nspace, info.len(), job.gtids.len());
    step.lib.register_nspace(&job.nspace, job.node_tasks(), info)?;
    for &rank in &job.gtids {
        step.lib
            .register_client(&Proc::new(job.nspace.as_str(), rank), job.uid, job.gid)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::config::Config;
    use crate::info::{JobInfo, StepRecord};
    use crate::libpmix::{Value, PmixLibrary};
    use crate::local::{MockLibrary, UnixRelay};
    use crate::module::*;
    use std::path::PathBuf;

    #[test]
    fn algorithm_selection() {
        let auto = Config::default();
        assert_eq!(fence_type(&auto, false, 10), CollType::FenceTree);
        assert_eq!(fence_type(&auto, true, 0), CollType::FenceTree);
        assert_eq!(fence_type(&auto, true, 10), CollType::FenceRing);
        let tree = Config::default().with_fence(FenceAlgo::Tree);
        assert_eq!(fence_type(&tree, true, 10), CollType::FenceTree);
        let ring = Config::default().with_fence(FenceAlgo::Ring);
        assert_eq!(fence_type(&ring, false, 0), CollType::FenceRing);
    }

    fn step(lib: Arc<MockLibrary>) -> Arc<Step> {
        let record = StepRecord {
            jobid: 7,
            stepid: 0,
            uid: 1000,
            gid: 1000,
            hosts: "n[1-2]".into(),
            nodeid: 1,
            tasks: vec![vec![0, 1], vec![2]],
            spool: PathBuf::from("/nonexistent"),
            env: Vec::new(),
        };
        let config = Config::default();
        let job = JobInfo::new(&record, &config).unwrap();
        let relay = Arc::new(UnixRelay::new());
        Step::new(job, config, relay, lib, None).unwrap()
    }

    #[test]
    fn registers_job() {
        let lib = Arc::new(MockLibrary::new());
        let step = step(lib.clone());
        job_set(&step).unwrap();

        let (nspace, nlocal, info) = lib.nspaces().pop().unwrap();
        assert_eq!(nspace, "slurm.pmix.7.0");
        assert_eq!(nlocal, 1);
        let get = |key: &str| info.iter().find(|i| i.key == key).map(|i| i.value.clone());
        assert_eq!(get(keys::JOB_SIZE), Some(Value::U32(3)));
        assert_eq!(get(keys::LOCAL_SIZE), Some(Value::U32(1)));
        assert_eq!(get(keys::PROC_MAP), Some(Value::Str("0,1;2".into())));
        assert_eq!(get(keys::NODE_MAP), Some(Value::Str("n1,n2".into())));
        assert_eq!(get(keys::LOCAL_PEERS), Some(Value::Str("2".into())));
        assert_eq!(get(keys::LOCALLDR), Some(Value::U32(2)));

        let pdata: Vec<_> = info.iter().filter(|i| i.key == keys::PROC_DATA).collect();
        assert_eq!(pdata.len(), 3);
        let Value::Array(local) = &pdata[2].value else { panic!("proc data is not an array") };
        assert!(local.contains(&Info::u32(keys::LOCAL_RANK, 0)));
        assert!(local.contains(&Info::str(keys::HOSTNAME, "n2")));
        let Value::Array(remote) = &pdata[0].value else { panic!("proc data is not an array") };
        assert!(!remote.iter().any(|i| i.key == keys::LOCAL_RANK));

        assert_eq!(lib.clients(), vec![Proc::new("slurm.pmix.7.0", 2)]);
    }

    #[test]
    fn unsupported_calls() {
        let lib = Arc::new(MockLibrary::new());
        let module = Module::new(step(lib.clone()));
        let me = Proc::new("slurm.pmix.7.0", 2);
        assert_eq!(module.client_connected(&me), Status::Success);
        assert_eq!(module.publish(&me, &[]), Status::NotSupported);
        assert_eq!(module.lookup(&me, &["k".into()]), Status::NotSupported);
        assert_eq!(module.spawn(&me, &[]), Status::NotSupported);
        assert_eq!(module.connect(&[me.clone()]), Status::NotSupported);
        assert_eq!(module.job_control(&me, &[], &[]), Status::NotSupported);
        assert_eq!(lib.version().0, 4);
    }

    #[test]
    fn fence_outside_step_fails_through_callback() {
        let lib = Arc::new(MockLibrary::new());
        let module = Module::new(step(lib));
        let (tx, rx) = std::sync::mpsc::channel();
        let status = module.fence_nb(
            &[Proc::new("slurm.pmix.7.0", 0)],
            true,
            b"x",
            Box::new(move |status, _| tx.send(status).unwrap()),
        );
        assert_eq!(status, Status::Success);
        assert_eq!(rx.recv().unwrap(), Status::BadParam);
    }
}
