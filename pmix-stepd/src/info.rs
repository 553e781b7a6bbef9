//! Per-step job information, fixed for the lifetime of the step.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::{hostlist, mapping};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Environment variable the launcher uses to export the packed process map.
pub const MAPPING_ENV: &str = "SLURM_PMIX_MAPPING_SERV";
pub const ABORT_PORT_ENV: &str = "SLURM_PMIXP_ABORT_AGENT_PORT";
pub const COMM_HOST_ENV: &str = "SLURM_SRUN_COMM_HOST";
pub const SERVER_TMPDIR_ENV: &str = "PMIX_SERVER_TMPDIR";

/// What the launcher knows about the step when it hands it to the plugin.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub jobid: u32,
    pub stepid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Compressed host list of the step, in node id order.
    pub hosts: String,
    /// Index of this node in `hosts`.
    pub nodeid: u32,
    /// Global ranks hosted by every node.
    pub tasks: Vec<Vec<u32>>,
    /// Launcher spool directory of this node.
    pub spool: PathBuf,
    /// The job's environment.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub jobid: u32,
    pub stepid: u32,
    pub uid: u32,
    pub gid: u32,
    pub nspace: String,
    pub hostname: String,
    pub hosts: Vec<String>,
    pub nodeid: u32,
    pub nnodes: u32,
    pub ntasks: u32,
    /// Number of tasks on every node.
    pub task_cnts: Vec<u32>,
    /// Global ranks of the local tasks, indexed by local task id.
    pub gtids: Vec<u32>,
    pub task_map_packed: String,
    /// `rank -> nodeid`
    pub task_map: Vec<u32>,
    pub spool: PathBuf,
    /// Per-step directory private to the server.
    pub server_tmpdir: PathBuf,
    /// Per-step directory handed to the PMIx library.
    pub lib_tmpdir: PathBuf,
    /// Temporary directory base for clients.
    pub cli_tmpdir_base: PathBuf,
    pub abort_addr: Option<SocketAddr>,
}

impl JobInfo {
    pub fn new(record: &StepRecord, config: &Config) -> Result<Self> {
        let hosts = hostlist::expand(&record.hosts)?;
        let nnodes = hosts.len() as u32;
        if nnodes == 0 || record.tasks.len() != hosts.len() {
            return Err(Error::BadParam(format!(
                "{} hosts but {} task lists",
                hosts.len(),
                record.tasks.len()
            )));
        }
        let hostname = hosts
            .get(record.nodeid as usize)
            .cloned()
            .ok_or_else(|| Error::BadParam(format!("node id {} out of range", record.nodeid)))?;

        let task_cnts: Vec<u32> = record.tasks.iter().map(|t| t.len() as u32).collect();
        let ntasks = task_cnts.iter().sum();
        let task_map_packed = mapping::pack(&record.tasks)?;
        let task_map = mapping::unpack(&task_map_packed, nnodes, ntasks)?;

        let env = |name: &str| {
            record
                .env
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let tmp_base = config
            .tmpdir_base
            .clone()
            .or_else(|| env("TMPDIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/tmp"));

        let abort_addr = match (env(COMM_HOST_ENV), env(ABORT_PORT_ENV)) {
            (Some(host), Some(port)) => format!("{}:{}", host, port).parse().ok(),
            _ => None,
        };

        Ok(Self {
            jobid: record.jobid,
            stepid: record.stepid,
            uid: record.uid,
            gid: record.gid,
            nspace: format!("slurm.pmix.{}.{}", record.jobid, record.stepid),
            hostname,
            hosts,
            nodeid: record.nodeid,
            nnodes,
            ntasks,
            gtids: record.tasks[record.nodeid as usize].clone(),
            task_cnts,
            task_map_packed,
            task_map,
            spool: record.spool.clone(),
            server_tmpdir: record
                .spool
                .join(format!("pmix.{}.{}", record.jobid, record.stepid)),
            lib_tmpdir: tmp_base.join(format!(
                "spmix_appdir_{}_{}.{}",
                record.uid, record.jobid, record.stepid
            )),
            cli_tmpdir_base: tmp_base,
            abort_addr,
        })
    }

    pub fn node_tasks(&self) -> u32 {
        self.gtids.len() as u32
    }

    /// UNIX socket the launcher's forwarder delivers relayed frames to.
    pub fn server_addr(&self) -> PathBuf {
        self.spool
            .join(format!("stepd.slurm.pmix.{}.{}", self.jobid, self.stepid))
    }

    pub fn host(&self, nodeid: u32) -> Option<&str> {
        self.hosts.get(nodeid as usize).map(String::as_str)
    }

    pub fn nodeid_of(&self, host: &str) -> Option<u32> {
        self.hosts.iter().position(|h| h == host).map(|i| i as u32)
    }

    /// Local task id of global `rank`, if it runs here.
    pub fn local_id(&self, rank: u32) -> Option<u32> {
        self.gtids.iter().position(|&r| r == rank).map(|i| i as u32)
    }
}

#[cfg(test)]
mod test {
    use crate::config::Config;
    use crate::info::*;

    fn record(nodeid: u32) -> StepRecord {
        StepRecord {
            jobid: 42,
            stepid: 3,
            uid: 1000,
            gid: 1000,
            hosts: "n[1-3]".into(),
            nodeid,
            tasks: vec![vec![0, 1], vec![2, 3], vec![4]],
            spool: PathBuf::from("/var/spool/slurmd"),
            env: vec![
                (COMM_HOST_ENV.into(), "10.0.0.1".into()),
                (ABORT_PORT_ENV.into(), "4567".into()),
                ("TMPDIR".into(), "/scratch".into()),
            ],
        }
    }

    #[test]
    fn derives_layout() {
        let info = JobInfo::new(&record(1), &Config::default()).unwrap();
        assert_eq!(info.nspace, "slurm.pmix.42.3");
        assert_eq!(info.hostname, "n2");
        assert_eq!(info.ntasks, 5);
        assert_eq!(info.task_cnts.iter().sum::<u32>(), info.ntasks);
        assert!(info.task_map.iter().all(|&n| n < info.nnodes));
        assert_eq!(info.gtids, vec![2, 3]);
        assert_eq!(info.local_id(3), Some(1));
        assert_eq!(info.local_id(4), None);
        assert_eq!(
            info.server_addr(),
            PathBuf::from("/var/spool/slurmd/stepd.slurm.pmix.42.3")
        );
        assert_eq!(
            info.lib_tmpdir,
            PathBuf::from("/scratch/spmix_appdir_1000_42.3")
        );
        assert_eq!(info.abort_addr, Some("10.0.0.1:4567".parse().unwrap()));
    }

    #[test]
    fn config_tmpdir_wins() {
        let config = Config::default().with_tmpdir_base("/fast");
        let info = JobInfo::new(&record(0), &config).unwrap();
        assert!(info.lib_tmpdir.starts_with("/fast"));
    }

    #[test]
    fn mismatched_record() {
        let mut bad = record(0);
        bad.tasks.pop();
        assert!(JobInfo::new(&bad, &Config::default()).is_err());
        assert!(JobInfo::new(&record(7), &Config::default()).is_err());
    }
}
