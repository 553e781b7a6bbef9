//! A step spread over several in-process nodes.

#![allow(dead_code)]

use nix::unistd::{Gid, Uid};
use pmix_stepd::config::{Config, RetryPolicy};
use pmix_stepd::error::Status;
use pmix_stepd::hostlist;
use pmix_stepd::info::StepRecord;
use pmix_stepd::libpmix::ServerModule;
use pmix_stepd::local::{MockLibrary, UnixRelay};
use pmix_stepd::nspace::Proc;
use pmix_stepd::step::Step;
use pmix_stepd::Plugin;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(20);

static NEXT: AtomicU32 = AtomicU32::new(0);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        start_delay: Duration::from_millis(10),
        retries: 20,
        max_delay: Duration::from_millis(100),
    }
}

/// One rank per node.
pub fn one_each(nnodes: u32) -> Vec<Vec<u32>> {
    (0..nnodes).map(|n| vec![n]).collect()
}

pub struct Node {
    pub plugin: Plugin,
    pub lib: Arc<MockLibrary>,
}

pub struct Cluster {
    pub base: PathBuf,
    pub relay: Arc<UnixRelay>,
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub fn start(tasks: Vec<Vec<u32>>, config: Config) -> Self {
        Self::start_with_env(tasks, config, Vec::new())
    }

    pub fn start_with_env(tasks: Vec<Vec<u32>>, config: Config, env: Vec<(String, String)>) -> Self {
        init_logger();
        let config = config.with_retry(fast_retry());
        let base = std::env::temp_dir().join(format!(
            "pmix-stepd-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        let hosts: Vec<String> = (1..=tasks.len()).map(|i| format!("n{}", i)).collect();
        let relay = Arc::new(UnixRelay::new());
        let jobid = 1000 + NEXT.fetch_add(1, Ordering::SeqCst);

        let mut nodes = Vec::new();
        for (nodeid, host) in hosts.iter().enumerate() {
            let spool = base.join(host);
            std::fs::create_dir_all(&spool).unwrap();
            relay.add_host(host, &spool);
            let mut env = env.clone();
            env.push(("TMPDIR".into(), spool.to_string_lossy().into_owned()));

            let record = StepRecord {
                jobid,
                stepid: 0,
                uid: Uid::effective().as_raw(),
                gid: Gid::effective().as_raw(),
                hosts: hostlist::compress(&hosts),
                nodeid: nodeid as u32,
                tasks: tasks.clone(),
                spool,
                env,
            };
            let lib = Arc::new(MockLibrary::new());
            let mut plugin = Plugin::init(config.clone(), relay.clone(), lib.clone()).unwrap();
            plugin.prefork(&record).unwrap();
            nodes.push(Node { plugin, lib });
        }
        Self { base, relay, nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn step(&self, node: usize) -> Arc<Step> {
        self.nodes[node].plugin.step().unwrap().clone()
    }

    pub fn module(&self, node: usize) -> Arc<dyn ServerModule> {
        self.nodes[node].lib.module().unwrap()
    }

    pub fn nspace(&self) -> String {
        self.step(0).job.nspace.clone()
    }

    pub fn all(&self) -> Vec<Proc> {
        vec![Proc::wildcard(self.nspace())]
    }

    /// Runs one fence on every node, each contributing `data(node)`.
    pub fn fence(&self, collect: bool, data: impl Fn(usize) -> Vec<u8>) -> Vec<(Status, Vec<u8>)> {
        let (tx, rx) = mpsc::channel();
        for node in 0..self.len() {
            let tx = tx.clone();
            let status = self.module(node).fence_nb(
                &self.all(),
                collect,
                &data(node),
                Box::new(move |status, data| {
                    let _ = tx.send((node, status, data.to_vec()));
                }),
            );
            assert_eq!(status, Status::Success);
        }
        let mut results: Vec<_> = (0..self.len())
            .map(|_| rx.recv_timeout(WAIT).expect("fence did not complete"))
            .collect();
        results.sort_by_key(|r| r.0);
        results.into_iter().map(|(_, status, data)| (status, data)).collect()
    }

    /// Direct modex request from `node`, waited for.
    pub fn modex(&self, node: usize, proc: &Proc, wait: Duration) -> Option<(Status, Vec<u8>)> {
        let (tx, rx) = mpsc::channel();
        self.module(node).direct_modex(
            proc,
            Box::new(move |status, data| {
                let _ = tx.send((status, data.to_vec()));
            }),
        );
        rx.recv_timeout(wait).ok()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            let _ = node.plugin.fini();
        }
        let _ = std::fs::remove_dir_all(&self.base);
    }
}

/// Polls `cond` until it holds or `WAIT` runs out.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
