use nix::unistd::{Gid, Uid};
use pmix_stepd::config::{Config, RetryPolicy};
use pmix_stepd::error::Status;
use pmix_stepd::info::StepRecord;
use pmix_stepd::libpmix::ServerModule;
use pmix_stepd::local::{MockLibrary, UnixRelay};
use pmix_stepd::nspace::Proc;
use pmix_stepd::Plugin;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const HOSTS: [&str; 3] = ["n1", "n2", "n3"];
const WAIT: Duration = Duration::from_secs(30);

fn record(base: &Path, nodeid: u32) -> StepRecord {
    let spool = base.join(HOSTS[nodeid as usize]);
    StepRecord {
        jobid: 100,
        stepid: 0,
        uid: Uid::effective().as_raw(),
        gid: Gid::effective().as_raw(),
        hosts: "n[1-3]".into(),
        nodeid,
        tasks: vec![vec![0, 1], vec![2, 3], vec![4]],
        spool: spool.clone(),
        env: vec![("TMPDIR".into(), spool.to_string_lossy().into_owned())],
    }
}

fn fence(modules: &[Arc<dyn ServerModule>], nspace: &str, collect: bool) -> Vec<(usize, Status, Vec<u8>)> {
    let (tx, rx) = mpsc::channel();
    for (node, module) in modules.iter().enumerate() {
        let tx = tx.clone();
        let data = format!("node{};", node).into_bytes();
        module.fence_nb(
            &[Proc::wildcard(nspace)],
            collect,
            &data,
            Box::new(move |status, data| {
                let _ = tx.send((node, status, data.to_vec()));
            }),
        );
    }
    let mut results = Vec::new();
    for _ in modules {
        match rx.recv_timeout(WAIT) {
            Ok(result) => results.push(result),
            Err(err) => {
                println!("fence incomplete: {}", err);
                break;
            }
        }
    }
    results.sort_by_key(|r| r.0);
    results
}

fn main() {
    let base = std::env::temp_dir().join(format!("pmix-demo-{}", std::process::id()));
    let relay = Arc::new(UnixRelay::new());
    let config = Config::default().with_debug(1).with_retry(RetryPolicy {
        start_delay: Duration::from_millis(20),
        retries: 10,
        max_delay: Duration::from_millis(200),
    });

    let mut nodes = Vec::new();
    for (nodeid, host) in HOSTS.iter().enumerate() {
        let spool = base.join(host);
        std::fs::create_dir_all(&spool).unwrap();
        relay.add_host(host, &spool);

        let lib = Arc::new(MockLibrary::new());
        let mut plugin = Plugin::init(config.clone(), relay.clone(), lib.clone()).unwrap();
        plugin.prefork(&record(&base, nodeid as u32)).unwrap();
        nodes.push((plugin, lib));
    }
    let nspace = nodes[0].0.step().unwrap().job.nspace.clone();
    let modules: Vec<Arc<dyn ServerModule>> = nodes.iter().map(|(_, lib)| lib.module().unwrap()).collect();

    for (node, status, data) in fence(&modules, &nspace, true) {
        println!("ring fence on node {}: {:?} {:?}", node, status, String::from_utf8_lossy(&data));
    }
    for (node, status, data) in fence(&modules, &nspace, false) {
        println!("tree barrier on node {}: {:?}, {} bytes", node, status, data.len());
    }

    let target = Proc::new(nspace.as_str(), 4);
    nodes[2].1.commit(&target, b"rank4-card");
    let (tx, rx) = mpsc::channel();
    modules[0].direct_modex(
        &target,
        Box::new(move |status, data| {
            let _ = tx.send((status, data.to_vec()));
        }),
    );
    match rx.recv_timeout(WAIT) {
        Ok((status, data)) => println!("direct modex for {}: {:?} {:?}", target, status, String::from_utf8_lossy(&data)),
        Err(err) => println!("direct modex for {}: {}", target, err),
    }

    for (mut plugin, _) in nodes {
        plugin.fini().unwrap();
    }
    std::fs::remove_dir_all(&base).unwrap();
}
