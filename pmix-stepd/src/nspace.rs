//! Namespace table: which node hosts which rank.

use crate::error::{Error, Result};
use crate::info::JobInfo;
use std::sync::{Arc, Mutex};

/// Matches every rank of a namespace (`PMIX_RANK_WILDCARD`).
pub const WILDCARD: u32 = u32::MAX - 1;

/// A PMIx process name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Proc {
    pub nspace: String,
    pub rank: u32,
}

impl Proc {
    pub fn new(nspace: impl Into<String>, rank: u32) -> Self {
        Self {
            nspace: nspace.into(),
            rank,
        }
    }

    pub fn wildcard(nspace: impl Into<String>) -> Self {
        Self::new(nspace, WILDCARD)
    }
}

impl std::fmt::Display for Proc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.rank == WILDCARD {
            write!(f, "{}:*", self.nspace)
        } else {
            write!(f, "{}:{}", self.nspace, self.rank)
        }
    }
}

#[derive(Debug)]
pub struct Nspace {
    pub name: String,
    pub nnodes: u32,
    /// This node's index.
    pub nodeid: u32,
    pub ntasks: u32,
    pub task_cnts: Vec<u32>,
    pub task_map_packed: String,
    pub task_map: Vec<u32>,
    pub hosts: Vec<String>,
}

impl Nspace {
    pub fn new(
        name: String,
        nodeid: u32,
        hosts: Vec<String>,
        task_map_packed: String,
        task_map: Vec<u32>,
    ) -> Result<Self> {
        let nnodes = hosts.len() as u32;
        let mut task_cnts = vec![0u32; hosts.len()];
        for (rank, &node) in task_map.iter().enumerate() {
            let cnt = task_cnts.get_mut(node as usize).ok_or_else(|| {
                Error::BadParam(format!("rank {} mapped to node {} of {}", rank, node, nnodes))
            })?;
            *cnt += 1;
        }
        if nodeid >= nnodes {
            return Err(Error::BadParam(format!("node id {} of {}", nodeid, nnodes)));
        }
        Ok(Self {
            name,
            nnodes,
            nodeid,
            ntasks: task_map.len() as u32,
            task_cnts,
            task_map_packed,
            task_map,
            hosts,
        })
    }

    pub fn from_job(job: &JobInfo) -> Result<Self> {
        Self::new(
            job.nspace.clone(),
            job.nodeid,
            job.hosts.clone(),
            job.task_map_packed.clone(),
            job.task_map.clone(),
        )
    }

    pub fn resolve(&self, rank: u32) -> Result<u32> {
        self.task_map.get(rank as usize).copied().ok_or_else(|| {
            Error::BadParam(format!("rank {} out of range in {}", rank, self.name))
        })
    }

    /// Ranks hosted by `nodeid`.
    pub fn node_ranks(&self, nodeid: u32) -> Vec<u32> {
        self.task_map
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == nodeid)
            .map(|(r, _)| r as u32)
            .collect()
    }
}

#[derive(Default)]
pub struct NspaceTable {
    inner: Mutex<Vec<Arc<Nspace>>>,
}

impl NspaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Nspace>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, nspace: Nspace) -> Result<Arc<Nspace>> {
        let mut table = self.lock();
        if table.iter().any(|ns| ns.name == nspace.name) {
            return Err(Error::BadParam(format!("namespace {} already registered", nspace.name)));
        }
        let nspace = Arc::new(nspace);
        table.push(nspace.clone());
        Ok(nspace)
    }

    pub fn find(&self, name: &str) -> Option<Arc<Nspace>> {
        self.lock().iter().find(|ns| ns.name == name).cloned()
    }

    fn get(&self, name: &str) -> Result<Arc<Nspace>> {
        self.find(name)
            .ok_or_else(|| Error::InvalidNamespace(name.to_string()))
    }

    /// The namespace of this step, registered first.
    pub fn local(&self) -> Option<Arc<Nspace>> {
        self.lock().first().cloned()
    }

    pub fn resolve(&self, name: &str, rank: u32) -> Result<u32> {
        self.get(name)?.resolve(rank)
    }

    /// Hosts owning any of `procs`, each once, ordered by node id.
    pub fn rankhosts(&self, procs: &[Proc]) -> Result<Vec<String>> {
        let mut nodes: Vec<(u32, String)> = Vec::new();
        for proc in procs {
            let ns = self.get(&proc.nspace)?;
            let ids = if proc.rank == WILDCARD {
                (0..ns.nnodes).filter(|&n| ns.task_cnts[n as usize] > 0).collect()
            } else {
                vec![ns.resolve(proc.rank)?]
            };
            for id in ids {
                if !nodes.iter().any(|(n, _)| *n == id) {
                    nodes.push((id, ns.hosts[id as usize].clone()));
                }
            }
        }
        nodes.sort();
        Ok(nodes.into_iter().map(|(_, host)| host).collect())
    }

    /// Whether any process in `procs` runs on this node.
    pub fn belongs_local(&self, procs: &[Proc]) -> bool {
        procs.iter().any(|proc| match self.find(&proc.nspace) {
            Some(ns) if proc.rank == WILDCARD => ns.task_cnts[ns.nodeid as usize] > 0,
            Some(ns) => ns.resolve(proc.rank).map_or(false, |node| node == ns.nodeid),
            None => false,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::nspace::*;

    fn table(nodeid: u32) -> NspaceTable {
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let table = NspaceTable::new();
        let map = crate::mapping::unpack("(vector,(0,2,2),(2,1,1))", 3, 5).unwrap();
        table
            .add(Nspace::new("ns1".into(), nodeid, hosts, "(vector,(0,2,2),(2,1,1))".into(), map).unwrap())
            .unwrap();
        table
    }

    #[test]
    fn resolve_ranks() {
        let table = table(0);
        let ns = table.local().unwrap();
        assert_eq!(ns.task_cnts.iter().sum::<u32>(), ns.ntasks);
        assert_eq!(table.resolve("ns1", 3).unwrap(), 1);
        assert_eq!(table.resolve("ns1", 4).unwrap(), 2);
        assert!(matches!(table.resolve("ns1", 5), Err(Error::BadParam(_))));
        assert!(matches!(table.resolve("ns2", 0), Err(Error::InvalidNamespace(_))));
        assert_eq!(ns.node_ranks(1), vec![2, 3]);
    }

    #[test]
    fn rankhosts_and_locality() {
        let table = table(1);
        assert_eq!(
            table.rankhosts(&[Proc::wildcard("ns1")]).unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            table.rankhosts(&[Proc::new("ns1", 4), Proc::new("ns1", 0), Proc::new("ns1", 1)]).unwrap(),
            vec!["a", "c"]
        );
        assert!(table.belongs_local(&[Proc::wildcard("ns1")]));
        assert!(table.belongs_local(&[Proc::new("ns1", 2)]));
        assert!(!table.belongs_local(&[Proc::new("ns1", 0), Proc::new("ns1", 4)]));
        assert!(!table.belongs_local(&[Proc::wildcard("other")]));
    }

    #[test]
    fn duplicate_registration() {
        let table = table(0);
        let again = Nspace::new("ns1".into(), 0, vec!["a".into()], String::new(), vec![0]).unwrap();
        assert!(table.add(again).is_err());
        assert!(Nspace::new("x".into(), 0, vec!["a".into()], String::new(), vec![3]).is_err());
    }
}
