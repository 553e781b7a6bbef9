//! The launcher's packed process map.
//!
//! `(vector,(start,count,depth),...)` means: walking global ranks upward,
//! each of `count` nodes starting at `start` receives the next `depth`
//! ranks, then the next block applies.

use crate::error::{Error, Result};

/// Packs `tasks[node]`, the sorted global ranks of every node.
pub fn pack(tasks: &[Vec<u32>]) -> Result<String> {
    let ntasks: usize = tasks.iter().map(Vec::len).sum();
    let mut next = vec![0usize; tasks.len()];
    let mut offset = 0u32;
    let mut out = String::from("(vector");

    while (offset as usize) < ntasks {
        let start = tasks
            .iter()
            .zip(&next)
            .position(|(ranks, &n)| ranks.get(n) == Some(&offset))
            .ok_or_else(|| Error::BadParam(format!("rank {} is not mapped to any node", offset)))?;

        let mut depth = None;
        let mut count = 0;
        for node in start..tasks.len() {
            let ranks = &tasks[node];
            let first = next[node];
            if ranks.get(first) != Some(&offset) {
                break;
            }
            let mut run = 1;
            while first + run < ranks.len() && ranks[first + run] == offset + run as u32 {
                run += 1;
            }
            match depth {
                None => depth = Some(run),
                Some(d) if d == run => {}
                Some(d) if run > d => run = d,
                Some(_) => break,
            }
            next[node] += run;
            offset += run as u32;
            count += 1;
        }
        let depth = depth.unwrap_or_default();
        out.push_str(&format!(",({},{},{})", start, count, depth));
    }

    out.push(')');
    Ok(out)
}

fn triples(map: &str) -> Result<Vec<(u32, u32, u32)>> {
    let bad = || Error::BadParam(format!("malformed process map {:?}", map));
    let body = map
        .trim()
        .strip_prefix("(vector")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(bad)?;

    let mut out = Vec::new();
    for item in body.split('(').skip(1) {
        let item = item.trim_end_matches([',', ')', ' ']);
        let nums: Vec<u32> = item
            .split(',')
            .map(|n| n.trim().parse().map_err(|_| bad()))
            .collect::<Result<_>>()?;
        match nums[..] {
            [start, count, depth] => out.push((start, count, depth)),
            _ => return Err(bad()),
        }
    }
    Ok(out)
}

/// Expands a packed map into `rank -> node`.
pub fn unpack(map: &str, nnodes: u32, ntasks: u32) -> Result<Vec<u32>> {
    let mut task_map = Vec::with_capacity(ntasks as usize);
    for (start, count, depth) in triples(map)? {
        if start.checked_add(count).map_or(true, |end| end > nnodes) {
            return Err(Error::BadParam(format!(
                "process map block ({},{},{}) exceeds {} nodes",
                start, count, depth, nnodes
            )));
        }
        for node in start..start + count {
            task_map.extend(std::iter::repeat(node).take(depth as usize));
        }
    }
    if task_map.len() != ntasks as usize {
        return Err(Error::BadParam(format!(
            "process map covers {} ranks, expected {}",
            task_map.len(),
            ntasks
        )));
    }
    Ok(task_map)
}

#[cfg(test)]
mod test {
    use crate::mapping::*;

    #[test]
    fn block_distribution() {
        let tasks = vec![vec![0, 1], vec![2, 3], vec![4]];
        let map = pack(&tasks).unwrap();
        assert_eq!(map, "(vector,(0,2,2),(2,1,1))");
        assert_eq!(unpack(&map, 3, 5).unwrap(), vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn cyclic_distribution() {
        let tasks = vec![vec![0, 2, 4], vec![1, 3]];
        let map = pack(&tasks).unwrap();
        assert_eq!(map, "(vector,(0,2,1),(0,2,1),(0,1,1))");
        assert_eq!(unpack(&map, 2, 5).unwrap(), vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn uneven_runs_split() {
        let tasks = vec![vec![0, 1, 2], vec![3], vec![4, 5]];
        let map = pack(&tasks).unwrap();
        let task_map = unpack(&map, 3, 6).unwrap();
        assert_eq!(task_map, vec![0, 0, 0, 1, 2, 2]);
    }

    #[test]
    fn rejects_inconsistent() {
        assert!(pack(&[vec![0], vec![2]]).is_err());
        assert!(unpack("(vector,(0,2,2))", 1, 4).is_err());
        assert!(unpack("(vector,(0,2,2))", 2, 3).is_err());
        assert!(unpack("(plane,(0,1,1))", 1, 1).is_err());
    }
}
