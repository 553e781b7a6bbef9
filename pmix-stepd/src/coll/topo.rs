//! Fan-in tree over the participant list.
//!
//! Peer 0 is the root. Every subtree covers a contiguous range of peer ids
//! rooted at its lowest id, and a node's children split the rest of its
//! range into at most `width` nearly equal parts. A pre-order walk therefore
//! visits peers in ascending order.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeTopo {
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    /// Every peer below this one.
    pub descendants: std::ops::Range<u32>,
}

/// Splits `lo+1..hi` into at most `width` contiguous chunks.
fn chunks(lo: u32, hi: u32, width: u32) -> Vec<std::ops::Range<u32>> {
    let rest = hi - lo - 1;
    let parts = width.max(1).min(rest);
    let mut out = Vec::with_capacity(parts as usize);
    let mut start = lo + 1;
    for i in 0..parts {
        let len = rest / parts + u32::from(i < rest % parts);
        out.push(start..start + len);
        start += len;
    }
    out
}

pub fn tree_topo(me: u32, n: u32, width: u32) -> TreeTopo {
    debug_assert!(me < n);
    let (mut lo, mut hi) = (0, n);
    let mut parent = None;
    while lo != me {
        let Some(sub) = chunks(lo, hi, width).into_iter().find(|c| c.contains(&me)) else {
            break;
        };
        parent = Some(lo);
        lo = sub.start;
        hi = sub.end;
    }
    TreeTopo {
        parent,
        children: chunks(lo, hi, width).iter().map(|c| c.start).collect(),
        descendants: lo + 1..hi,
    }
}

/// Previous and next peer on the ring.
pub fn ring_neighbors(me: u32, n: u32) -> (u32, u32) {
    ((me + n - 1) % n, (me + 1) % n)
}

#[cfg(test)]
mod test {
    use crate::coll::topo::*;

    #[test]
    fn four_nodes_fanout_two() {
        assert_eq!(
            tree_topo(0, 4, 2),
            TreeTopo {
                parent: None,
                children: vec![1, 3],
                descendants: 1..4
            }
        );
        assert_eq!(tree_topo(1, 4, 2).parent, Some(0));
        assert_eq!(tree_topo(1, 4, 2).children, vec![2]);
        assert_eq!(tree_topo(2, 4, 2).parent, Some(1));
        assert!(tree_topo(2, 4, 2).children.is_empty());
        assert_eq!(tree_topo(3, 4, 2).parent, Some(0));
    }

    #[test]
    fn every_peer_has_one_parent() {
        for n in 1..40 {
            for width in [1, 2, 3, 16] {
                let mut seen = vec![0u32; n as usize];
                for me in 0..n {
                    let topo = tree_topo(me, n, width);
                    assert!(topo.children.len() <= width as usize);
                    for &c in &topo.children {
                        assert_eq!(tree_topo(c, n, width).parent, Some(me));
                        seen[c as usize] += 1;
                    }
                    // children's subtrees tile the descendant range
                    let covered: u32 = topo
                        .children
                        .iter()
                        .map(|&c| tree_topo(c, n, width).descendants.len() as u32 + 1)
                        .sum();
                    assert_eq!(covered, topo.descendants.len() as u32);
                }
                assert_eq!(seen[0], 0);
                assert!(seen[1..].iter().all(|&s| s == 1));
            }
        }
    }

    #[test]
    fn single_node() {
        let topo = tree_topo(0, 1, 16);
        assert_eq!(topo.parent, None);
        assert!(topo.children.is_empty());
        assert!(topo.descendants.is_empty());
        assert_eq!(ring_neighbors(0, 1), (0, 0));
        assert_eq!(ring_neighbors(0, 3), (2, 1));
    }
}
