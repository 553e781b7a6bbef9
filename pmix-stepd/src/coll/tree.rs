//! Tree fence: contributions are gathered toward the root and the result is
//! pushed back down.
//!
//! ```text
//! SYNC -> COLLECT -> UPFWD --------------------------> DOWNFWD -> SYNC
//!                 \-> UPFWD_WSC -> UPFWD_WPC ---------/
//! ```
//!
//! With direct connections every node forwards the result to its children.
//! Over the relay only the root broadcasts, to the whole step at once, so
//! non-root nodes wait for their upward send to complete (WSC) and then for
//! the root's broadcast (WPC).

use crate::coll::topo::tree_topo;
use crate::coll::{Action, CollInfo, Completion};
use crate::error::{Error, Result, Status};
use crate::libpmix::Callback;
use crate::proto::MsgType;
use crate::server::Endpoint;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Sync,
    Collect,
    Upfwd,
    /// Waiting for the upward send to complete.
    UpfwdWsc,
    /// Waiting for the parent's contribution.
    UpfwdWpc,
    Downfwd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwdStatus {
    None,
    Active,
    Done,
    Failed,
}

pub struct Tree {
    seq: u32,
    gen: u64,
    state: TreeState,
    ts: Instant,

    parent: Option<u32>,
    children: Vec<u32>,
    descendants: Vec<u32>,

    contrib_local: bool,
    local: Vec<u8>,
    contrib_children: u32,
    child_data: Vec<Option<Vec<u8>>>,
    /// Next-round child contributions that arrived while the upward buffers
    /// were still in use.
    early: Vec<(usize, Vec<u8>)>,
    ufwd_status: FwdStatus,

    contrib_parent: bool,
    dfwd_data: Vec<u8>,
    dfwd_status: FwdStatus,
    dfwd_cb_wait: u32,
    dfwd_cb_cnt: u32,

    cb: Option<Callback>,
}

impl Tree {
    pub fn new(info: &CollInfo, width: u32) -> Self {
        let topo = tree_topo(info.me, info.size(), width);
        log::debug!(
            "tree fence: peer {} of {}, parent {:?}, children {:?}",
            info.me,
            info.size(),
            topo.parent,
            topo.children
        );
        Self {
            seq: 0,
            gen: 0,
            state: TreeState::Sync,
            ts: Instant::now(),
            parent: topo.parent,
            child_data: vec![None; topo.children.len()],
            children: topo.children,
            descendants: topo.descendants.collect(),
            contrib_local: false,
            local: Vec::new(),
            contrib_children: 0,
            early: Vec::new(),
            ufwd_status: FwdStatus::None,
            contrib_parent: false,
            dfwd_data: Vec::new(),
            dfwd_status: FwdStatus::None,
            dfwd_cb_wait: 0,
            dfwd_cb_cnt: 0,
            cb: None,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    fn reset_ufwd(&mut self) {
        self.contrib_local = false;
        self.local.clear();
        self.contrib_children = 0;
        self.child_data.iter_mut().for_each(|d| *d = None);
        self.ufwd_status = FwdStatus::None;
    }

    fn reset_dfwd(&mut self) {
        self.contrib_parent = false;
        self.dfwd_data = Vec::new();
        self.dfwd_status = FwdStatus::None;
        self.dfwd_cb_wait = 0;
        self.dfwd_cb_cnt = 0;
    }

    /// Moves child contributions stashed during the upward send into the
    /// freshly reset buffers.
    fn replay_early(&mut self) {
        for (idx, data) in std::mem::take(&mut self.early) {
            if self.child_data[idx].is_none() {
                self.child_data[idx] = Some(data);
                self.contrib_children += 1;
            }
        }
    }

    /// Closes the current round.
    fn reset(&mut self) {
        self.gen += 1;
        self.seq = self.seq.wrapping_add(1);
        match self.state {
            TreeState::Sync | TreeState::Collect | TreeState::Upfwd | TreeState::UpfwdWsc => {
                self.state = TreeState::Sync;
                self.reset_ufwd();
                self.reset_dfwd();
                self.cb = None;
            }
            TreeState::UpfwdWpc | TreeState::Downfwd => {
                self.reset_dfwd();
                // the next round may have started already
                if self.contrib_local || self.contrib_children > 0 {
                    self.state = TreeState::Collect;
                    self.ts = Instant::now();
                } else {
                    self.state = TreeState::Sync;
                }
            }
        }
    }

    /// Abandons the round and moves on to the next seq, unlike a timeout.
    fn abort(&mut self, err: Error, actions: &mut Vec<Action>) {
        log::error!("tree fence round {} failed in {:?}: {}", self.seq, self.state, err);
        if let Some(cb) = self.cb.take() {
            actions.push(Action::fail(cb, &err));
        }
        self.reset();
        self.reset_ufwd();
        self.early.clear();
        self.state = TreeState::Sync;
        actions.push(Action::Fatal(err));
    }

    pub fn fail(&mut self, err: Error) -> Vec<Action> {
        let mut actions = Vec::new();
        self.abort(err, &mut actions);
        actions
    }

    pub fn local(&mut self, info: &CollInfo, data: &[u8], cb: Callback) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            TreeState::Sync => self.ts = Instant::now(),
            TreeState::Collect | TreeState::Downfwd => {}
            state => {
                let err = Error::ProtocolViolation(format!("local contribution in {:?}", state));
                log::error!("tree fence round {}: {}", self.seq, err);
                actions.push(Action::fail(cb, &err));
                return actions;
            }
        }
        if self.contrib_local {
            let err = Error::BadParam("double local contribution".into());
            log::error!("tree fence round {}: {}", self.seq, err);
            actions.push(Action::fail(cb, &err));
            return actions;
        }
        self.contrib_local = true;
        self.local = data.to_vec();
        self.cb = Some(cb);
        self.progress(info, &mut actions);
        actions
    }

    pub fn child(&mut self, info: &CollInfo, peer: u32, seq: u32, data: &[u8]) -> Result<Vec<Action>> {
        let idx = self
            .children
            .iter()
            .position(|&c| c == peer)
            .ok_or_else(|| Error::ProtocolViolation(format!("peer {} is not a child", peer)))?;
        let next = self.seq.wrapping_add(1);

        match self.state {
            TreeState::Sync | TreeState::Collect if seq == self.seq => {
                if self.state == TreeState::Sync {
                    self.ts = Instant::now();
                }
            }
            TreeState::Upfwd | TreeState::UpfwdWsc if seq == next => {
                log::debug!("tree fence: child {} started round {} early", peer, seq);
                if !self.early.iter().any(|(i, _)| *i == idx) {
                    self.early.push((idx, data.to_vec()));
                }
                return Ok(Vec::new());
            }
            TreeState::UpfwdWpc | TreeState::Downfwd if seq == next => {}
            TreeState::Upfwd | TreeState::UpfwdWsc | TreeState::UpfwdWpc | TreeState::Downfwd
                if seq == self.seq =>
            {
                // every child is in once we leave Collect
                log::debug!("tree fence: duplicate contribution of child {} to round {}", peer, seq);
                return Ok(Vec::new());
            }
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "child {} sent round {} while round {} is in {:?}",
                    peer, seq, self.seq, state
                )))
            }
        }

        if self.child_data[idx].is_some() {
            log::debug!("tree fence: duplicate contribution of child {} to round {}", peer, seq);
            return Ok(Vec::new());
        }
        self.child_data[idx] = Some(data.to_vec());
        self.contrib_children += 1;

        let mut actions = Vec::new();
        self.progress(info, &mut actions);
        Ok(actions)
    }

    pub fn parent(&mut self, info: &CollInfo, peer: u32, seq: u32, data: &[u8]) -> Result<Vec<Action>> {
        if Some(peer) != self.parent && peer != 0 {
            return Err(Error::ProtocolViolation(format!(
                "peer {} is neither the parent nor the root",
                peer
            )));
        }
        match self.state {
            TreeState::Upfwd | TreeState::UpfwdWsc | TreeState::UpfwdWpc if seq == self.seq => {}
            TreeState::Downfwd if seq == self.seq => {
                log::debug!("tree fence: duplicate result of round {}", seq);
                return Ok(Vec::new());
            }
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "parent sent round {} while round {} is in {:?}",
                    seq, self.seq, state
                )))
            }
        }
        if self.contrib_parent {
            log::debug!("tree fence: duplicate result of round {}", seq);
            return Ok(Vec::new());
        }
        self.contrib_parent = true;
        self.dfwd_data = data.to_vec();

        let mut actions = Vec::new();
        self.progress(info, &mut actions);
        Ok(actions)
    }

    pub fn complete(&mut self, info: &CollInfo, c: Completion, result: Result<()>) -> Vec<Action> {
        let gen = match c {
            Completion::TreeUp(gen) | Completion::TreeDown(gen) | Completion::TreeLocal(gen) => gen,
            Completion::RingForward { .. } => return Vec::new(),
        };
        if gen != self.gen {
            log::debug!("tree fence: stale {:?} in round {}", c, self.seq);
            return Vec::new();
        }
        match (c, result) {
            (Completion::TreeUp(_), Ok(())) => self.ufwd_status = FwdStatus::Done,
            (Completion::TreeUp(_), Err(err)) => {
                log::error!("tree fence round {}: upward send failed: {}", self.seq, err);
                self.ufwd_status = FwdStatus::Failed;
            }
            (_, Ok(())) => self.dfwd_cb_cnt += 1,
            (_, Err(err)) => {
                log::error!("tree fence round {}: downward send failed: {}", self.seq, err);
                self.dfwd_status = FwdStatus::Failed;
            }
        }
        let mut actions = Vec::new();
        self.progress(info, &mut actions);
        actions
    }

    pub fn reset_if_timeout(&mut self, now: Instant, timeout: Duration) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == TreeState::Sync || now.saturating_duration_since(self.ts) <= timeout {
            return actions;
        }
        log::error!(
            "tree fence round {} timed out in {:?} after {:?}",
            self.seq,
            self.state,
            timeout
        );
        if let Some(cb) = self.cb.take() {
            actions.push(Action::fail(cb, &Error::Timeout));
        }
        self.gen += 1;
        self.reset_ufwd();
        self.reset_dfwd();
        self.early.clear();
        self.state = TreeState::Sync;
        actions
    }

    fn progress(&mut self, info: &CollInfo, actions: &mut Vec<Action>) {
        loop {
            let advanced = match self.state {
                TreeState::Sync => {
                    if self.contrib_local || self.contrib_children > 0 {
                        self.state = TreeState::Collect;
                        true
                    } else {
                        false
                    }
                }
                TreeState::Collect => self.progress_collect(info, actions),
                TreeState::Upfwd => self.progress_ufwd(info, actions),
                TreeState::UpfwdWsc => self.progress_ufwd_sc(actions),
                TreeState::UpfwdWpc => self.progress_ufwd_wpc(info, actions),
                TreeState::Downfwd => self.progress_dfwd(actions),
            };
            if !advanced {
                break;
            }
        }
    }

    fn progress_collect(&mut self, info: &CollInfo, actions: &mut Vec<Action>) -> bool {
        if !self.contrib_local || self.contrib_children as usize != self.children.len() {
            return false;
        }

        // participant order: ours first, then each child's subtree
        let mut data = self.local.clone();
        for child in self.child_data.iter().flatten() {
            data.extend_from_slice(child);
        }

        match self.parent {
            Some(parent) => {
                self.state = if info.direct {
                    TreeState::Upfwd
                } else {
                    TreeState::UpfwdWsc
                };
                self.ufwd_status = FwdStatus::Active;
                let mut buf = info.key_buf(data.len());
                buf.put_raw(&data);
                log::debug!(
                    "tree fence round {}: {} bytes up to peer {}",
                    self.seq,
                    data.len(),
                    parent
                );
                actions.push(Action::Send {
                    ep: Endpoint::NodeId(info.node(parent)),
                    mtype: MsgType::FanIn,
                    seq: self.seq,
                    buf,
                    done: Some(Completion::TreeUp(self.gen)),
                });
            }
            None => {
                self.state = TreeState::Upfwd;
                self.ufwd_status = FwdStatus::Done;
                self.contrib_parent = true;
                self.dfwd_data = data;
            }
        }
        true
    }

    fn fanout(&self, info: &CollInfo, ep: Endpoint) -> Action {
        let mut buf = info.key_buf(self.dfwd_data.len());
        buf.put_raw(&self.dfwd_data);
        Action::Send {
            ep,
            mtype: MsgType::FanOut,
            seq: self.seq,
            buf,
            done: Some(Completion::TreeDown(self.gen)),
        }
    }

    fn start_dfwd(&mut self, info: &CollInfo, actions: &mut Vec<Action>) {
        self.state = TreeState::Downfwd;
        self.dfwd_status = FwdStatus::Active;
        self.dfwd_cb_wait = 0;
        self.dfwd_cb_cnt = 0;

        if info.direct {
            for &child in &self.children {
                actions.push(self.fanout(info, Endpoint::NodeId(info.node(child))));
                self.dfwd_cb_wait += 1;
            }
        } else if self.parent.is_none() && !self.descendants.is_empty() {
            let hosts = self
                .descendants
                .iter()
                .map(|&peer| info.peers[peer as usize].clone())
                .collect();
            actions.push(self.fanout(info, Endpoint::HostList(hosts)));
            self.dfwd_cb_wait += 1;
        }

        if let Some(cb) = self.cb.take() {
            self.dfwd_cb_wait += 1;
            actions.push(Action::Deliver {
                cb,
                status: Status::Success,
                data: self.dfwd_data.clone(),
                release: Some(Completion::TreeLocal(self.gen)),
            });
        }
        log::debug!(
            "tree fence round {}: {} bytes down, waiting for {} completions",
            self.seq,
            self.dfwd_data.len(),
            self.dfwd_cb_wait
        );
    }

    fn progress_ufwd(&mut self, info: &CollInfo, actions: &mut Vec<Action>) -> bool {
        match self.ufwd_status {
            FwdStatus::Failed => {
                self.abort(Error::CommFailed("upward send failed".into()), actions);
                return false;
            }
            FwdStatus::Done => {}
            FwdStatus::None | FwdStatus::Active => return false,
        }
        if !self.contrib_parent {
            return false;
        }
        self.reset_ufwd();
        self.replay_early();
        self.start_dfwd(info, actions);
        true
    }

    fn progress_ufwd_sc(&mut self, actions: &mut Vec<Action>) -> bool {
        match self.ufwd_status {
            FwdStatus::Failed => {
                self.abort(Error::CommFailed("upward send failed".into()), actions);
                false
            }
            FwdStatus::Done => {
                self.reset_ufwd();
                self.replay_early();
                self.state = TreeState::UpfwdWpc;
                true
            }
            FwdStatus::None | FwdStatus::Active => false,
        }
    }

    fn progress_ufwd_wpc(&mut self, info: &CollInfo, actions: &mut Vec<Action>) -> bool {
        if !self.contrib_parent {
            return false;
        }
        self.start_dfwd(info, actions);
        true
    }

    fn progress_dfwd(&mut self, actions: &mut Vec<Action>) -> bool {
        if self.dfwd_status == FwdStatus::Active && self.dfwd_cb_wait == self.dfwd_cb_cnt {
            self.dfwd_status = FwdStatus::Done;
        }
        match self.dfwd_status {
            FwdStatus::Failed => {
                self.abort(Error::CommFailed("downward send failed".into()), actions);
                false
            }
            FwdStatus::Done => {
                log::debug!("tree fence round {} complete", self.seq);
                self.reset();
                true
            }
            FwdStatus::None | FwdStatus::Active => false,
        }
    }
}
