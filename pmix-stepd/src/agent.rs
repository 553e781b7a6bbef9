//! The agent: a poll loop thread serving every server-side fd of the step,
//! plus a timer thread ticking once per second for timeout sweeps.

use crate::conn::{ConnKind, ConnRegistry};
use crate::error::Result;
use crate::proto::MsgType;
use crate::step::Step;
use crate::{dconn, server};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use stepio::{Interest, Notifier};

const TICK: Duration = Duration::from_secs(1);

pub struct Agent {
    step: Arc<Step>,
    timer_stop: Arc<Notifier>,
    threads: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn start(step: Arc<Step>, listener: UnixListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let tick = Arc::new(Notifier::new()?);
        let timer_stop = Arc::new(Notifier::new()?);

        let timer = {
            let (tick, stop) = (tick.clone(), timer_stop.clone());
            std::thread::Builder::new()
                .name("pmix-timer".into())
                .spawn(move || timer_loop(&tick, &stop))?
        };
        let server = {
            let step = step.clone();
            std::thread::Builder::new()
                .name("pmix-agent".into())
                .spawn(move || {
                    let mut agent = AgentLoop {
                        registry: ConnRegistry::new(step.enc),
                        step,
                        listener,
                        tick,
                    };
                    agent.run();
                })?
        };
        log::debug!("agent started");
        Ok(Self {
            step,
            timer_stop,
            threads: vec![timer, server],
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.step.stop();
        self.timer_stop.notify();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("agent thread panicked");
            }
        }
        log::debug!("agent stopped");
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(tick: &Notifier, stop: &Notifier) {
    loop {
        match stepio::wait_fd(stop.fd(), PollFlags::POLLIN, Some(TICK)) {
            Ok(true) => return,
            Ok(false) => tick.notify(),
            Err(err) => {
                log::error!("timer: {}", err);
                return;
            }
        }
    }
}

struct AgentLoop {
    step: Arc<Step>,
    listener: UnixListener,
    tick: Arc<Notifier>,
    registry: ConnRegistry,
}

fn readable(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
}

impl AgentLoop {
    fn run(&mut self) {
        while !self.step.is_stopping() {
            let mut fds = vec![
                PollFd::new(self.tick.fd(), PollFlags::POLLIN),
                PollFd::new(self.step.wake_fd(), PollFlags::POLLIN),
                PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN),
            ];
            let tcp = self.step.dconn.listener();
            if let Some(fd) = tcp {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
            let base = fds.len();
            let conns = self.registry.poll_set();
            for &(_, fd, interest) in &conns {
                let mut flags = PollFlags::empty();
                if interest.contains(Interest::READ) {
                    flags |= PollFlags::POLLIN;
                }
                if interest.contains(Interest::WRITE) {
                    flags |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(fd, flags));
            }

            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("agent: poll failed: {}", err);
                    break;
                }
            }
            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect();

            // connection indices stay valid until the registry is changed
            // below
            for (i, &(idx, _, _)) in conns.iter().enumerate() {
                let flags = revents[base + i];
                if flags.is_empty() {
                    continue;
                }
                self.serve(idx, readable(flags), flags.contains(PollFlags::POLLOUT));
            }
            if !revents[2].is_empty() {
                self.accept_unix();
            }
            if tcp.is_some() && !revents[3].is_empty() {
                self.accept_tcp();
            }
            if !revents[1].is_empty() {
                self.step.drain_wake();
                for (nodeid, engine) in self.step.take_conns() {
                    self.registry.add_persistent(nodeid, engine);
                }
            }
            if !revents[0].is_empty() {
                self.tick.drain();
                self.on_tick();
            }
            self.cleanup();
        }
        log::debug!("agent loop exits");
    }

    fn on_tick(&mut self) {
        self.step.dmdx.cleanup(&self.step);
        self.step.colls.cleanup(&self.step);
        self.cleanup();
    }

    fn cleanup(&mut self) {
        for nodeid in self.registry.cleanup() {
            dconn::disconnect(&self.step, nodeid);
        }
    }

    fn accept_unix(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.registry.add_temp(stream.into(), false) {
                        log::warn!("agent: dropping relayed connection: {}", err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("agent: accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn accept_tcp(&mut self) {
        loop {
            match self.step.dconn.accept() {
                Ok(Some(fd)) => {
                    if let Err(err) = self.registry.add_temp(fd, true) {
                        log::warn!("agent: dropping direct connection: {}", err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("agent: accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn serve(&mut self, idx: usize, readable: bool, writable: bool) {
        let kind = self.registry.kind(idx);
        for (hdr, payload) in self.registry.progress(idx, readable, writable) {
            match kind {
                ConnKind::Temp { direct: true } => {
                    // the greeting is the only frame we read from an unverified link
                    let fd = self.registry.take_fd(idx);
                    match (hdr.msg_type(), fd) {
                        (Ok(MsgType::InitDirect), Some(fd)) => {
                            if let Err(err) = dconn::accept(&self.step, &hdr, &payload, fd) {
                                log::warn!("agent: rejecting direct link from node {}: {}", hdr.nodeid, err);
                            }
                        }
                        (mtype, _) => {
                            log::warn!("agent: direct link opened with {:?}, closing", mtype);
                        }
                    }
                    return;
                }
                _ => server::dispatch(&self.step, hdr, payload),
            }
        }
    }
}
