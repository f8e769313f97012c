//! The accounting engine.
//!
//! Consumes the event stream, maintains the process/command graph and performs
//! ancestor attribution. Everything happens under one mutex: the event loop,
//! the reporters and the liveness sweep all take the same lock, so every
//! observer sees a consistent snapshot.

use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::connector::Event;
use crate::procfs::{ProcReader, SysProcReader};
use crate::tracker::graph::Graph;

/// What an ancestor climb hands to each distinct ancestor command.
#[derive(Clone, Copy)]
enum Attribution {
    /// One exec somewhere below this command.
    ExecCount,
    /// The completed wall time of a descendant, in nanoseconds.
    ExitTime(u64),
}

/// Shared accounting state behind the single graph lock.
pub struct Tracker {
    state: Mutex<Graph>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::with_reader(Box::new(SysProcReader::new()))
    }

    /// Build a tracker over an arbitrary `/proc` reader (tests inject a fake).
    pub fn with_reader(reader: Box<dyn ProcReader>) -> Self {
        Self {
            state: Mutex::new(Graph::new(reader)),
        }
    }

    pub fn handle_event(&self, event: Event) {
        let mut g = self.state.lock().unwrap();
        match event {
            Event::Fork { .. } => {
                g.counters.fork_events += 1;
            }
            Event::Exec {
                pid,
                timestamp_ns,
                forks_seen,
                exits_seen,
            } => on_exec(&mut g, pid, timestamp_ns, forks_seen, exits_seen),
            Event::Exit { pid, timestamp_ns } => on_exit(&mut g, pid, timestamp_ns),
        }
    }

    /// Run `f` against the graph under the lock. Reports use this to render a
    /// consistent snapshot.
    pub fn with_graph<T>(&self, f: impl FnOnce(&Graph) -> T) -> T {
        let g = self.state.lock().unwrap();
        f(&g)
    }

    pub fn reset(&self) {
        self.state.lock().unwrap().reset();
    }

    /// Drop records of pids whose process no longer exists, catching exits the
    /// event stream missed. Returns how many records were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_with(pid_alive)
    }

    pub fn sweep_with(&self, mut alive: impl FnMut(i32) -> bool) -> usize {
        let mut g = self.state.lock().unwrap();
        let dead: Vec<i32> = g.pids().into_iter().filter(|&pid| !alive(pid)).collect();
        for &pid in &dead {
            g.remove(pid);
            g.counters.removed += 1;
        }
        dead.len()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Zero-signal probe. `EPERM` means the pid exists but belongs to someone we
/// may not signal, which still counts as alive.
fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn on_exec(g: &mut Graph, pid: i32, ts: u64, forks_seen: u64, exits_seen: u64) {
    g.counters.exec_events += 1;
    // Fork and exit events are also counted by the source; the snapshots on the
    // exec event re-align us in case any were dropped.
    g.counters.fork_events = g.counters.fork_events.max(forks_seen);
    g.counters.exit_events = g.counters.exit_events.max(exits_seen);

    g.record_exec(pid, ts);
    if let Some(rec) = g.process(pid) {
        let ppid = rec.ppid;
        climb_ancestors(g, pid, ppid, false, Attribution::ExecCount);
    }
}

fn on_exit(g: &mut Graph, pid: i32, ts: u64) {
    g.counters.exit_events += 1;
    let Some(rec) = g.remove(pid) else {
        return;
    };
    g.counters.removed += 1;
    if rec.start_ts == 0 {
        // Synthesized record: we never saw it exec, so there is no interval to
        // account.
        return;
    }
    let duration = ts.saturating_sub(rec.start_ts);
    g.command_mut(rec.command).exec_time_total += duration;
    g.histogram.record(duration);
    climb_ancestors(
        g,
        pid,
        rec.ppid,
        rec.parent.is_some(),
        Attribution::ExitTime(duration),
    );
}

/// Walk from `child` toward pid 1, attributing `what` to each distinct
/// ancestor's command exactly once.
///
/// `resolved` says whether `child` had already resolved its parent link: a
/// parent that was resolved earlier but has since been removed from the graph
/// ends the climb without touching `/proc` again (the link is invalidated by
/// removal, and the stat file is gone anyway). Parents we have never seen are
/// synthesized from `/proc`. The climb serial dedups commands repeated within
/// one chain while keeping separate climbs (the exec and the later exit of the
/// same pid) independent.
fn climb_ancestors(
    g: &mut Graph,
    mut child: i32,
    mut ppid: i32,
    mut resolved: bool,
    what: Attribution,
) {
    g.climb_serial += 1;
    let serial = g.climb_serial;

    while child > 1 {
        if ppid < 1 {
            return;
        }
        if g.process(ppid).is_none() && (resolved || !g.ensure_process(ppid)) {
            return;
        }
        if let Some(rec) = g.processes.get_mut(&child) {
            rec.parent = Some(ppid);
        }

        let (command, next_ppid, next_resolved) = match g.process(ppid) {
            Some(parent) => (parent.command, parent.ppid, parent.parent.is_some()),
            None => return,
        };
        let stats = g.command_mut(command);
        if stats.attributed_climb != serial {
            stats.attributed_climb = serial;
            match what {
                Attribution::ExecCount => stats.subtree_exec_count += 1,
                Attribution::ExitTime(duration) => stats.subtree_exec_time_total += duration,
            }
        }

        child = ppid;
        ppid = next_ppid;
        resolved = next_resolved;
    }
}
