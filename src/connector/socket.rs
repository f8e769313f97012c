//! Netlink proc connector subscription.
//!
//! Events come straight from the kernel with no polling lag, which is the only
//! way to catch processes that live for a handful of milliseconds. The price is
//! that the socket needs `CAP_NET_ADMIN` (in practice: root) and only exists on
//! Linux.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use crate::connector::events::{self, Event};
use crate::prelude::*;

/// Plenty for one connector datagram (they are well under 100 bytes).
const RECV_BUF_SIZE: usize = 4096;

/// Priority given to the event thread so `/proc` can be read before short-lived
/// processes are reaped.
const EVENT_LOOP_NICENESS: libc::c_int = -20;

/// A live subscription to the kernel's process-event stream.
///
/// Counts fork and exit events as they are read and stamps each exec event with
/// those totals, so the consumer can align its own counters with the stream.
pub struct EventSource {
    fd: RawFd,
    buf: Vec<u8>,
    forks_seen: u64,
    exits_seen: u64,
}

impl EventSource {
    /// Open the netlink connector socket and subscribe to process events.
    ///
    /// Fails (typically with `EPERM`) when not privileged enough; the
    /// subscription either works completely or not at all.
    pub fn connect() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_DGRAM,
                libc::NETLINK_CONNECTOR,
            )
        };
        if fd < 0 {
            return Err(os_error("opening the netlink connector socket"));
        }

        let source = Self {
            fd,
            buf: vec![0; RECV_BUF_SIZE],
            forks_seen: 0,
            exits_seen: 0,
        };

        let nl_pid = std::process::id();
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = events::CN_IDX_PROC;
        addr.nl_pid = nl_pid;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(os_error("binding to the process-event multicast group"));
        }

        source.send_mcast(true)?;
        debug!("subscribed to the kernel process-event connector");
        Ok(source)
    }

    fn send_mcast(&self, listen: bool) -> Result<()> {
        let msg = events::mcast_request(std::process::id(), listen);
        let rc = unsafe {
            libc::send(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(os_error("sending the process-event subscription request"));
        }
        Ok(())
    }

    /// Block until the next fork/exec/exit event.
    ///
    /// `EINTR` is retried. `ENOBUFS` means the kernel dropped events because we
    /// fell behind; the stream itself stays usable, so the loop keeps going and
    /// the stale records will be collected by the liveness sweep.
    pub fn next_event(&mut self) -> Result<Event> {
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ENOBUFS) => {
                        warn!("kernel event buffer overflowed, some events were lost");
                        continue;
                    }
                    _ => return Err(err).context("receiving from the netlink socket"),
                }
            }
            if n == 0 {
                bail!("the netlink socket was closed by the kernel");
            }

            let Some(mut event) = events::parse_datagram(&self.buf[..n as usize]) else {
                continue;
            };
            match &mut event {
                Event::Fork { .. } => self.forks_seen += 1,
                Event::Exit { .. } => self.exits_seen += 1,
                Event::Exec {
                    forks_seen,
                    exits_seen,
                    ..
                } => {
                    *forks_seen = self.forks_seen;
                    *exits_seen = self.exits_seen;
                }
            }
            return Ok(event);
        }
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        let _ = self.send_mcast(false);
        unsafe { libc::close(self.fd) };
    }
}

fn os_error(what: &str) -> anyhow::Error {
    anyhow::Error::from(io::Error::last_os_error()).context(format!("failed {what}"))
}

/// Raise the calling process's scheduling priority for the event loop.
///
/// Failure is survivable (events still arrive, we just lose more `/proc` races
/// under load), so it only warns.
pub fn raise_priority() {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, EVENT_LOOP_NICENESS) };
    if rc != 0 {
        warn!(
            "could not raise scheduling priority to {EVENT_LOOP_NICENESS}: {}",
            io::Error::last_os_error()
        );
    }
}
