//! Wire format of the proc connector (`linux/cn_proc.h`).
//!
//! libc exposes the netlink socket constants but not the connector payloads, so
//! the `cn_msg`/`proc_event` layout is decoded here by explicit byte offsets.
//! The kernel packs `proc_event` directly behind the 20-byte `cn_msg` header,
//! which leaves the 64-bit timestamp unaligned; field-wise decoding sidesteps
//! that entirely.

/// Connector id of the process-event subsystem.
pub const CN_IDX_PROC: u32 = 0x1;
pub const CN_VAL_PROC: u32 = 0x1;

/// `proc_cn_mcast_op` values.
pub const PROC_CN_MCAST_LISTEN: u32 = 1;
pub const PROC_CN_MCAST_IGNORE: u32 = 2;

const NLMSG_DONE: u16 = 3;

/// `proc_event.what` discriminants (only the ones this tool consumes).
pub const PROC_EVENT_FORK: u32 = 0x0000_0001;
pub const PROC_EVENT_EXEC: u32 = 0x0000_0002;
pub const PROC_EVENT_EXIT: u32 = 0x8000_0000;

/// Byte offsets within a connector datagram: 16-byte nlmsghdr, 20-byte cn_msg,
/// then `proc_event { what, cpu, timestamp_ns, event_data }`.
const OFF_WHAT: usize = 36;
const OFF_TIMESTAMP: usize = 44;
const OFF_DATA: usize = 52;

/// Smallest datagram carrying an event we care about (header + one data word).
const MIN_EVENT_LEN: usize = OFF_DATA + 4;

/// A process lifecycle event as delivered by the kernel.
///
/// The `forks_seen`/`exits_seen` snapshots on [`Event::Exec`] are filled in by
/// the event source (the parser leaves them at zero): they mirror how many fork
/// and exit events the source had delivered when this exec was read, and let
/// the accounting engine keep its aggregate counters aligned with the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Fork {
        parent_pid: i32,
        child_pid: i32,
        timestamp_ns: u64,
    },
    Exec {
        pid: i32,
        timestamp_ns: u64,
        forks_seen: u64,
        exits_seen: u64,
    },
    Exit {
        pid: i32,
        timestamp_ns: u64,
    },
}

impl Event {
    pub fn timestamp_ns(&self) -> u64 {
        match *self {
            Event::Fork { timestamp_ns, .. }
            | Event::Exec { timestamp_ns, .. }
            | Event::Exit { timestamp_ns, .. } => timestamp_ns,
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Decode one connector datagram into an [`Event`].
///
/// Returns `None` for datagrams this tool does not consume: the subscription
/// ack (`PROC_EVENT_NONE`), uid/gid/sid/comm changes, and anything truncated.
pub fn parse_datagram(buf: &[u8]) -> Option<Event> {
    if buf.len() < MIN_EVENT_LEN {
        return None;
    }
    let what = read_u32(buf, OFF_WHAT);
    let timestamp_ns = read_u64(buf, OFF_TIMESTAMP);
    match what {
        PROC_EVENT_FORK => {
            if buf.len() < OFF_DATA + 16 {
                return None;
            }
            Some(Event::Fork {
                parent_pid: read_u32(buf, OFF_DATA) as i32,
                child_pid: read_u32(buf, OFF_DATA + 8) as i32,
                timestamp_ns,
            })
        }
        PROC_EVENT_EXEC => Some(Event::Exec {
            pid: read_u32(buf, OFF_DATA) as i32,
            timestamp_ns,
            forks_seen: 0,
            exits_seen: 0,
        }),
        PROC_EVENT_EXIT => Some(Event::Exit {
            pid: read_u32(buf, OFF_DATA) as i32,
            timestamp_ns,
        }),
        _ => None,
    }
}

/// Build the `proc_cn_mcast_op` request that turns event delivery on or off
/// for this socket: nlmsghdr + cn_msg + one u32 op.
pub fn mcast_request(nl_pid: u32, listen: bool) -> Vec<u8> {
    let op = if listen {
        PROC_CN_MCAST_LISTEN
    } else {
        PROC_CN_MCAST_IGNORE
    };

    let mut msg = Vec::with_capacity(40);
    // nlmsghdr
    msg.extend_from_slice(&40u32.to_ne_bytes()); // nlmsg_len
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes()); // nlmsg_type
    msg.extend_from_slice(&0u16.to_ne_bytes()); // nlmsg_flags
    msg.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_seq
    msg.extend_from_slice(&nl_pid.to_ne_bytes()); // nlmsg_pid
    // cn_msg
    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&4u16.to_ne_bytes()); // len of payload
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    // proc_cn_mcast_op
    msg.extend_from_slice(&op.to_ne_bytes());
    debug_assert_eq!(msg.len(), 40);
    msg
}
