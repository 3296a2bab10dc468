//! Per-subsystem error types.
//!
//! Each engine in this crate fails in a small, closed set of ways. Rather
//! than a single crate-wide error enum (which would force unrelated
//! subsystems to share variants) every module gets its own, following the
//! shape of the teacher crate's `TxError`/`RxError` split but using
//! `thiserror` instead of hand-rolled `Display`/`Error` impls.

use std::io;

/// Failures loading `s1`/`s2`/`node_seed` from the seed file.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("can't open seed file `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("seed file `{path}` is too short: needed {needed} lines, found {found}")]
    TooShort {
        path: String,
        needed: u64,
        found: u64,
    },

    #[error("malformed seed line {line}: `{text}` is not 8 hex digits")]
    BadLine { line: u64, text: String },
}

/// Failures loading and shuffling the prefix/address file.
#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    #[error("can't open prefix file `{path}`: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("prefix file `{path}` contains no entries")]
    Empty { path: String },

    #[error("line {line}: `{text}` is not a valid CIDR (expected a.b.c.d/m with m in 8..=32)")]
    BadCidr { line: u64, text: String },
}

/// Failures initializing or using the raw-socket send engine.
#[derive(Debug, thiserror::Error)]
pub enum SendEngineError {
    #[error("socket() failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind() on interface `{iface}` failed: {source}")]
    Bind {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("interface `{0}` does not exist")]
    NoSuchInterface(String),

    #[error("destination address type `{0}` is not valid for this stack")]
    BadDestinationType(String),

    #[error("packet length {given} is smaller than the minimum header size {minimum}")]
    PacketTooSmall { given: usize, minimum: usize },

    #[error("sendto() failed: {0}")]
    Send(#[source] io::Error),
}

/// Failures in the netlink route-batching engine.
#[derive(Debug, thiserror::Error)]
pub enum NetlinkError {
    #[error("socket(AF_NETLINK) failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind() on netlink socket failed: {0}")]
    Bind(#[source] io::Error),

    #[error("sendto() on netlink socket failed: {0}")]
    Send(#[source] io::Error),

    #[error("recvfrom() on netlink socket failed: {0}")]
    Recv(#[source] io::Error),

    #[error("select() on netlink socket failed: {0}")]
    Select(#[source] io::Error),

    #[error("kernel rejected message seq {seq}: {errno}")]
    Nack { seq: u32, errno: i32 },
}

/// Failures reading ebtables filter-table counters.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("socket(AF_INET, SOCK_RAW) failed: {0}")]
    Socket(#[source] io::Error),

    #[error("getsockopt(EBT_SO_GET_INFO) failed: {0}")]
    GetInfo(#[source] io::Error),

    #[error("getsockopt(EBT_SO_GET_ENTRIES) failed: {0}")]
    GetEntries(#[source] io::Error),

    #[error("ebtables at `{path}` exited with status {status}")]
    EbtablesFailed { path: String, status: i32 },

    #[error("can't exec `{path}`: {source}")]
    EbtablesExec {
        path: String,
        #[source]
        source: io::Error,
    },
}
