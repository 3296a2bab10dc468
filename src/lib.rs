//! Library crate backing the `pw`, `rk`, and `pc` binaries: a three-process
//! harness for measuring a router's forwarding performance under synthetic
//! load.
//!
//! - [`prng`] / [`seed`]: the reproducible random-number layer every process
//!   draws from, seeded from a shared file so repeated runs are comparable.
//! - [`zipf`]: precomputed Zipf-distributed destination sampling for the
//!   packet writer.
//! - [`prefix`]: loading, shuffling, and address-forcing for the prefix file
//!   shared by the packet writer and the router keeper.
//! - [`sendpkt`]: the raw-socket send engine, one per stack (classical IPv4
//!   and the experimental XIA stack).
//! - [`netlink`]: batched route installation/update over `NETLINK_ROUTE`.
//! - [`ebt`]: reading forwarded-packet counters out of the bridge filter
//!   table, and installing the rule that makes them available.
//! - [`clock`]: an injected time source so the control loops in the binaries
//!   are deterministic under test.

pub mod clock;
pub mod ebt;
pub mod error;
pub mod netlink;
pub mod prefix;
pub mod prng;
pub mod seed;
pub mod sendpkt;
pub mod zipf;

/// Which of the two network stacks a run targets. Threaded through nearly
/// every module, so it lives at the crate root rather than being
/// re-declared per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Ip,
    Xia,
}

impl std::str::FromStr for Stack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Stack::Ip),
            "xia" => Ok(Stack::Xia),
            other => Err(format!("unknown stack `{other}`, expected `ip` or `xia`")),
        }
    }
}

impl From<Stack> for sendpkt::Stack {
    fn from(s: Stack) -> Self {
        match s {
            Stack::Ip => sendpkt::Stack::Ip,
            Stack::Xia => sendpkt::Stack::Xia,
        }
    }
}

impl From<Stack> for netlink::Stack {
    fn from(s: Stack) -> Self {
        match s {
            Stack::Ip => netlink::Stack::Ip,
            Stack::Xia => netlink::Stack::Xia,
        }
    }
}

impl From<Stack> for ebt::Stack {
    fn from(s: Stack) -> Self {
        match s {
            Stack::Ip => ebt::Stack::Ip,
            Stack::Xia => ebt::Stack::Xia,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_parses_from_cli_values() {
        assert_eq!("ip".parse::<Stack>().unwrap(), Stack::Ip);
        assert_eq!("xia".parse::<Stack>().unwrap(), Stack::Xia);
        assert!("ipv6".parse::<Stack>().is_err());
    }
}
