//! Router Keeper: bulk-loads the forwarding table from a prefix file, then
//! continuously reassigns prefixes to different egress ports at a
//! controlled rate to keep the FIB churning during a measurement run.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use net_eval::clock::{Clock, SystemClock};
use net_eval::error::NetlinkError;
use net_eval::netlink::{Gateway, Port, RouteBatch};
use net_eval::prefix::{assign_ports, load_prefixes, NetPrefix};
use net_eval::prng::SeededRng;
use net_eval::seed::{default_seeds_path, load_seeds};
use net_eval::Stack;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StackArg {
    Ip,
    Xia,
}

/// Bulk-loads and continuously churns a router's forwarding table.
#[derive(Parser, Debug)]
#[command(name = "rk")]
struct Cli {
    #[arg(long)]
    prefix: PathBuf,

    #[arg(long, value_enum)]
    stack: StackArg,

    /// Install routes as replacements (`NLM_F_REPLACE`) instead of
    /// requiring them to be new (`NLM_F_CREATE|NLM_F_EXCL`).
    #[arg(long)]
    load_update: bool,

    /// Route updates per second after the bulk load; `0` skips the update
    /// loop entirely.
    #[arg(long, default_value_t = 0)]
    upd_rate: u64,

    #[arg(long, default_value_t = 1)]
    run: u64,

    /// Total node count for this run (the router is always the last node,
    /// `node_id = nnodes`); needed to index the shared seed file.
    #[arg(long)]
    nnodes: u64,

    /// `IFNAME GATEWAY` pairs, one per egress port. `GATEWAY` is a dotted
    /// IPv4 address for `--stack ip`, or a 40-hex-character XID for
    /// `--stack xia`.
    #[arg(required = true, num_args = 2..)]
    ports: Vec<String>,
}

fn parse_xid(text: &str) -> anyhow::Result<[u8; 20]> {
    if text.len() != 40 {
        anyhow::bail!("`{text}` is not a 40-character hex XID");
    }
    let mut xid = [0u8; 20];
    for i in 0..20 {
        xid[i] = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
            .map_err(|_| anyhow::anyhow!("`{text}` is not valid hex"))?;
    }
    Ok(xid)
}

fn ifindex(name: &str) -> anyhow::Result<i32> {
    let cname = CString::new(name).map_err(|_| anyhow::anyhow!("`{name}` contains a NUL byte"))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        anyhow::bail!("interface `{name}` does not exist");
    }
    Ok(idx as i32)
}

fn parse_ports(raw: &[String], stack: StackArg) -> anyhow::Result<Vec<Port>> {
    if raw.len() % 2 != 0 {
        anyhow::bail!("ports must be given as IFNAME GATEWAY pairs");
    }
    raw.chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let iface = ifindex(&pair[0])?;
            let gateway = match stack {
                StackArg::Ip => Gateway::Ip(
                    pair[1]
                        .parse::<Ipv4Addr>()
                        .with_context(|| format!("`{}` is not a valid gateway IPv4 address", pair[1]))?,
                ),
                StackArg::Xia => Gateway::Xid(parse_xid(&pair[1])?),
            };
            Ok(Port {
                index: i as u16,
                iface,
                gateway,
            })
        })
        .collect()
}

/// Swaps a prefix's current port out of contention, draws uniformly from
/// the rest, then restores the array. Guarantees the result differs from
/// `current_port` whenever more than one port exists.
fn pick_new_port(ports: &mut [Port], current_port: u16, port_rng: &mut SeededRng) -> Port {
    let last = ports.len() - 1;
    ports.swap(current_port as usize, last);
    let port_sample = port_rng.sample_0_n1(last as u64) as usize;
    let new_port = ports[port_sample];
    ports.swap(current_port as usize, last);
    new_port
}

fn bulk_load(
    batch: &mut RouteBatch,
    prefixes: &[NetPrefix],
    ports: &[Port],
    update: bool,
) -> Result<(), NetlinkError> {
    for p in prefixes {
        batch.add_route(p, &ports[p.port as usize], update)?;
    }
    batch.flush()
}

fn run_update_loop(
    batch: &mut RouteBatch,
    prefixes: &mut [NetPrefix],
    ports: &mut [Port],
    prefix_rng: &mut SeededRng,
    port_rng: &mut SeededRng,
    upd_rate: u64,
    clock: &mut impl Clock,
) -> Result<(), NetlinkError> {
    let mut window_updates: u64 = 0;
    let mut window_start = clock.now();
    loop {
        let batch_start = clock.now();
        for _ in 0..upd_rate {
            let prefix_idx = prefix_rng.sample_0_n1(prefixes.len() as u64) as usize;
            let new_port = pick_new_port(ports, prefixes[prefix_idx].port, port_rng);
            prefixes[prefix_idx].port = new_port.index;
            batch.add_route(&prefixes[prefix_idx], &new_port, true)?;
        }
        batch.flush()?;
        window_updates += upd_rate;

        let now = clock.now();
        if now - window_start >= 10.0 {
            log::info!("{:.1} updates/sec", window_updates as f64 / (now - window_start));
            window_updates = 0;
            window_start = now;
        }

        let elapsed = clock.now() - batch_start;
        if elapsed < 1.0 {
            clock.sleep(Duration::from_secs_f64(1.0 - elapsed));
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let ports = parse_ports(&cli.ports, cli.stack)?;
    if ports.is_empty() {
        anyhow::bail!("at least one IFNAME GATEWAY pair is required");
    }

    let (s1, s2, node_seed) = load_seeds(default_seeds_path(), cli.run, cli.nnodes, cli.nnodes)
        .context("loading seeds")?;
    let mut prefixes = load_prefixes(&cli.prefix, false, s1).context("loading prefix file")?;
    if prefixes.is_empty() {
        anyhow::bail!("prefix file `{}` has no usable entries", cli.prefix.display());
    }

    let mut port_rng = SeededRng::from_seed(s2);
    assign_ports(&mut prefixes, ports.len() as u16, &mut port_rng);

    let stack: Stack = match cli.stack {
        StackArg::Ip => Stack::Ip,
        StackArg::Xia => Stack::Xia,
    };
    let mut batch = RouteBatch::new(stack.into()).context("opening netlink socket")?;

    let mut clock = SystemClock::default();
    let load_start = clock.now();
    bulk_load(&mut batch, &prefixes, &ports, cli.load_update).context("bulk-loading the FIB")?;
    let elapsed = clock.now() - load_start;
    let rate = if elapsed > 0.0 { prefixes.len() as f64 / elapsed } else { f64::INFINITY };
    println!("{rate:.1} entries/sec");
    println!("DONE");

    if cli.upd_rate == 0 {
        return Ok(());
    }

    let mut ports = ports;
    let mut prefix_rng = SeededRng::from_seed(node_seed);
    run_update_loop(&mut batch, &mut prefixes, &mut ports, &mut prefix_rng, &mut port_rng, cli.upd_rate, &mut clock)
        .context("netlink route update loop")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ports(n: u16) -> Vec<Port> {
        (0..n)
            .map(|i| Port {
                index: i,
                iface: i as i32,
                gateway: Gateway::Ip(Ipv4Addr::new(10, 0, 0, i as u8)),
            })
            .collect()
    }

    #[test]
    fn new_port_always_differs_from_current() {
        let mut ports = sample_ports(4);
        let mut rng = SeededRng::from_seed([5; 10]);
        for current in 0..4u16 {
            for _ in 0..100 {
                let new_port = pick_new_port(&mut ports, current, &mut rng);
                assert_ne!(new_port.index, current);
            }
        }
    }

    #[test]
    fn pick_new_port_restores_the_array() {
        let mut ports = sample_ports(5);
        let original: Vec<i32> = ports.iter().map(|p| p.iface).collect();
        let mut rng = SeededRng::from_seed([9; 10]);
        pick_new_port(&mut ports, 2, &mut rng);
        let after: Vec<i32> = ports.iter().map(|p| p.iface).collect();
        assert_eq!(original, after);
    }

    #[test]
    fn two_ports_always_swaps_to_the_other() {
        let mut ports = sample_ports(2);
        let mut rng = SeededRng::from_seed([1; 10]);
        for _ in 0..20 {
            assert_eq!(pick_new_port(&mut ports, 0, &mut rng).index, 1);
            assert_eq!(pick_new_port(&mut ports, 1, &mut rng).index, 0);
        }
    }

    #[test]
    fn parse_ports_rejects_odd_count() {
        let raw = vec!["eth0".to_string()];
        assert!(parse_ports(&raw, StackArg::Ip).is_err());
    }

    #[test]
    fn parse_xid_rejects_wrong_length() {
        assert!(parse_xid("abcd").is_err());
    }
}
