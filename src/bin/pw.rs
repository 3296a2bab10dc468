//! Packet Writer: emits raw Ethernet frames at a Zipf-skewed destination
//! mix, as fast as the kernel socket will accept them.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use net_eval::clock::{Clock, SystemClock};
use net_eval::prefix::{load_prefixes, NetPrefix};
use net_eval::sendpkt::{SendEngine, XiaDagShape};
use net_eval::seed::{default_seeds_path, load_seeds};
use net_eval::zipf::ZipfCache;
use net_eval::Stack;

/// How often, in wall-clock seconds, non-interactive mode reports pps.
const REPORT_INTERVAL_SECS: f64 = 10.0;
/// Cache size is `ZIPF_CACHE_FACTOR * address_count`.
const ZIPF_CACHE_FACTOR: usize = 30;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StackArg {
    Ip,
    Xia,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DaddrTypeArg {
    Ip,
    Fb0,
    Fb1,
    Fb2,
    Fb3,
    Via,
}

/// Drives synthetic load against a router by sending packets whose
/// destination is drawn from a cached Zipf distribution.
#[derive(Parser, Debug)]
#[command(name = "pw")]
struct Cli {
    /// Text file of CIDR prefixes to draw destinations from.
    #[arg(long)]
    prefix: PathBuf,

    /// Zipf exponent `s`.
    #[arg(long, default_value_t = 1.0)]
    zipf: f64,

    #[arg(long, value_enum)]
    stack: StackArg,

    /// Egress interface name.
    #[arg(long)]
    ifname: String,

    /// Destination MAC address, colon-hex (`aa:bb:cc:dd:ee:ff`).
    #[arg(long)]
    dmac: String,

    /// XIA destination-DAG shape. Ignored for `--stack ip`.
    #[arg(long, value_enum, default_value_t = DaddrTypeArg::Ip)]
    daddr_type: DaddrTypeArg,

    /// Total frame length, including the 14-byte Ethernet header.
    #[arg(long, default_value_t = 64)]
    pkt_len: usize,

    /// Number of nodes participating in this run (this node plus the router).
    #[arg(long)]
    nnodes: u64,

    /// This node's 1-indexed id, in `[1, nnodes - 1]`.
    #[arg(long)]
    node_id: u64,

    /// Run number, used to index into the seed file.
    #[arg(long, default_value_t = 1)]
    run: u64,

    /// Step through sends manually instead of free-running.
    #[arg(long)]
    interactive: bool,
}

fn parse_mac(text: &str) -> anyhow::Result<[u8; 6]> {
    let mac: pnet::util::MacAddr = text
        .parse()
        .map_err(|_| anyhow::anyhow!("`{text}` is not a valid MAC address"))?;
    Ok([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5])
}

fn dag_shape(stack: StackArg, daddr_type: DaddrTypeArg) -> anyhow::Result<Option<XiaDagShape>> {
    match (stack, daddr_type) {
        (StackArg::Ip, _) => Ok(None),
        (StackArg::Xia, DaddrTypeArg::Ip) => {
            anyhow::bail!("`--stack xia` requires a `--daddr-type` other than `ip`")
        }
        (StackArg::Xia, DaddrTypeArg::Fb0) => Ok(Some(XiaDagShape::Fb0)),
        (StackArg::Xia, DaddrTypeArg::Fb1) => Ok(Some(XiaDagShape::Fb1)),
        (StackArg::Xia, DaddrTypeArg::Fb2) => Ok(Some(XiaDagShape::Fb2)),
        (StackArg::Xia, DaddrTypeArg::Fb3) => Ok(Some(XiaDagShape::Fb3)),
        (StackArg::Xia, DaddrTypeArg::Via) => Ok(Some(XiaDagShape::Via)),
    }
}

/// What the control loop sends through. A trait so the loop body below is
/// unit-testable without a real socket.
trait PacketSink {
    fn send(&mut self, dst: std::net::Ipv4Addr) -> bool;
}

impl PacketSink for SendEngine {
    fn send(&mut self, dst: std::net::Ipv4Addr) -> bool {
        SendEngine::send(self, dst)
    }
}

/// One iteration of the free-running loop: attempt to send the packet at
/// `*index`; on success, draw the next index and count it. Returns whether
/// a packet was actually accepted, mirroring `sndpkt_send`'s return.
fn pw_step(
    sink: &mut impl PacketSink,
    prefixes: &[NetPrefix],
    cache: &mut ZipfCache,
    index: &mut u64,
) -> bool {
    let sent = sink.send(prefixes[*index as usize - 1].addr);
    if sent {
        *index = cache.sample();
    }
    sent
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.node_id == 0 || cli.node_id >= cli.nnodes {
        anyhow::bail!("--node-id must be in [1, nnodes - 1]");
    }

    let dst_addr_type = dag_shape(cli.stack, cli.daddr_type)?;
    let dst_mac = parse_mac(&cli.dmac)?;

    let (s1, _s2, node_seed) = load_seeds(default_seeds_path(), cli.run, cli.nnodes, cli.node_id)
        .context("loading seeds")?;
    let prefixes = load_prefixes(&cli.prefix, false, s1).context("loading prefix file")?;
    if prefixes.is_empty() {
        anyhow::bail!("prefix file `{}` has no usable entries", cli.prefix.display());
    }

    let mut cache = ZipfCache::new(ZIPF_CACHE_FACTOR * prefixes.len(), cli.zipf, prefixes.len() as u64, node_seed);

    let stack: Stack = match cli.stack {
        StackArg::Ip => Stack::Ip,
        StackArg::Xia => Stack::Xia,
    };
    let mut engine = SendEngine::new(stack.into(), &cli.ifname, cli.pkt_len, dst_mac, dst_addr_type)
        .context("initializing send engine")?;

    let mut index = cache.sample();

    if cli.interactive {
        run_interactive(&mut engine, &prefixes, &mut cache, &mut index)
    } else {
        let mut clock = SystemClock::default();
        run_free_running(&mut engine, &prefixes, &mut cache, &mut index, &mut clock);
        Ok(())
    }
}

fn run_free_running(
    engine: &mut SendEngine,
    prefixes: &[NetPrefix],
    cache: &mut ZipfCache,
    index: &mut u64,
    clock: &mut impl Clock,
) {
    let mut count: u64 = 0;
    let mut window_start = clock.now();
    loop {
        if pw_step(engine, prefixes, cache, index) {
            count += 1;
        }
        let now = clock.now();
        if now - window_start >= REPORT_INTERVAL_SECS {
            let pps = count as f64 / (now - window_start);
            println!("{pps:.1}");
            count = 0;
            window_start = now;
        }
    }
}

fn run_interactive(
    engine: &mut SendEngine,
    prefixes: &[NetPrefix],
    cache: &mut ZipfCache,
    index: &mut u64,
) -> anyhow::Result<()> {
    loop {
        print!("How many packets to send? ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let m: u64 = match line.trim().parse() {
            Ok(m) if m > 0 => m,
            _ => {
                eprintln!("expected a positive integer");
                continue;
            }
        };
        let mut sent = 0u64;
        while sent < m {
            if pw_step(engine, prefixes, cache, index) {
                sent += 1;
                println!("Packet {sent} sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct AlwaysAccepts;
    impl PacketSink for AlwaysAccepts {
        fn send(&mut self, _dst: Ipv4Addr) -> bool {
            true
        }
    }

    struct FlakySink {
        accept_every: u32,
        calls: u32,
    }
    impl PacketSink for FlakySink {
        fn send(&mut self, _dst: Ipv4Addr) -> bool {
            self.calls += 1;
            self.calls % self.accept_every == 0
        }
    }

    fn sample_prefixes() -> Vec<NetPrefix> {
        (1..=5)
            .map(|i| NetPrefix {
                addr: Ipv4Addr::new(10, 0, 0, i),
                mask_bits: 32,
                port: 0,
            })
            .collect()
    }

    #[test]
    fn step_advances_index_only_on_success() {
        let prefixes = sample_prefixes();
        let mut cache = ZipfCache::new(30 * prefixes.len(), 1.0, prefixes.len() as u64, [1; 10]);
        let mut index = cache.sample();
        let mut sink = FlakySink { accept_every: 3, calls: 0 };

        let mut advanced = 0;
        let mut attempted = 0;
        for _ in 0..30 {
            attempted += 1;
            if pw_step(&mut sink, &prefixes, &mut cache, &mut index) {
                advanced += 1;
            }
        }
        assert_eq!(advanced, attempted / 3);
    }

    #[test]
    fn free_running_reports_every_window_via_virtual_clock() {
        use net_eval::clock::VirtualClock;
        let prefixes = sample_prefixes();
        let mut cache = ZipfCache::new(30 * prefixes.len(), 1.0, prefixes.len() as u64, [2; 10]);
        let mut index = cache.sample();
        let mut sink = AlwaysAccepts;
        let mut clock = VirtualClock::new();

        // Exercise a bounded number of steps rather than the real
        // (infinite) loop body, mirroring the window-rollover logic.
        let mut count = 0u64;
        let mut window_start = clock.now();
        let mut reports = 0;
        for _ in 0..5 {
            if pw_step(&mut sink, &prefixes, &mut cache, &mut index) {
                count += 1;
            }
            clock.advance(std::time::Duration::from_secs(10));
            let now = clock.now();
            if now - window_start >= REPORT_INTERVAL_SECS {
                reports += 1;
                count = 0;
                window_start = now;
            }
        }
        assert_eq!(reports, 5);
        assert_eq!(count, 0);
    }
}
