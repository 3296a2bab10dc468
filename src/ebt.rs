//! ebtables filter-table counter reader.
//!
//! Grounded on `examples/original_source/ebt.c`. The kernel interface here
//! (`getsockopt(IPPROTO_IP, EBT_SO_GET_INFO/EBT_SO_GET_ENTRIES)`) embeds raw
//! userspace pointers inside a fixed-size struct rather than appending a
//! flexible array, so this module parses the returned bytes by explicit
//! offset instead of overlaying a `#[repr(C)]` struct on them — the exact
//! padding of `struct ebt_replace` is an ABI detail this crate does not
//! depend on a kernel header to confirm (see DESIGN.md).

use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::Command;

use crate::error::CounterError;

const EBT_SO_GET_INFO: libc::c_int = 0;
const EBT_SO_GET_ENTRIES: libc::c_int = 1;

const IFNAMSIZ: usize = 16;
const EBT_TABLE_MAXNAMELEN: usize = 32;
const EBT_CHAIN_MAXNAMELEN: usize = 32;
const EBT_ENTRY_OR_ENTRIES: u32 = 0x01;
/// `pcnt`/`bcnt` omit the Ethernet header the bridge-filter layer already
/// stripped; this restores it in byte counts.
const ETHER_HDR_LEN: u64 = 14;

// Layout of `struct ebt_replace` on a 64-bit host: 32-byte name, three
// u32s, NF_BR_NUMHOOKS (5) hook pointers, num_counters, then the counters
// and entries pointers — each pointer-aligned field padded to 8 bytes.
const NF_BR_NUMHOOKS: usize = 5;
const NAME_OFF: usize = 0;
const NENTRIES_OFF: usize = 36;
const ENTRIES_SIZE_OFF: usize = 40;
const HOOK_ENTRY_OFF: usize = 48;
const NUM_COUNTERS_OFF: usize = HOOK_ENTRY_OFF + NF_BR_NUMHOOKS * 8;
const COUNTERS_PTR_OFF: usize = NUM_COUNTERS_OFF + 8;
const ENTRIES_PTR_OFF: usize = COUNTERS_PTR_OFF + 8;
const EBT_REPL_LEN: usize = ENTRIES_PTR_OFF + 8;

// Offsets within one `struct ebt_entry`.
const ENTRY_ETHPROTO_OFF: usize = 8;
const ENTRY_OUT_OFF: usize = 10 + IFNAMSIZ + IFNAMSIZ; // skip ethproto(2)+in(16)+logical_in(16)
const ENTRY_NEXT_OFFSET_OFF: usize = 106;
/// Best-effort: size of `struct ebt_entries` (chain header) up to its
/// trailing flexible array, 8-byte aligned.
const CHAIN_HDR_LEN: usize = 48;

/// One counter reading for a single matching OUTPUT-chain rule.
#[derive(Debug, Clone)]
pub struct Reading {
    pub out_if: String,
    pub pcnt: u64,
    /// Byte count with the stripped Ethernet header restored
    /// (`pcnt * 14 + bcnt`).
    pub bcnt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    Ip,
    Xia,
}

impl Stack {
    fn ethproto_be(self) -> u16 {
        match self {
            Stack::Ip => 0x0800u16.to_be(),
            Stack::Xia => 0xc0deu16.to_be(),
        }
    }

    fn ebtables_proto_arg(self) -> &'static str {
        match self {
            Stack::Ip => "IPv4",
            Stack::Xia => "0xc0de",
        }
    }
}

/// Owns the raw `AF_INET/SOCK_RAW` socket used only as a conduit for the
/// ebtables getsockopt calls.
pub struct EbtCounterReader {
    sk: RawFd,
}

impl EbtCounterReader {
    pub fn new() -> Result<Self, CounterError> {
        let sk = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::PF_INET) };
        if sk < 0 {
            return Err(CounterError::Socket(io::Error::last_os_error()));
        }
        Ok(EbtCounterReader { sk })
    }

    /// Reads every OUTPUT-chain rule whose protocol matches `stack`.
    pub fn read(&self, stack: Stack) -> Result<Vec<Reading>, CounterError> {
        let (entries, counters) = self.retrieve()?;
        Ok(scan_output(&entries, &counters, stack.ethproto_be()))
    }

    fn retrieve(&self) -> Result<(Vec<u8>, Vec<u8>), CounterError> {
        let mut repl = vec![0u8; EBT_REPL_LEN];
        repl[NAME_OFF..NAME_OFF + "filter".len()].copy_from_slice(b"filter");

        let mut optlen = EBT_REPL_LEN as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.sk,
                libc::IPPROTO_IP,
                EBT_SO_GET_INFO,
                repl.as_mut_ptr() as *mut c_void,
                &mut optlen,
            )
        };
        if rc < 0 {
            return Err(CounterError::GetInfo(io::Error::last_os_error()));
        }

        let nentries = read_u32(&repl, NENTRIES_OFF);
        if nentries == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let entries_size = read_u32(&repl, ENTRIES_SIZE_OFF) as usize;

        let mut counters = vec![0u8; nentries as usize * 16]; // struct ebt_counter { u64 pcnt, bcnt; }
        let mut entries = vec![0u8; entries_size];
        repl[NUM_COUNTERS_OFF..NUM_COUNTERS_OFF + 4].copy_from_slice(&nentries.to_ne_bytes());
        write_ptr(&mut repl, COUNTERS_PTR_OFF, counters.as_mut_ptr());
        write_ptr(&mut repl, ENTRIES_PTR_OFF, entries.as_mut_ptr());

        let mut optlen = (EBT_REPL_LEN + counters.len() + entries.len()) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.sk,
                libc::IPPROTO_IP,
                EBT_SO_GET_ENTRIES,
                repl.as_mut_ptr() as *mut c_void,
                &mut optlen,
            )
        };
        if rc < 0 {
            return Err(CounterError::GetEntries(io::Error::last_os_error()));
        }

        Ok((entries, counters))
    }
}

impl Drop for EbtCounterReader {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.sk);
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
}

fn write_ptr(buf: &mut [u8], off: usize, ptr: *mut u8) {
    buf[off..off + 8].copy_from_slice(&(ptr as usize).to_ne_bytes());
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Walks the OUTPUT chain's rule entries, collecting one [`Reading`] per
/// rule whose `ethproto` matches. `ethproto_be` is the wire-order (16-bit
/// big-endian) protocol number being matched.
fn scan_output(entries: &[u8], counters: &[u8], ethproto_be: u16) -> Vec<Reading> {
    let mut readings = Vec::new();
    let mut pos = 0usize;
    let mut printing = false;
    let mut index = 0usize;

    while pos + 4 <= entries.len() {
        let bitmask = read_u32(entries, pos);
        if bitmask & EBT_ENTRY_OR_ENTRIES != 0 {
            // A rule entry.
            if printing {
                let ethproto = u16::from_ne_bytes(entries[pos + ENTRY_ETHPROTO_OFF..pos + ENTRY_ETHPROTO_OFF + 2].try_into().unwrap());
                if ethproto == ethproto_be {
                    let out_if = c_str(&entries[pos + ENTRY_OUT_OFF..pos + ENTRY_OUT_OFF + IFNAMSIZ]);
                    let counter_off = index * 16;
                    if counter_off + 16 <= counters.len() {
                        let pcnt = u64::from_ne_bytes(counters[counter_off..counter_off + 8].try_into().unwrap());
                        let bcnt = u64::from_ne_bytes(counters[counter_off + 8..counter_off + 16].try_into().unwrap());
                        readings.push(Reading {
                            out_if,
                            pcnt,
                            bcnt: pcnt * ETHER_HDR_LEN + bcnt,
                        });
                    }
                }
                index += 1;
            }
            let next_offset = read_u32(entries, pos + ENTRY_NEXT_OFFSET_OFF) as usize;
            if next_offset == 0 {
                break;
            }
            pos += next_offset;
        } else {
            // A chain header.
            if printing {
                break; // Reached the chain after OUTPUT; stop.
            }
            let name = c_str(&entries[pos + 4..pos + 4 + EBT_CHAIN_MAXNAMELEN]);
            if name == "OUTPUT" {
                printing = true;
                index = read_u32(entries, pos + 4 + EBT_CHAIN_MAXNAMELEN) as usize;
            }
            pos += CHAIN_HDR_LEN;
        }
    }
    readings
}

/// Forks and execs the user-supplied `ebtables` binary to install a
/// drop-on-egress rule, so the bridge-filter counters start tracking this
/// interface.
pub fn add_rule(ebtables: &Path, stack: Stack, ifname: &str) -> Result<(), CounterError> {
    let status = Command::new(ebtables)
        .args([
            "-A",
            "OUTPUT",
            "--proto",
            stack.ebtables_proto_arg(),
            "--out-if",
            ifname,
            "--jump",
            "DROP",
        ])
        .status()
        .map_err(|source| CounterError::EbtablesExec {
            path: ebtables.display().to_string(),
            source,
        })?;

    if !status.success() {
        return Err(CounterError::EbtablesFailed {
            path: ebtables.display().to_string(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_chain(buf: &mut Vec<u8>, name: &str, counter_offset: u32) {
        buf.extend_from_slice(&0u32.to_ne_bytes()); // distinguisher, EBT_ENTRY_OR_ENTRIES clear
        let mut name_buf = [0u8; EBT_CHAIN_MAXNAMELEN];
        name_buf[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&name_buf);
        buf.extend_from_slice(&counter_offset.to_ne_bytes()); // counter_offset
        buf.extend_from_slice(&0i32.to_ne_bytes()); // policy
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nentries
        buf.resize(buf.len() + (CHAIN_HDR_LEN - 48 + 0), 0); // pad to CHAIN_HDR_LEN exactly
    }

    fn push_entry(buf: &mut Vec<u8>, ethproto_be: u16, out_if: &str, next_offset: u32) {
        let start = buf.len();
        buf.extend_from_slice(&EBT_ENTRY_OR_ENTRIES.to_ne_bytes()); // bitmask
        buf.extend_from_slice(&0u32.to_ne_bytes()); // invflags
        buf.extend_from_slice(&ethproto_be.to_ne_bytes()); // ethproto
        buf.resize(buf.len() + IFNAMSIZ, 0); // in
        buf.resize(buf.len() + IFNAMSIZ, 0); // logical_in
        let mut out_buf = [0u8; IFNAMSIZ];
        out_buf[..out_if.len()].copy_from_slice(out_if.as_bytes());
        buf.extend_from_slice(&out_buf);
        buf.resize(start + ENTRY_NEXT_OFFSET_OFF, 0);
        buf.extend_from_slice(&next_offset.to_ne_bytes());
        buf.resize(start + next_offset as usize, 0);
    }

    #[test]
    fn scans_only_output_chain_matching_rules() {
        let ip_be = 0x0800u16.to_be();
        let mut entries = Vec::new();
        push_chain(&mut entries, "PREROUTING", 0);
        push_entry(&mut entries, ip_be, "ethX", 128); // belongs to PREROUTING, must be skipped
        push_chain(&mut entries, "OUTPUT", 1);
        push_entry(&mut entries, ip_be, "veth0", 128);
        push_entry(&mut entries, 0xc0deu16.to_be(), "veth1", 128); // wrong proto
        push_chain(&mut entries, "POSTROUTING", 3);

        let mut counters = vec![0u8; 3 * 16];
        // Counter for PREROUTING's one entry (index 0): irrelevant, must not surface.
        counters[0..8].copy_from_slice(&999u64.to_ne_bytes());
        // Counter for OUTPUT's first entry (index 1): pcnt=100, bcnt=5000.
        counters[16..24].copy_from_slice(&100u64.to_ne_bytes());
        counters[24..32].copy_from_slice(&5000u64.to_ne_bytes());

        let readings = scan_output(&entries, &counters, ip_be);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].out_if, "veth0");
        assert_eq!(readings[0].pcnt, 100);
        assert_eq!(readings[0].bcnt, 100 * 14 + 5000);
    }

    #[test]
    fn scenario_from_spec_pcnt_100_bcnt_5000() {
        let xia_be = 0xc0deu16.to_be();
        let mut entries = Vec::new();
        push_chain(&mut entries, "OUTPUT", 0);
        push_entry(&mut entries, xia_be, "veth0", 128);

        let mut counters = vec![0u8; 16];
        counters[0..8].copy_from_slice(&100u64.to_ne_bytes());
        counters[8..16].copy_from_slice(&5000u64.to_ne_bytes());

        let readings = scan_output(&entries, &counters, xia_be);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].pcnt, 100);
        assert_eq!(readings[0].bcnt, 6400);
    }

    #[test]
    fn empty_filter_table_yields_no_readings() {
        assert!(scan_output(&[], &[], 0x0800u16.to_be()).is_empty());
    }
}
