//! Address/prefix loader.
//!
//! Reads a text file of IPv4 CIDRs, shuffles it with a partial Fisher–Yates
//! driven by the destination-shuffle seed (`s1`), and materializes each
//! line into a [`NetPrefix`] that PW sends to and RK installs routes for.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;

use crate::error::PrefixError;
use crate::prng::{Seed, SeededRng};

/// One entry from the prefix file, after shuffling and address forcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetPrefix {
    /// Representative address: the network address with the bit immediately
    /// after the mask boundary forced to 1, so it can never collide with a
    /// shorter prefix under longest-prefix-match.
    pub addr: Ipv4Addr,
    /// `32` when the prefix was loaded with `force_addr = true` (treated as
    /// a host route); otherwise the mask parsed from the file.
    pub mask_bits: u8,
    /// Egress port index, assigned by [`assign_ports`].
    pub port: u16,
}

/// Loads, shuffles, and materializes the prefixes in `path`.
///
/// `force_addr` treats every entry as a host address (mask forced to 32)
/// rather than keeping its parsed prefix length. `shuffle_seed` is `s1`.
pub fn load_prefixes(
    path: &Path,
    force_addr: bool,
    shuffle_seed: Seed,
) -> Result<Vec<NetPrefix>, PrefixError> {
    let raw = std::fs::read(path).map_err(|source| PrefixError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut had_nul = false;
    let cleaned: Vec<u8> = raw
        .into_iter()
        .map(|b| {
            if b == 0 {
                had_nul = true;
                b'?'
            } else {
                b
            }
        })
        .collect();
    if had_nul {
        log::warn!("prefix file `{}` contained embedded NUL bytes; replaced with '?'", path.display());
    }
    let text = String::from_utf8_lossy(&cleaned).into_owned();

    let mut lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return Err(PrefixError::Empty {
            path: path.display().to_string(),
        });
    }

    shuffle(&mut lines, shuffle_seed);

    let mut prefixes = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let net: Ipv4Network = line.trim().parse().map_err(|_| PrefixError::BadCidr {
            line: i as u64,
            text: (*line).to_string(),
        })?;
        let m = net.prefix();
        if !(8..=32).contains(&m) {
            return Err(PrefixError::BadCidr {
                line: i as u64,
                text: (*line).to_string(),
            });
        }

        let addr = force_bit_after_mask(net.network(), m);
        let mask_bits = if force_addr { 32 } else { m };
        prefixes.push(NetPrefix { addr, mask_bits, port: 0 });
    }

    Ok(prefixes)
}

/// Partial Fisher–Yates: for each position in turn, swap it with a
/// uniformly chosen position at or after it. Equivalent to the reference
/// algorithm's "swap element 0 with a random pick, then shrink the active
/// range from the front" — expressed here as advancing an index instead of
/// a base pointer.
fn shuffle(lines: &mut [&str], seed: Seed) {
    let mut rng = SeededRng::from_seed(seed);
    let n = lines.len();
    for start in 0..n.saturating_sub(1) {
        let remaining = (n - start) as u64;
        let offset = rng.sample_0_n1(remaining) as usize;
        lines.swap(start, start + offset);
    }
}

/// Sets the bit immediately after the `/m` mask boundary, 0-indexed from
/// the MSB of the 32-bit address. No-op for `m == 32` (a host address has
/// no bit beyond its boundary).
fn force_bit_after_mask(addr: Ipv4Addr, m: u8) -> Ipv4Addr {
    if m >= 32 {
        return addr;
    }
    let mut octets = addr.octets();
    let byte_idx = (m / 8) as usize;
    let bit_in_byte = m % 8;
    octets[byte_idx] |= 0x80u8 >> bit_in_byte;
    Ipv4Addr::from(octets)
}

/// Assigns every prefix a uniformly random port in `[0, ports)`.
pub fn assign_ports(prefixes: &mut [NetPrefix], ports: u16, rng: &mut SeededRng) {
    for p in prefixes.iter_mut() {
        p.port = rng.sample_0_n1(ports as u64) as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn scenario_from_spec_single_entry() {
        let dir = std::env::temp_dir().join("net-eval-prefix-test-1");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_file(&dir, "prefixes", "10.0.0.0/8\n");

        let prefixes = load_prefixes(&path, false, [0; 10]).unwrap();
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].addr, Ipv4Addr::new(10, 128, 0, 0));
        assert_eq!(prefixes[0].mask_bits, 8);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn force_addr_sets_mask_to_32() {
        let dir = std::env::temp_dir().join("net-eval-prefix-test-2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_file(&dir, "prefixes", "192.168.1.0/24\n");

        let prefixes = load_prefixes(&path, true, [0; 10]).unwrap();
        assert_eq!(prefixes[0].mask_bits, 32);
        assert_eq!(prefixes[0].addr, Ipv4Addr::new(192, 168, 1, 128));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn forced_bit_holds_for_every_mask_length() {
        for m in 8u8..32 {
            let addr = force_bit_after_mask(Ipv4Addr::new(0, 0, 0, 0), m);
            let bits = u32::from(addr);
            let bit_pos = 31 - m as u32;
            assert_eq!((bits >> bit_pos) & 1, 1, "mask {m} did not force its boundary bit");
        }
    }

    #[test]
    fn shuffle_preserves_multiset() {
        let mut lines = vec!["a", "b", "c", "d", "e"];
        let original = lines.clone();
        shuffle(&mut lines, [7; 10]);
        let mut sorted_shuffled = lines.clone();
        sorted_shuffled.sort();
        let mut sorted_original = original;
        sorted_original.sort();
        assert_eq!(sorted_shuffled, sorted_original);
    }

    #[test]
    fn assign_ports_stays_in_range() {
        let mut prefixes = vec![
            NetPrefix { addr: Ipv4Addr::UNSPECIFIED, mask_bits: 24, port: 0 };
            10
        ];
        let mut rng = SeededRng::from_seed([3; 10]);
        assign_ports(&mut prefixes, 4, &mut rng);
        for p in &prefixes {
            assert!(p.port < 4);
        }
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = std::env::temp_dir().join("net-eval-prefix-test-3");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_file(&dir, "prefixes", "");

        assert!(load_prefixes(&path, false, [0; 10]).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bad_cidr_is_rejected() {
        let dir = std::env::temp_dir().join("net-eval-prefix-test-4");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_file(&dir, "prefixes", "not-a-cidr\n");

        assert!(load_prefixes(&path, false, [0; 10]).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
