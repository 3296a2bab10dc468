//! Seed-file loader.
//!
//! Reads `s1`, `s2`, and `node_seed` from a flat text file of 8-hex-digit
//! lines (see `examples/original_source/seeds.c`). All nodes participating
//! in the same run share `s1` (destination shuffle); only the router uses
//! `s2` (port assignment); each node gets its own `node_seed` (Zipf draw
//! stream).

use std::io::{self, BufRead};
use std::path::Path;

use crate::error::SeedError;
use crate::prng::{Seed, SEED_WORDS};

const DEFAULT_SEEDS_FILENAME: &str = "seeds";

/// Returns the path `load_seeds` reads from when none is given explicitly:
/// `seeds` in the current directory.
pub fn default_seeds_path() -> &'static Path {
    Path::new(DEFAULT_SEEDS_FILENAME)
}

/// Loads `(s1, s2, node_seed)` for `(run, nnodes, node_id)` from `path`.
///
/// Layout per run `r` (1-indexed): `10` lines for `s1`, `10` lines for
/// `s2`, then `nnodes * 10` lines, one block of 10 per node's
/// `node_seed`. `node_id` is 1-indexed into that block.
pub fn load_seeds(
    path: &Path,
    run: u64,
    nnodes: u64,
    node_id: u64,
) -> Result<(Seed, Seed, Seed), SeedError> {
    debug_assert!(run >= 1 && nnodes >= 1 && node_id >= 1 && node_id <= nnodes);

    let file = std::fs::File::open(path).map_err(|source| SeedError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let mut lines = io::BufReader::new(file).lines();

    let to_skip = (run - 1) * (2 + nnodes) * SEED_WORDS as u64;
    skip_lines(&mut lines, to_skip, path, run, nnodes)?;

    let s1 = read_seed_vec(&mut lines, path)?;
    let s2 = read_seed_vec(&mut lines, path)?;

    let to_skip = (node_id - 1) * SEED_WORDS as u64;
    skip_lines(&mut lines, to_skip, path, run, nnodes)?;

    let node_seed = read_seed_vec(&mut lines, path)?;

    Ok((s1, s2, node_seed))
}

fn skip_lines(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    n: u64,
    path: &Path,
    run: u64,
    nnodes: u64,
) -> Result<(), SeedError> {
    for _ in 0..n {
        if lines.next().is_none() {
            return Err(SeedError::TooShort {
                path: path.display().to_string(),
                needed: run * (2 + nnodes) * SEED_WORDS as u64,
                found: 0,
            });
        }
    }
    Ok(())
}

fn read_seed_vec(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    path: &Path,
) -> Result<Seed, SeedError> {
    let mut seed = [0u32; SEED_WORDS];
    for (i, slot) in seed.iter_mut().enumerate() {
        let line = lines
            .next()
            .ok_or_else(|| SeedError::TooShort {
                path: path.display().to_string(),
                needed: (i + 1) as u64,
                found: i as u64,
            })?
            .map_err(|source| SeedError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let text = line.trim();
        *slot = u32::from_str_radix(text, 16).map_err(|_| SeedError::BadLine {
            line: i as u64,
            text: line.clone(),
        })?;
    }
    Ok(seed)
}
