// SPDX-License-Identifier: Apache-2.0

//! Loads the PC table the engine needs for coverage-frontier computation
//! and crash symbolization (§3 "PC table and control-flow table"). The
//! table itself is an external input: either a file already on disk, or
//! obtained by invoking the instrumented binary's `--dump_pc_table` mode.

use std::path::Path;

use anyhow::{bail, Context, Result};
use centipede_core::corpus::PcTableEntry;
use command_ext::CommandExtCheck;

/// Bit set on a PC-table entry's `flags` word when that PC is a function's
/// first instrumented edge (§3).
const FUNC_ENTRY: u64 = 1;

/// Parse a packed `{u64 pc, u64 flags}` stream into [`PcTableEntry`]s.
pub fn parse(bytes: &[u8]) -> Result<Vec<PcTableEntry>> {
    if bytes.len() % 16 != 0 {
        bail!("PC table size {} is not a multiple of 16 bytes", bytes.len());
    }
    Ok(bytes
        .chunks_exact(16)
        .map(|chunk| {
            let pc = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let flags = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            PcTableEntry {
                pc,
                is_func_entry: flags & FUNC_ENTRY != 0,
            }
        })
        .collect())
}

/// Load a PC table from a file already dumped to disk.
pub fn load_from_file(path: &Path) -> Result<Vec<PcTableEntry>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading PC table at {}", path.display()))?;
    parse(&bytes)
}

/// Invoke `binary --dump_pc_table=out_path`, then parse the file it wrote.
/// This is the `require_pc_table`/coverage-frontier on-ramp (§3, §6).
pub fn dump_from_binary(binary: &Path, out_path: &Path) -> Result<Vec<PcTableEntry>> {
    std::process::Command::new(binary)
        .arg(format!("--dump_pc_table={}", out_path.display()))
        .check()
        .with_context(|| format!("running {} --dump_pc_table", binary.display()))?;
    load_from_file(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_func_entry_flag() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(&FUNC_ENTRY.to_le_bytes());
        bytes.extend_from_slice(&101u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());

        let table = parse(&bytes).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table[0].is_func_entry);
        assert!(!table[1].is_func_entry);
    }

    #[test]
    fn rejects_misaligned_table() {
        assert!(parse(&[0u8; 15]).is_err());
    }
}
