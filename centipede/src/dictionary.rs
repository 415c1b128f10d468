// SPDX-License-Identifier: Apache-2.0

//! Loads a `--dictionary` file into a [`Mutator`], accepting either of the
//! two formats §6 documents: the Centipede-native packed-blob format, or an
//! AFL/libFuzzer ASCII dictionary. Disambiguated by sniffing the packed-blob
//! framing magic before falling back to text.

use std::path::Path;

use anyhow::{Context, Result};
use centipede_core::blob_file::MAGIC_BEGIN;
use centipede_core::mutator::Mutator;

pub fn load(mutator: &mut Mutator, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading dictionary at {}", path.display()))?;
    if bytes.windows(MAGIC_BEGIN.len()).any(|w| w == MAGIC_BEGIN) {
        mutator.load_packed_dictionary(&bytes);
    } else {
        let text = String::from_utf8_lossy(&bytes);
        mutator.load_afl_dictionary(&text);
    }
    Ok(())
}
