// SPDX-License-Identifier: Apache-2.0

//! Stateful byte-array mutator with dictionary and crossover support (§4.3).
//! Every primitive mutates in place and reports whether it actually changed
//! anything; declining primitives (e.g. `erase_bytes` on a one-byte input)
//! are not errors, they are retried by the dispatcher a small fixed number
//! of times.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::blob_file::scan_blobs;
use crate::error::{CentipedeError, Result};

/// Retries per family before `mutate` gives up on a declining primitive.
const MAX_RETRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    SameSize,
    SizeIncreasing,
    SizeDecreasing,
}

const FAMILIES: [Family; 3] = [
    Family::SameSize,
    Family::SizeIncreasing,
    Family::SizeDecreasing,
];

pub struct Mutator {
    rng: StdRng,
    dictionary: Vec<Vec<u8>>,
}

impl Mutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dictionary: Vec::new(),
        }
    }

    pub fn add_to_dictionary(&mut self, entries: impl IntoIterator<Item = Vec<u8>>) {
        self.dictionary
            .extend(entries.into_iter().filter(|e| !e.is_empty()));
    }

    /// Load dictionary entries from the native packed-blob format (§6).
    pub fn load_packed_dictionary(&mut self, bytes: &[u8]) {
        self.add_to_dictionary(scan_blobs(bytes));
    }

    /// Parse an AFL/libFuzzer-style ASCII dictionary (§6): per-line
    /// `name="escaped"`, `#` begins a comment, supports `\r \n \t \" \\` and
    /// `\xHH` escapes. Non-ASCII input or an unterminated quote is rejected
    /// line by line (malformed lines are skipped, matching the tolerant I/O
    /// posture of §7).
    pub fn load_afl_dictionary(&mut self, text: &str) {
        for entry in parse_afl_dictionary(text) {
            self.add_to_dictionary([entry]);
        }
    }

    pub fn dictionary_len(&self) -> usize {
        self.dictionary.len()
    }

    fn random_dict_entry_fitting(&mut self, max_len: usize) -> Option<Vec<u8>> {
        let candidates: Vec<&Vec<u8>> = self
            .dictionary
            .iter()
            .filter(|e| e.len() <= max_len)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    // ---- same-size primitives ----------------------------------------

    pub fn flip_bit(&mut self, data: &mut [u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let byte_idx = self.rng.gen_range(0..data.len());
        let bit_idx = self.rng.gen_range(0..8);
        data[byte_idx] ^= 1 << bit_idx;
        true
    }

    pub fn swap_bytes(&mut self, data: &mut [u8]) -> bool {
        if data.len() < 2 {
            return false;
        }
        let i = self.rng.gen_range(0..data.len());
        let mut j = self.rng.gen_range(0..data.len());
        if i == j {
            j = (j + 1) % data.len();
        }
        data.swap(i, j);
        true
    }

    pub fn change_byte(&mut self, data: &mut [u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let idx = self.rng.gen_range(0..data.len());
        data[idx] = self.rng.gen();
        true
    }

    pub fn overwrite_from_dictionary(&mut self, data: &mut Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let Some(entry) = self.random_dict_entry_fitting(data.len()) else {
            return false;
        };
        let max_start = data.len() - entry.len();
        let start = if max_start == 0 {
            0
        } else {
            self.rng.gen_range(0..=max_start)
        };
        data[start..start + entry.len()].copy_from_slice(&entry);
        true
    }

    // ---- size-increasing primitives -----------------------------------

    pub fn insert_bytes(&mut self, data: &mut Vec<u8>) -> bool {
        let n = self.rng.gen_range(1..=20usize);
        let pos = self.rng.gen_range(0..=data.len());
        let bytes: Vec<u8> = (0..n).map(|_| self.rng.gen()).collect();
        data.splice(pos..pos, bytes);
        true
    }

    pub fn insert_from_dictionary(&mut self, data: &mut Vec<u8>) -> bool {
        if self.dictionary.is_empty() {
            return false;
        }
        let idx = self.rng.gen_range(0..self.dictionary.len());
        let entry = self.dictionary[idx].clone();
        let pos = self.rng.gen_range(0..=data.len());
        data.splice(pos..pos, entry);
        true
    }

    // ---- size-decreasing primitives -----------------------------------

    pub fn erase_bytes(&mut self, data: &mut Vec<u8>) -> bool {
        if data.len() <= 1 {
            return false;
        }
        let max_erase = data.len() / 2;
        let n = self.rng.gen_range(1..=max_erase);
        let max_start = data.len() - n;
        let start = self.rng.gen_range(0..=max_start);
        data.drain(start..start + n);
        true
    }

    // ---- crossover ------------------------------------------------------

    pub fn crossover_insert(&mut self, data: &mut Vec<u8>, other: &[u8]) -> bool {
        if other.is_empty() {
            return false;
        }
        let k = self.rng.gen_range(1..=other.len());
        let f = self.rng.gen_range(0..=other.len() - k);
        let pos = self.rng.gen_range(0..=data.len());
        data.splice(pos..pos, other[f..f + k].iter().copied());
        true
    }

    pub fn crossover_overwrite(&mut self, data: &mut [u8], other: &[u8]) -> bool {
        if data.is_empty() || other.is_empty() {
            return false;
        }
        let max_len = (data.len() / 2).max(1).min(data.len());
        let len = self.rng.gen_range(1..=max_len).min(other.len());
        let data_start = self.rng.gen_range(0..=data.len() - len);
        let other_start = self.rng.gen_range(0..=other.len() - len);
        data[data_start..data_start + len].copy_from_slice(&other[other_start..other_start + len]);
        true
    }

    pub fn crossover(&mut self, data: &mut Vec<u8>, other: &[u8]) -> bool {
        if self.rng.gen_bool(0.5) {
            self.crossover_insert(data, other)
        } else {
            self.crossover_overwrite(data, other)
        }
    }

    // ---- top-level dispatch ---------------------------------------------

    fn apply_family(&mut self, family: Family, data: &mut Vec<u8>) -> bool {
        match family {
            Family::SameSize => match self.rng.gen_range(0..4) {
                0 => self.flip_bit(data),
                1 => self.swap_bytes(data),
                2 => self.change_byte(data),
                _ => self.overwrite_from_dictionary(data),
            },
            Family::SizeIncreasing => {
                if self.rng.gen_bool(0.5) {
                    self.insert_bytes(data)
                } else {
                    self.insert_from_dictionary(data)
                }
            }
            Family::SizeDecreasing => self.erase_bytes(data),
        }
    }

    /// Mutate `data` in place. Picks uniformly among the three families and,
    /// within a family, among its primitives; retries a declining choice up
    /// to [`MAX_RETRIES`] times. Every mutator invariantly leaves `data`
    /// non-empty (§4.3).
    pub fn mutate(&mut self, data: &mut Vec<u8>) -> bool {
        for _ in 0..MAX_RETRIES {
            let family = FAMILIES[self.rng.gen_range(0..FAMILIES.len())];
            if self.apply_family(family, data) {
                debug_assert!(!data.is_empty());
                return true;
            }
        }
        false
    }

    /// Produce `n` mutants by sampling a random seed from `inputs` and, with
    /// probability 1/2 when `allow_crossover`, crossing it with another
    /// random input; otherwise applying `mutate` (§4.3).
    pub fn mutate_many(
        &mut self,
        inputs: &[Vec<u8>],
        n: usize,
        allow_crossover: bool,
    ) -> Result<Vec<Vec<u8>>> {
        if inputs.is_empty() {
            return Err(CentipedeError::Precondition(
                "mutate_many requires at least one seed input".into(),
            ));
        }
        let mut mutants = Vec::with_capacity(n);
        for _ in 0..n {
            let seed_idx = self.rng.gen_range(0..inputs.len());
            let mut candidate = inputs[seed_idx].clone();
            if allow_crossover && inputs.len() > 1 && self.rng.gen_bool(0.5) {
                let mut other_idx = self.rng.gen_range(0..inputs.len());
                if other_idx == seed_idx {
                    other_idx = (other_idx + 1) % inputs.len();
                }
                self.crossover(&mut candidate, &inputs[other_idx]);
            } else {
                self.mutate(&mut candidate);
            }
            if candidate.is_empty() {
                candidate.push(0);
            }
            mutants.push(candidate);
        }
        Ok(mutants)
    }
}

/// Parse an AFL/libFuzzer dictionary file's text into raw byte-string
/// entries (§6, §8 scenario 5). Lines that are blank, comments (`#...`), or
/// malformed are skipped.
pub fn parse_afl_dictionary(text: &str) -> Vec<Vec<u8>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq) = line.find('=') else {
            continue;
        };
        let quoted = line[eq + 1..].trim();
        if let Some(bytes) = parse_quoted_dict_value(quoted) {
            entries.push(bytes);
        }
    }
    entries
}

fn parse_quoted_dict_value(quoted: &str) -> Option<Vec<u8>> {
    if !quoted.is_ascii() {
        return None;
    }
    let bytes = quoted.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return None;
    }
    let inner = &bytes[1..bytes.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        if inner[i] == b'\\' {
            if i + 1 >= inner.len() {
                return None;
            }
            match inner[i + 1] {
                b'\\' => {
                    out.push(b'\\');
                    i += 2;
                }
                b'"' => {
                    out.push(b'"');
                    i += 2;
                }
                b'r' => {
                    out.push(b'\r');
                    i += 2;
                }
                b'n' => {
                    out.push(b'\n');
                    i += 2;
                }
                b't' => {
                    out.push(b'\t');
                    i += 2;
                }
                b'x' => {
                    if i + 3 >= inner.len() {
                        return None;
                    }
                    let hex = std::str::from_utf8(&inner[i + 2..i + 4]).ok()?;
                    out.push(u8::from_str_radix(hex, 16).ok()?);
                    i += 4;
                }
                _ => return None,
            }
        } else {
            out.push(inner[i]);
            i += 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_primitive_that_succeeds_changes_data() {
        let mut m = Mutator::new(42);
        for _ in 0..500 {
            let mut data = vec![1u8, 2, 3, 4, 5];
            let before = data.clone();
            if m.flip_bit(&mut data) {
                assert_ne!(data, before);
            }
        }
    }

    #[test]
    fn mutate_never_empties_data() {
        let mut m = Mutator::new(7);
        for _ in 0..2000 {
            let mut data = vec![9u8];
            m.mutate(&mut data);
            assert!(!data.is_empty());
        }
    }

    #[test]
    fn erase_bytes_declines_on_single_byte_input() {
        let mut m = Mutator::new(1);
        let mut data = vec![3u8];
        assert!(!m.erase_bytes(&mut data));
        assert_eq!(data, vec![3u8]);
    }

    #[test]
    fn overwrite_from_dictionary_declines_when_empty() {
        let mut m = Mutator::new(1);
        let mut data = vec![1, 2, 3];
        assert!(!m.overwrite_from_dictionary(&mut data));
    }

    #[test]
    fn overwrite_from_dictionary_uses_fitting_entry() {
        let mut m = Mutator::new(1);
        m.add_to_dictionary([vec![0xAA, 0xBB]]);
        let mut data = vec![1u8, 2, 3, 4];
        assert!(m.overwrite_from_dictionary(&mut data));
        assert!(data.windows(2).any(|w| w == [0xAA, 0xBB]));
    }

    #[test]
    fn afl_dict_parses_escapes() {
        let entries = parse_afl_dictionary(r#"name="\xBC\\a\xAB\x00""#);
        assert_eq!(entries, vec![vec![0xBC, b'\\', b'a', 0xAB, 0x00]]);
    }

    #[test]
    fn afl_dict_skips_comments_and_blank_lines() {
        let entries = parse_afl_dictionary("# comment\n\nfoo=\"a\"\n");
        assert_eq!(entries, vec![b"a".to_vec()]);
    }

    #[test]
    fn afl_dict_rejects_unterminated_quote() {
        let entries = parse_afl_dictionary(r#"name="abc"#);
        assert!(entries.is_empty());
    }

    #[test]
    fn mutate_many_requires_a_seed_input() {
        let mut m = Mutator::new(1);
        assert!(matches!(
            m.mutate_many(&[], 4, true),
            Err(CentipedeError::Precondition(_))
        ));
    }

    #[test]
    fn mutate_many_produces_requested_count() {
        let mut m = Mutator::new(1);
        let inputs = vec![vec![1, 2, 3], vec![4, 5, 6, 7]];
        let mutants = m.mutate_many(&inputs, 10, true).unwrap();
        assert_eq!(mutants.len(), 10);
        assert!(mutants.iter().all(|m| !m.is_empty()));
    }
}
