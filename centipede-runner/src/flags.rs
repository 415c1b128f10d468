// SPDX-License-Identifier: Apache-2.0

//! Parser for `CENTIPEDE_RUNNER_FLAGS`: a colon-delimited string of the form
//! `:flag:flag=value:` that the engine sets in the target process's
//! environment to drive in-process execution without any command-line
//! arguments of its own (the target binary's `argv` belongs to the user).

use std::collections::HashMap;

/// Runner behavior derived from `CENTIPEDE_RUNNER_FLAGS`.
#[derive(Debug, Clone)]
pub struct RunnerFlags {
    pub arg1: Option<String>,
    pub arg2: Option<String>,
    pub arg3: Option<String>,
    pub timeout_in_seconds: u64,
    pub rss_limit_mb: u64,
    pub shmem_inputs: Option<String>,
    pub shmem_outputs: Option<String>,
    pub extra: HashMap<String, String>,
}

impl Default for RunnerFlags {
    fn default() -> Self {
        Self {
            arg1: None,
            arg2: None,
            arg3: None,
            timeout_in_seconds: 0,
            rss_limit_mb: 0,
            shmem_inputs: None,
            shmem_outputs: None,
            extra: HashMap::new(),
        }
    }
}

/// Parse a flags string of the form `:flag:flag=value:` (leading/trailing
/// colons optional). Unknown flags are preserved in `extra` rather than
/// rejected, so a newer engine can pass flags an older runner ignores.
pub fn parse(raw: &str) -> RunnerFlags {
    let mut flags = RunnerFlags::default();
    for clause in raw.split(':') {
        if clause.is_empty() {
            continue;
        }
        let (key, value) = match clause.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (clause, None),
        };
        match key {
            "arg1" => flags.arg1 = value,
            "arg2" => flags.arg2 = value,
            "arg3" => flags.arg3 = value,
            "timeout_in_seconds" => {
                flags.timeout_in_seconds = value.and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            "rss_limit_mb" => {
                flags.rss_limit_mb = value.and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            "shmem_inputs" => flags.shmem_inputs = value,
            "shmem_outputs" => flags.shmem_outputs = value,
            other => {
                flags.extra.insert(other.to_string(), value.unwrap_or_default());
            }
        }
    }
    flags
}

/// Read and parse `CENTIPEDE_RUNNER_FLAGS` from the process environment.
/// Returns defaults when the variable is unset.
pub fn from_env() -> RunnerFlags {
    match std::env::var("CENTIPEDE_RUNNER_FLAGS") {
        Ok(raw) => parse(&raw),
        Err(_) => RunnerFlags::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_valued_flags() {
        let flags = parse(":timeout_in_seconds=30:rss_limit_mb=2048:shmem_inputs=/foo:");
        assert_eq!(flags.timeout_in_seconds, 30);
        assert_eq!(flags.rss_limit_mb, 2048);
        assert_eq!(flags.shmem_inputs.as_deref(), Some("/foo"));
    }

    #[test]
    fn unknown_flags_go_to_extra() {
        let flags = parse(":some_future_flag=1:");
        assert_eq!(flags.extra.get("some_future_flag"), Some(&"1".to_string()));
    }

    #[test]
    fn empty_string_yields_defaults() {
        let flags = parse("");
        assert_eq!(flags.timeout_in_seconds, 0);
        assert!(flags.shmem_inputs.is_none());
    }

    #[test]
    fn leading_and_trailing_colons_are_tolerated() {
        let a = parse(":arg1=x:arg2=y:");
        let b = parse("arg1=x:arg2=y");
        assert_eq!(a.arg1, b.arg1);
        assert_eq!(a.arg2, b.arg2);
    }
}
