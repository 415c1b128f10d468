// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Precondition and I/O error taxonomy shared across the core crate.
///
/// Precondition variants signal programming errors (double-open, write after
/// read, etc.) and are meant to be fatal to the caller. The rest are
/// recoverable and are handled by the shard loop per spec §7.
#[derive(Error, Debug)]
pub enum CentipedeError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("end of blob stream")]
    EndOfStream,

    #[error("frame corrupt: {0}")]
    FrameCorrupt(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CentipedeError>;
