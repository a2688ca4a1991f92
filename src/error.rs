//! Errors

use std::{io, string};

use thiserror::Error;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum Error {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("bad magic, not a squashfs image")]
    BadMagic,

    #[error("unsupported squashfs version {0}.{1}, expected 4.0")]
    UnsupportedVersion(u16, u16),

    #[error("image truncated while reading {0}")]
    Truncated(&'static str),

    #[error("compressed {0} block, this tool reads uncompressed images only")]
    Compressed(&'static str),

    #[error("file not found")]
    NotFound,

    #[error("inode {0:#x} was unexpected in this position")]
    UnexpectedInode(u64),

    #[error("unsupported inode type {0}")]
    UnsupportedInode(u16),

    #[error("corrupted or invalid squashfs image: {0}")]
    CorruptedSquashfs(&'static str),

    #[error("invalid package identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("{file}:{line}: {msg}")]
    Textproto { file: String, line: usize, msg: String },

    #[error("hash mismatch for {url}: got {got}, want {want}")]
    HashMismatch { url: String, got: String, want: String },

    #[error("http {status} for {url}")]
    Http { status: u16, url: String },

    #[error("http transport error: {0}")]
    HttpTransport(String),

    #[error("recipe error: {0}")]
    Recipe(String),

    #[error("{tool} failed with {status}")]
    ToolFailed { tool: String, status: std::process::ExitStatus },

    #[error("elf parse error in {path}: {msg}")]
    Elf { path: String, msg: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        use Error::*;
        match value {
            StdIo(io) => io,
            Deku(e) => e.into(),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ NotFound => Self::new(io::ErrorKind::NotFound, e),
            e @ (HashMismatch { .. } | Http { .. } | HttpTransport(_)) => {
                Self::new(io::ErrorKind::Other, e)
            }
            e => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Status(status, resp) => {
                Error::Http { status, url: resp.get_url().to_string() }
            }
            ureq::Error::Transport(t) => Error::HttpTransport(t.to_string()),
        }
    }
}
