use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("datagram too short: len is {len} but at least {required} bytes are required")]
    TooShort { len: usize, required: usize },
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error("address family mismatch: client {client} upstream {upstream}")]
    AddressFamilyMismatch {
        client: SocketAddr,
        upstream: SocketAddr,
    },
    #[error("{program} {args} failed ({status}): {stderr}")]
    CommandFailed {
        program: &'static str,
        args: String,
        status: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} timed out after {timeout:?}")]
    CommandTimeout {
        program: &'static str,
        timeout: Duration,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
