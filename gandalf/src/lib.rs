#![doc = include_str!("../README.md")]
// Jackson Coxson

pub mod engine;
pub mod lifecycle;
pub mod mapping;
pub mod proxy;
pub mod status;
pub mod usbmuxd;

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A trait combining all required characteristics for a tunnel leg
///
/// Any asynchronous duplex socket qualifies; tokio's TcpStream and
/// UnixStream implement this trait, as does the post-connect mux socket.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Process exit codes of the `gandalf` binary. The numeric values are
/// contract; scripts key off them.
pub mod exit_codes {
    pub const UNHANDLED: i32 = 1;
    pub const SIGNAL_FAILED: i32 = 2;
    pub const ALREADY_RUNNING: i32 = 3;
    pub const PID_FILE_DENIED: i32 = 4;
    pub const NO_RUNNING_DAEMON: i32 = 5;
    pub const STATUS_UNREACHABLE: i32 = 6;
    pub const MUX_UNREACHABLE: i32 = 7;
    pub const MAPPING_FILE: i32 = 8;
    pub const MUX_IO: i32 = 9;
    pub const UNKNOWN: i32 = 10;
}

/// Error type for everything that can go wrong between the mapping file,
/// the mux socket, and a running tunnel
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GandalfError {
    #[error("mux socket io failed")]
    Socket(#[from] io::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("mux is not reachable at {0}")]
    MuxUnreachable(String),
    #[error("unexpected reply from mux")]
    UnexpectedReply,
    #[error("unknown message `{0}` on mux subscription")]
    UnknownReply(String),
    #[error("unknown result code `{0}` returned from mux")]
    UnknownReplyCode(u64),
    #[error("mux rejected the request as malformed")]
    MalformedRequest,
    #[error("device requested is not connected")]
    DeviceNotConnected,
    #[error("port requested is not available on the device")]
    PortNotAvailable,
    #[error("mapping file error: {0}")]
    MappingFile(String),
    #[error("pid file {0} is not writable")]
    PidFileDenied(String),
    #[error("no running daemon found ({0})")]
    NoRunningDaemon(String),
    #[error("can't signal the running daemon: {0}")]
    SignalFailed(String),
    #[error("status http server failed")]
    Http(#[from] hyper::Error),
}

impl GandalfError {
    /// Maps an error to the exit code the binary reports for it
    pub fn exit_code(&self) -> i32 {
        match self {
            GandalfError::SignalFailed(_) => exit_codes::SIGNAL_FAILED,
            GandalfError::PidFileDenied(_) => exit_codes::PID_FILE_DENIED,
            GandalfError::NoRunningDaemon(_) => exit_codes::NO_RUNNING_DAEMON,
            GandalfError::MuxUnreachable(_) => exit_codes::MUX_UNREACHABLE,
            GandalfError::MappingFile(_) => exit_codes::MAPPING_FILE,
            GandalfError::Socket(_) => exit_codes::MUX_IO,
            _ => exit_codes::UNKNOWN,
        }
    }
}
