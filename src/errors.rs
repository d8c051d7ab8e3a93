use std::io;
use thiserror::Error;

/// Failures of the byte stream or the three-wire link layer.
///
/// None of these are retried by the framer itself.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("checksum mismatch (expected {expected:#04X}, got {actual:#04X})")]
    Checksum { expected: u8, actual: u8 },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("read timed out")]
    Timeout,
    #[error("no acknowledgement for frame seq={seq}")]
    AckTimeout { seq: u8 },
    #[error("payload of {len} bytes exceeds the frame limit")]
    PayloadTooLarge { len: usize },
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
    #[error("link not active")]
    NotActive,
    #[error("cancelled")]
    Cancelled,
}

/// Failures of a single command/event exchange.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("no completion for opcode {opcode:#06X} before deadline")]
    Timeout { opcode: u16 },
    #[error("another command is outstanding")]
    Busy,
    #[error("opcode {opcode:#06X} failed with status {status:#04X}")]
    Status { opcode: u16, status: u8 },
    #[error("parameters of {len} bytes exceed 255")]
    ParamsTooLong { len: usize },
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

impl CommandError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Link(LinkError::Cancelled))
    }
}

/// Failures of the firmware download. Every variant is fatal to the attempt.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),
    #[error("firmware io error: {0}")]
    Io(#[from] io::Error),
    #[error("config blob of {len} bytes exceeds {max}")]
    ConfigTooLarge { len: usize, max: usize },
    #[error("enter download mode failed: {0}")]
    DownloadMode(#[source] CommandError),
    #[error("fragment {index} rejected: {source}")]
    FragmentRejected {
        index: usize,
        #[source]
        source: CommandError,
    },
    #[error("config blob rejected: {0}")]
    ConfigRejected(#[source] CommandError),
    #[error("launch rejected: {0}")]
    LaunchRejected(#[source] CommandError),
}

impl LoadError {
    /// True when the failure was a missing completion rather than an explicit rejection.
    pub fn is_timeout(&self) -> bool {
        match self {
            LoadError::DownloadMode(e)
            | LoadError::FragmentRejected { source: e, .. }
            | LoadError::ConfigRejected(e) => matches!(
                e,
                CommandError::Timeout { .. }
                    | CommandError::Link(LinkError::AckTimeout { .. } | LinkError::Timeout)
            ),
            _ => false,
        }
    }
}

/// Everything a bring-up attempt can fail with, one variant per failure class.
#[derive(Debug, Error)]
pub enum BringupError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: LinkError,
    },
    #[error("link establishment failed: {0}")]
    Link(#[from] LinkError),
    #[error("controller command failed: {0}")]
    Command(#[from] CommandError),
    #[error("firmware load failed: {0}")]
    Load(#[from] LoadError),
    #[error("speed change to {baud} failed: {source}")]
    Speed {
        baud: u32,
        #[source]
        source: CommandError,
    },
}

pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_OPEN: i32 = 2;
pub const EXIT_SIGNATURE: i32 = 3;
pub const EXIT_DOWNLOAD_TIMEOUT: i32 = 4;
pub const EXIT_LAUNCH: i32 = 5;
pub const EXIT_CANCELLED: i32 = 130;

impl BringupError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_cancelled() => EXIT_CANCELLED,
            BringupError::Open { .. } => EXIT_OPEN,
            BringupError::Load(LoadError::InvalidImage(_)) => EXIT_SIGNATURE,
            BringupError::Load(LoadError::LaunchRejected(_)) => EXIT_LAUNCH,
            BringupError::Load(e) if e.is_timeout() => EXIT_DOWNLOAD_TIMEOUT,
            _ => EXIT_GENERIC,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            BringupError::Link(LinkError::Cancelled) => true,
            BringupError::Command(e) | BringupError::Speed { source: e, .. } => e.is_cancelled(),
            BringupError::Load(
                LoadError::DownloadMode(e)
                | LoadError::FragmentRejected { source: e, .. }
                | LoadError::ConfigRejected(e)
                | LoadError::LaunchRejected(e),
            ) => e.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T, E = LinkError> = std::result::Result<T, E>;
