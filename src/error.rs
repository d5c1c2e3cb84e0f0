//! Error types for cookieguard

use thiserror::Error;

/// Top-level error type for cookieguard
#[derive(Error, Debug)]
pub enum CookieGuardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unparseable control-channel wire data
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Control-channel transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Shared-state region errors
    #[error("Shared state error: {0}")]
    Shared(#[from] SharedStateError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-message wire-format errors (spec §7 "Malformed inbound")
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Unrecognized protocol type: {type_byte:#x}")]
    UnknownType { type_byte: u8 },

    #[error("Unrecognized control code: {code:#x}")]
    UnknownCode { code: u8 },

    #[error("Checksum mismatch")]
    BadChecksum,

    #[error("Reserved bits set where zero is required")]
    ReservedBitsSet,

    #[error("Packet exceeds maximum accepted size of {max} bytes: {got}")]
    PacketTooLarge { max: usize, got: usize },
}

/// Control-channel transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Insufficient privileges to open a raw ICMPv6 socket")]
    InsufficientPrivileges,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared-state region errors. Per spec §7, unavailability at startup is fatal.
#[derive(Error, Debug)]
pub enum SharedStateError {
    #[error("Failed to create shared region at {path}: {reason}")]
    CreateFailed { path: String, reason: String },

    #[error("Failed to attach to shared region at {path}: {reason}")]
    AttachFailed { path: String, reason: String },

    #[error("Shared region at {path} has an incompatible layout (expected magic {expected:#x}, got {got:#x})")]
    IncompatibleLayout {
        path: String,
        expected: u32,
        got: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CookieGuardError {
    /// Whether the process should treat this as fatal and exit.
    ///
    /// Per spec §7 only "shared region unavailable at startup" is fatal;
    /// everything else is handled by dropping the offending datagram.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Process exit code for a fatal error surfaced at the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Shared(_) => 2,
            Self::Transport(_) => 3,
            Self::Wire(_) => 4,
            Self::System(_) => 5,
        }
    }
}

/// Result type alias for cookieguard operations
pub type Result<T> = std::result::Result<T, CookieGuardError>;
