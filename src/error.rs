use std::fmt;

use thiserror::Error;

/// Classifies SOCKS5 negotiation errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5ErrorKind {
    /// The greeting/method-selection exchange failed
    Handshake,
    /// The reply did not follow the protocol (bad version, unknown address type)
    Protocol,
    /// Send or receive on the proxy connection failed
    Io,
    /// The target could not be encoded into a CONNECT request
    Encoding,
}

/// SOCKS5 reply status byte (`REP` field of the CONNECT reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyCode(pub u8);

impl ReplyCode {
    pub const SUCCEEDED: ReplyCode = ReplyCode(0x00);
    pub const GENERAL_FAILURE: ReplyCode = ReplyCode(0x01);
    pub const NOT_ALLOWED: ReplyCode = ReplyCode(0x02);
    pub const NETWORK_UNREACHABLE: ReplyCode = ReplyCode(0x03);
    pub const HOST_UNREACHABLE: ReplyCode = ReplyCode(0x04);
    pub const CONNECTION_REFUSED: ReplyCode = ReplyCode(0x05);
    pub const TTL_EXPIRED: ReplyCode = ReplyCode(0x06);
    pub const COMMAND_NOT_SUPPORTED: ReplyCode = ReplyCode(0x07);
    pub const ADDRESS_NOT_SUPPORTED: ReplyCode = ReplyCode(0x08);

    /// Whether this is the success status.
    pub fn is_success(self) -> bool {
        self == Self::SUCCEEDED
    }

    /// Human readable meaning of the status byte.
    pub fn description(self) -> &'static str {
        match self.0 {
            0x00 => "succeeded",
            0x01 => "general SOCKS server failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "undefined",
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.description(), self.0)
    }
}

/// sockshook error types
#[derive(Error, Debug)]
pub enum HookError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Proxy connect failed: {0}")]
    ProxyConnect(#[source] std::io::Error),

    #[error("SOCKS5 error: {message}")]
    Socks5 {
        kind: Socks5ErrorKind,
        message: String,
    },

    #[error("SOCKS5 request rejected: {0}")]
    Rejected(ReplyCode),

    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Frame of {0} bytes exceeds the control channel limit")]
    FrameTooLarge(usize),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl HookError {
    pub(crate) fn socks5(kind: Socks5ErrorKind, message: impl Into<String>) -> Self {
        HookError::Socks5 {
            kind,
            message: message.into(),
        }
    }

    /// The SOCKS5 status this failure stands for, if it came from the
    /// negotiation. Local failures collapse to the general-failure status.
    pub fn socks_status(&self) -> Option<ReplyCode> {
        match self {
            HookError::Rejected(code) => Some(*code),
            HookError::Socks5 { .. } => Some(ReplyCode::GENERAL_FAILURE),
            _ => None,
        }
    }
}

/// Winsock error codes a failed redirect can surface as.
pub mod wsa {
    #[cfg(windows)]
    pub use windows_sys::Win32::Networking::WinSock::{
        WSAECONNREFUSED, WSAEHOSTUNREACH, WSAENETUNREACH, WSAETIMEDOUT,
    };

    #[cfg(not(windows))]
    pub const WSAENETUNREACH: i32 = 10051;
    #[cfg(not(windows))]
    pub const WSAETIMEDOUT: i32 = 10060;
    #[cfg(not(windows))]
    pub const WSAECONNREFUSED: i32 = 10061;
    #[cfg(not(windows))]
    pub const WSAEHOSTUNREACH: i32 = 10065;
}

impl HookError {
    /// Winsock error the impersonated API reports for this failure.
    ///
    /// Socket-level failures keep their own OS code; SOCKS5 rejections map
    /// to the matching network error; anything else is a refused connection.
    pub fn wsa_code(&self) -> i32 {
        match self {
            HookError::ProxyConnect(e) | HookError::IoError(e) => {
                e.raw_os_error().unwrap_or(wsa::WSAECONNREFUSED)
            }
            HookError::Rejected(code) => match *code {
                ReplyCode::NETWORK_UNREACHABLE => wsa::WSAENETUNREACH,
                ReplyCode::HOST_UNREACHABLE => wsa::WSAEHOSTUNREACH,
                ReplyCode::TTL_EXPIRED => wsa::WSAETIMEDOUT,
                _ => wsa::WSAECONNREFUSED,
            },
            _ => wsa::WSAECONNREFUSED,
        }
    }
}

pub type Result<T> = std::result::Result<T, HookError>;
