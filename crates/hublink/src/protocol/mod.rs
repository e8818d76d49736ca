// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Wire protocol definitions shared by the RPC and event-bus layers.
//!
//! Two message shapes travel between hub services:
//!
//! - **RPC frame** ([`frame`]): a length-prefixed request/response
//!   message exchanged over TCP. See [`frame::IpcMessage`].
//! - **Event** ([`event`]): a JSON document broadcast over multicast
//!   UDP. See [`event::Event`].
//!
//! Everything in this module is pure (no I/O) so the codecs can be
//! tested without a network stack.

pub mod event;
pub mod frame;

pub use event::{service_id_from_event_code, Event};
pub use frame::{IpcMessage, FRAME_HEADER_SIZE, MAX_FRAME_LEN, MAX_PAYLOAD_LEN};

use std::fmt;

/// Errors produced by the frame and event codecs.
///
/// Codec errors are always local: they are never sent across the wire
/// as anything but a generic failure response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes available than the fixed header size.
    TooShort { have: usize },

    /// Declared frame length exceeds the 16-bit wire limit.
    TooLarge { declared: usize },

    /// Fewer payload bytes available than the header declared.
    Truncated { declared: usize, have: usize },

    /// Structurally invalid content (bad length field, bad JSON, ...).
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { have } => {
                write!(f, "frame too short: {have} bytes (need {FRAME_HEADER_SIZE})")
            }
            Self::TooLarge { declared } => {
                write!(f, "frame too large: declared {declared} bytes (max {MAX_FRAME_LEN})")
            }
            Self::Truncated { declared, have } => {
                write!(f, "frame truncated: declared {declared} bytes, have {have}")
            }
            Self::Malformed(msg) => write!(f, "malformed message: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Transport-level status codes for RPC calls.
///
/// The low code range (0..=15) is reserved for these statuses; response
/// frames fabricated by the receiver itself (codec failure, queue full,
/// handler panic) carry one of them in the frame `code` field.
/// Application handlers use codes above the reserved range.
///
/// The numeric values are shared with a managed-language peer
/// implementation and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpcCode {
    /// Request was delivered and a response came back.
    Success = 0,
    /// Unspecified failure (handler panic, internal error).
    GeneralFailure = 1,
    /// Request frame could not be decoded.
    InvalidRequest = 2,
    /// Request decoded but its payload was unusable.
    InvalidPayload = 3,
    /// A bounded wait elapsed before the peer responded.
    Timeout = 4,
    /// No listener on the target port.
    ConnectionRefused = 5,
    /// Peer is up but refused to service the request.
    ServiceUnavailable = 6,
    /// Receiver worker queue was full; request was rejected.
    ResourceExhausted = 7,
    /// Teardown was requested mid-flight.
    ShutDown = 8,
}

impl IpcCode {
    /// Map a wire value back to a code. `None` for anything outside
    /// the reserved range, which includes every application code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::GeneralFailure),
            2 => Some(Self::InvalidRequest),
            3 => Some(Self::InvalidPayload),
            4 => Some(Self::Timeout),
            5 => Some(Self::ConnectionRefused),
            6 => Some(Self::ServiceUnavailable),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::ShutDown),
            _ => None,
        }
    }

    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Human-readable label for CLI output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "IPC_SUCCESS",
            Self::GeneralFailure => "IPC_GENERAL_FAILURE",
            Self::InvalidRequest => "IPC_INVALID_REQUEST",
            Self::InvalidPayload => "IPC_INVALID_PAYLOAD",
            Self::Timeout => "IPC_TIMEOUT",
            Self::ConnectionRefused => "IPC_CONNECTION_REFUSED",
            Self::ServiceUnavailable => "IPC_SERVICE_UNAVAILABLE",
            Self::ResourceExhausted => "IPC_RESOURCE_EXHAUSTED",
            Self::ShutDown => "IPC_SHUT_DOWN",
        }
    }

    /// Highest value reserved for transport statuses. Application
    /// message codes start above this.
    pub const RESERVED_MAX: u32 = 15;
}

impl fmt::Display for IpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
