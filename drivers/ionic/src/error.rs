// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error types for datapath operations.

use core::fmt;

/// The error type for datapath failures.
///
/// Every variant is recoverable: the caller drops the packet, leaves the ring
/// under-filled, or rejects the configuration. Nothing here is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IonicError {
    /// Page or packet allocation failed.
    NoMemory,
    /// The DMA mapping service refused a mapping.
    DmaMap,
    /// The stack could not collapse the packet into one buffer.
    Linearize,
    /// The packet header could not be made exclusively writable.
    HeaderNotWritable,
    /// A TSO segment needs more scatter-gather elements than the queue allows.
    TooManySgElems,
    /// Header offsets reported by the packet are out of bounds.
    BadHeader,
    /// A configuration value is out of range.
    InvalidConfig,
}

impl IonicError {
    /// Stable error message for display/logging.
    pub const fn message(&self) -> &'static str {
        match self {
            IonicError::NoMemory => "Not enough memory",
            IonicError::DmaMap => "DMA mapping failed",
            IonicError::Linearize => "Packet linearization failed",
            IonicError::HeaderNotWritable => "Packet header is not writable",
            IonicError::TooManySgElems => "Too many scatter-gather elements",
            IonicError::BadHeader => "Malformed packet header",
            IonicError::InvalidConfig => "Invalid configuration",
        }
    }
}

impl fmt::Display for IonicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Failure to obtain a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Page allocation failed.
    OutOfMemory,
    /// The page was allocated but could not be mapped; it has been freed.
    MapFailed,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("page alloc failed"),
            AllocError::MapFailed => f.write_str("dma map failed"),
        }
    }
}

impl From<AllocError> for IonicError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => IonicError::NoMemory,
            AllocError::MapFailed => IonicError::DmaMap,
        }
    }
}

/// A specialized `Result` type for datapath operations.
pub type IonicResult<T = ()> = Result<T, IonicError>;
