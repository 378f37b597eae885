// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types and result type aliases for FastCGI server operations.
//!
//! Protocol violations are separated from transport failures: a
//! [`ProtocolError`] is fatal to the offending request or connection but
//! carries no I/O state, while transport errors surface as
//! [`ServerError::Io`] and tear the session down.

use std::{io, net::SocketAddr};

/// Result type alias for FastCGI server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Record-level protocol violations.
///
/// All variants are plain values; constructing one never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The header named a protocol version other than 1.
    #[error("unsupported FastCGI version `{0}`, expected 1")]
    BadVersion(u8),

    /// A name-value pair declared a length that runs past its buffer or
    /// exceeds the 65535-byte cap.
    #[error("malformed name-value pair length")]
    BadNVLength,

    /// A record type arrived that no state of the request accepts.
    #[error("unexpected record type `{record_type}` for request id `{request_id}`")]
    UnexpectedRecord {
        /// The raw type byte of the offending record.
        record_type: u8,
        /// The request id the record was addressed to.
        request_id: u16,
    },

    /// A `BEGIN_REQUEST` reused an id that is still in flight.
    #[error("request id `{id}` is already in flight on this connection")]
    DuplicateRequestId {
        /// The reused request id.
        id: u16,
    },

    /// A caller handed the record writer a body over the 16-bit length cap.
    #[error("record body of `{len}` bytes exceeds the 16-bit content length")]
    BodyTooLarge {
        /// The rejected body length.
        len: usize,
    },
}

/// Error types that can occur while serving FastCGI connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Wrapper of [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Wrapper of `tokio::io::Error`, any transport failure included.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The responder panicked or returned without ending its request.
    #[error("responder terminated without completing the request")]
    ResponderFailure,

    /// The listen endpoint could not be bound at startup.
    #[error("failed to bind `{addr}`")]
    Bind {
        /// The endpoint that was requested.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },
}
