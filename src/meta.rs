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

//! Internal FastCGI protocol metadata structures and parsing.
//!
//! This module contains the internal structures and constants used
//! for parsing and generating FastCGI protocol records.

use crate::error::ProtocolError;
use std::fmt::{self, Display};

/// FastCGI protocol version 1
pub(crate) const VERSION_1: u8 = 1;
/// Maximum length for FastCGI record content
pub(crate) const MAX_LENGTH: usize = 0xffff;
/// Length of FastCGI header in bytes
pub(crate) const HEADER_LEN: usize = 8;

/// The `KEEP_CONN` bit of the begin-request flags byte.
pub(crate) const FLAG_KEEP_CONN: u8 = 0x01;

/// FastCGI record types as defined in the protocol specification.
///
/// Management record types the server has never heard of keep their raw
/// byte in `Unknown`, so it can be echoed back in an `UNKNOWN_TYPE` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Begin request record type
    BeginRequest,
    /// Abort request record type
    AbortRequest,
    /// End request record type
    EndRequest,
    /// Parameters record type
    Params,
    /// Stdin record type
    Stdin,
    /// Stdout record type
    Stdout,
    /// Stderr record type
    Stderr,
    /// Data record type
    Data,
    /// Get values record type
    GetValues,
    /// Get values result record type
    GetValuesResult,
    /// Unknown type record type
    UnknownType,
    /// Any type byte outside the defined range
    Unknown(u8),
}

impl RecordType {
    /// Converts a u8 value to RecordType.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    pub(crate) fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            u => RecordType::Unknown(u),
        }
    }

    /// Converts the RecordType back to its wire byte.
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Unknown(u) => u,
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&self.to_u8(), f)
    }
}

/// The fixed 8-byte record header.
///
/// Wire layout: `version | type | requestIdB1 | requestIdB0 |
/// contentLengthB1 | contentLengthB0 | paddingLength | reserved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    /// FastCGI protocol version
    pub(crate) version: u8,
    /// Type of the FastCGI record
    pub(crate) r#type: RecordType,
    /// Request ID for this record
    pub(crate) request_id: u16,
    /// Length of the content data
    pub(crate) content_length: u16,
    /// Length of padding data
    pub(crate) padding_length: u8,
    /// Reserved byte
    pub(crate) reserved: u8,
}

impl Header {
    /// Creates a new outbound header for the given content.
    ///
    /// Outbound records are written without padding; peers must tolerate
    /// any inbound padding, so none is produced here.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `content` - The content the header will describe
    pub(crate) fn new(r#type: RecordType, request_id: u16, content: &[u8]) -> Self {
        Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length: content.len() as u16,
            padding_length: 0,
            reserved: 0,
        }
    }

    /// Creates a new header from an 8-byte buffer.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer containing header data
    #[inline]
    pub(crate) fn new_from_buf(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        if buf[0] != VERSION_1 {
            return Err(ProtocolError::BadVersion(buf[0]));
        }
        Ok(Self {
            version: buf[0],
            r#type: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        })
    }

    /// Serializes the header to its 8-byte wire form.
    pub(crate) fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let request_id = self.request_id.to_be_bytes();
        let content_length = self.content_length.to_be_bytes();
        [
            self.version,
            self.r#type.to_u8(),
            request_id[0],
            request_id[1],
            content_length[0],
            content_length[1],
            self.padding_length,
            self.reserved,
        ]
    }
}

/// One complete inbound record: header plus content, padding already
/// discarded by the reader.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) header: Header,
    pub(crate) content: Vec<u8>,
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Responder role - handles requests and returns responses
    Responder = 1,
    /// Authorizer role - performs authorization checks
    Authorizer = 2,
    /// Filter role - filters data between web server and application
    Filter = 3,
}

impl Role {
    /// Converts a u16 value to Role.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    pub(crate) fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Begin request record body data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequestBody {
    /// The role requested by the peer
    pub(crate) role: u16,
    /// Flags byte (bit 0 = keep connection flag)
    pub(crate) flags: u8,
}

impl BeginRequestBody {
    /// Creates a begin request body from record content.
    ///
    /// A truncated body cannot name a valid role; role 0 maps to no
    /// [`Role`] and is rejected downstream with `UNKNOWN_ROLE`.
    ///
    /// # Arguments
    ///
    /// * `buf` - The record content
    pub(crate) fn new_from_buf(buf: &[u8]) -> Self {
        if buf.len() < 3 {
            return Self { role: 0, flags: 0 };
        }
        Self {
            role: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
        }
    }

    /// Whether the peer asked to keep the connection open after this
    /// request ends.
    pub(crate) fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// FastCGI protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex the same request id
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// End request record body data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndRequestBody {
    /// The application status code
    pub(crate) app_status: u32,
    /// The protocol status
    pub(crate) protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    /// Creates a new end request body.
    ///
    /// # Arguments
    ///
    /// * `app_status` - The application status code
    /// * `protocol_status` - The protocol status
    pub(crate) fn new(app_status: u32, protocol_status: ProtocolStatus) -> Self {
        Self {
            app_status,
            protocol_status,
        }
    }

    /// Converts the end request body to record content.
    pub(crate) fn to_content(self) -> [u8; 8] {
        let app_status = self.app_status.to_be_bytes();
        [
            app_status[0],
            app_status[1],
            app_status[2],
            app_status[3],
            self.protocol_status as u8,
            0,
            0,
            0,
        ]
    }
}

/// Builds the content of an `UNKNOWN_TYPE` reply for the given type byte.
pub(crate) fn unknown_type_content(r#type: u8) -> [u8; 8] {
    [r#type, 0, 0, 0, 0, 0, 0, 0]
}
