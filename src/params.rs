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

//! FastCGI parameters and the name-value pair codec.
//!
//! Each of `name_length` and `value_length` is either one byte (high bit
//! clear, values 0-127) or four big-endian bytes (high bit of the first
//! byte set, remaining 31 bits the length), giving four distinct on-wire
//! layouts. Lengths over 65535 are rejected: they would exceed what the
//! carrying record can justify and unbound the per-session footprint.

use crate::error::ProtocolError;
use std::{collections::HashMap, ops::Deref};

/// Cap on a single declared name or value length.
const MAX_PAIR_LENGTH: u32 = 0xffff;

/// Parameters of one FastCGI request, as decoded from its `PARAMS` stream.
///
/// Duplicate names are resolved last-write-wins. The map derefs to
/// `HashMap<String, String>` for read access.
#[derive(Debug, Default, Clone)]
pub struct Params(HashMap<String, String>);

impl Params {
    /// Creates an empty parameter map.
    pub(crate) fn new() -> Self {
        Self(HashMap::new())
    }

    /// Inserts a pair, replacing any previous value of the same name.
    pub(crate) fn insert(&mut self, name: String, value: String) {
        self.0.insert(name, value);
    }
}

impl Deref for Params {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Pair length encoding for FastCGI name-value pairs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PairLength {
    /// Short length (0-127 bytes)
    Short(u8),
    /// Long length (128+ bytes), high bit already set
    Long(u32),
}

impl PairLength {
    /// Creates a new pair length encoding.
    ///
    /// # Arguments
    ///
    /// * `length` - The length to encode
    pub(crate) fn new(length: usize) -> Self {
        if length < 128 {
            PairLength::Short(length as u8)
        } else {
            PairLength::Long(length as u32 | 1 << 31)
        }
    }

    /// Appends the encoded length to a buffer.
    pub(crate) fn write_to_buf(self, buf: &mut Vec<u8>) {
        match self {
            PairLength::Short(l) => buf.push(l),
            PairLength::Long(l) => buf.extend_from_slice(&l.to_be_bytes()),
        }
    }
}

/// Reads one declared length from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer is too short to hold the length
/// field itself, `Ok(Some((length, width)))` otherwise.
fn read_length(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first >> 7 == 0 {
        return Ok(Some((u32::from(first), 1)));
    }
    if buf.len() < 4 {
        return Ok(None);
    }
    let declared = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]);
    if declared > MAX_PAIR_LENGTH {
        return Err(ProtocolError::BadNVLength);
    }
    Ok(Some((declared, 4)))
}

/// Decodes complete pairs from the front of `buf` into `pairs`, returning
/// the number of bytes consumed.
///
/// A trailing pair that has not fully arrived yet is left untouched, so a
/// caller accumulating a `PARAMS` stream can retry once more content lands.
/// A declared length over the cap fails immediately: no amount of further
/// input can complete it.
///
/// Pairs are narrowed to UTF-8 text; bytes outside UTF-8 decode to the
/// replacement character rather than failing the request.
pub(crate) fn decode_pairs(
    buf: &[u8], pairs: &mut Vec<(String, String)>,
) -> Result<usize, ProtocolError> {
    let mut consumed = 0;
    loop {
        let rest = &buf[consumed..];
        let Some((name_length, name_width)) = read_length(rest)? else {
            return Ok(consumed);
        };
        let Some((value_length, value_width)) = read_length(&rest[name_width..])? else {
            return Ok(consumed);
        };
        let body = name_width + value_width;
        let total = body + name_length as usize + value_length as usize;
        if rest.len() < total {
            return Ok(consumed);
        }
        let name = &rest[body..body + name_length as usize];
        let value = &rest[body + name_length as usize..total];
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        consumed += total;
    }
}

/// One-shot decoder for bodies that must hold whole pairs, such as
/// `GET_VALUES` content. Leftover bytes are a protocol error.
pub(crate) fn decode_pairs_complete(buf: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    let consumed = decode_pairs(buf, &mut pairs)?;
    if consumed != buf.len() {
        return Err(ProtocolError::BadNVLength);
    }
    Ok(pairs)
}

/// Appends one encoded pair to `buf`, choosing the one- or four-byte
/// width per field independently.
///
/// # Arguments
///
/// * `name` - The pair name
/// * `value` - The pair value
/// * `buf` - The output buffer
pub(crate) fn encode_pair(name: &str, value: &str, buf: &mut Vec<u8>) {
    PairLength::new(name.len()).write_to_buf(buf);
    PairLength::new(value.len()).write_to_buf(buf);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}
