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

//! Per-request accumulation state machine.
//!
//! One [`Request`] exists per live request id on a connection. It absorbs
//! the `PARAMS` stream (a name-value pair may straddle record boundaries),
//! then the `STDIN` stream, and tells the session when the responder can
//! be dispatched. The session owns the map of live requests and removes an
//! entry as soon as it is answered.

use crate::{
    error::ProtocolError,
    meta::{Record, RecordType},
    params::{self, Params},
};
use bytes::{Buf, BytesMut};
use tracing::debug;

/// Lifecycle phase of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating the `PARAMS` stream.
    Params,
    /// Params complete, accumulating the `STDIN` stream.
    Stdin,
}

/// What the session should do after feeding a record to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Nothing to do, keep reading.
    Continue,
    /// Stdin is complete, dispatch the responder.
    Respond,
    /// The peer aborted, answer `END_REQUEST` and drop the request.
    Aborted,
}

/// One live request on a connection.
pub(crate) struct Request {
    pub(crate) id: u16,
    state: State,
    params: Params,
    /// Tail of the params stream still waiting for a complete pair.
    params_buf: BytesMut,
    stdin: BytesMut,
}

impl Request {
    pub(crate) fn new(id: u16) -> Self {
        Self {
            id,
            state: State::Params,
            params: Params::new(),
            params_buf: BytesMut::new(),
            stdin: BytesMut::new(),
        }
    }

    /// Feeds one inbound record to the state machine.
    ///
    /// Record types that the current state does not expect are logged and
    /// discarded; the transitions themselves are synchronous and never
    /// block.
    pub(crate) fn feed(&mut self, record: Record) -> Result<Step, ProtocolError> {
        match record.header.r#type {
            RecordType::Params => self.feed_params(record),
            RecordType::Stdin => self.feed_stdin(record),
            RecordType::AbortRequest => Ok(Step::Aborted),
            other => {
                let error = ProtocolError::UnexpectedRecord {
                    record_type: other.to_u8(),
                    request_id: self.id,
                };
                debug!(%error, "record discarded");
                Ok(Step::Continue)
            }
        }
    }

    fn feed_params(&mut self, record: Record) -> Result<Step, ProtocolError> {
        if self.state != State::Params {
            debug!(id = self.id, "late PARAMS record discarded");
            return Ok(Step::Continue);
        }
        if record.content.is_empty() {
            // End of stream. A buffered tail means a pair never completed.
            if !self.params_buf.is_empty() {
                return Err(ProtocolError::BadNVLength);
            }
            self.state = State::Stdin;
            return Ok(Step::Continue);
        }

        self.params_buf.extend_from_slice(&record.content);
        let mut pairs = Vec::new();
        let consumed = params::decode_pairs(&self.params_buf, &mut pairs)?;
        self.params_buf.advance(consumed);
        for (name, value) in pairs {
            self.params.insert(name, value);
        }
        Ok(Step::Continue)
    }

    fn feed_stdin(&mut self, record: Record) -> Result<Step, ProtocolError> {
        if self.state != State::Stdin {
            debug!(id = self.id, "early STDIN record discarded");
            return Ok(Step::Continue);
        }
        if record.content.is_empty() {
            return Ok(Step::Respond);
        }
        self.stdin.extend_from_slice(&record.content);
        Ok(Step::Continue)
    }

    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn stdin(&self) -> &[u8] {
        &self.stdin
    }
}
