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

//! The responder interface.
//!
//! A [`Responder`] is the application half of the server: it receives the
//! parsed parameters and stdin of one request together with a
//! [`ResponseHandle`], writes its reply through the handle, and finishes
//! with exactly one [`ResponseHandle::end_request`] call. The handle is
//! consumed by that call, so a double end is unrepresentable.

use crate::{
    conn::SharedWriter,
    error::ServerResult,
    meta::{EndRequestBody, MAX_LENGTH, ProtocolStatus, RecordType},
    params::Params,
};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Application callback that turns `(params, stdin)` into a reply.
///
/// The responder runs on the session task: while it executes, no further
/// inbound records for that connection are read. A responder that must
/// wait on external I/O should await it rather than block the thread, and
/// must not spawn work that outlives its `end_request` call.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// # Arguments
    ///
    /// * `params` - The decoded request parameters
    /// * `stdin` - The complete request body
    /// * `handle` - The output handle; call [`ResponseHandle::end_request`]
    ///   exactly once before returning
    async fn respond(
        &self, params: &Params, stdin: &[u8], handle: ResponseHandle,
    ) -> ServerResult<()>;
}

/// Output capability for one request, valid until `end_request` consumes
/// it.
pub struct ResponseHandle {
    writer: SharedWriter,
    request_id: u16,
    ended: Arc<AtomicBool>,
    wrote_stderr: bool,
}

impl ResponseHandle {
    pub(crate) fn new(writer: SharedWriter, request_id: u16, ended: Arc<AtomicBool>) -> Self {
        Self {
            writer,
            request_id,
            ended,
            wrote_stderr: false,
        }
    }

    /// The request id this handle answers.
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Writes bytes to the `STDOUT` stream.
    ///
    /// Payloads over the 16-bit record cap are split into one record per
    /// 65535-byte chunk, emitted in order. Writing an empty slice emits
    /// nothing: the zero-length terminator is reserved for `end_request`.
    pub async fn write_stdout(&mut self, bytes: &[u8]) -> ServerResult<()> {
        self.write_stream(RecordType::Stdout, bytes).await
    }

    /// Writes bytes to the `STDERR` stream, chunked like
    /// [`write_stdout`](Self::write_stdout).
    pub async fn write_stderr(&mut self, bytes: &[u8]) -> ServerResult<()> {
        if !bytes.is_empty() {
            self.wrote_stderr = true;
        }
        self.write_stream(RecordType::Stderr, bytes).await
    }

    async fn write_stream(&self, r#type: RecordType, bytes: &[u8]) -> ServerResult<()> {
        for chunk in bytes.chunks(MAX_LENGTH) {
            self.writer.write_record(r#type, self.request_id, chunk).await?;
        }
        Ok(())
    }

    /// Completes the request: terminates the `STDOUT` stream (and the
    /// `STDERR` stream if it was used), then emits
    /// `END_REQUEST(app_status, REQUEST_COMPLETE)`.
    ///
    /// # Arguments
    ///
    /// * `app_status` - The application exit status to report
    pub async fn end_request(self, app_status: u32) -> ServerResult<()> {
        // Mark first: once ending starts, the session must not answer the
        // request a second time even if the transport dies mid-way.
        self.ended.store(true, Ordering::Release);

        self.writer
            .write_record(RecordType::Stdout, self.request_id, &[])
            .await?;
        if self.wrote_stderr {
            self.writer
                .write_record(RecordType::Stderr, self.request_id, &[])
                .await?;
        }
        let body = EndRequestBody::new(app_status, ProtocolStatus::RequestComplete);
        self.writer
            .write_record(RecordType::EndRequest, self.request_id, &body.to_content())
            .await
    }
}
