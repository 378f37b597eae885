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

//! Connection-level record transport.
//!
//! [`RecordReader`] pulls complete records off one half of a socket;
//! [`SharedWriter`] serializes outbound records onto the other half with a
//! per-session mutex, so concurrent writers interleave only at record
//! boundaries. Both sides of a request share the same socket, which is why
//! the writer is the single place any output bytes pass through.

use crate::{
    error::{ProtocolError, ServerResult},
    meta::{HEADER_LEN, Header, MAX_LENGTH, Record, RecordType},
};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

/// Type-erased write half of a session socket.
pub(crate) type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads a stream of complete records off one socket.
pub(crate) struct RecordReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next complete record.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a record
    /// boundary, before any header byte arrived. EOF inside a frame is an
    /// `UnexpectedEof` I/O error; whether a boundary close is clean is for
    /// the session to decide, based on its live requests.
    pub(crate) async fn read_record(&mut self) -> ServerResult<Option<Record>> {
        let mut buf = [0; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }
        let header = Header::new_from_buf(&buf)?;

        let mut content = vec![0; header.content_length as usize];
        self.reader.read_exact(&mut content).await?;

        // Padding is consumed without interpretation.
        let mut padding = vec![0; header.padding_length as usize];
        self.reader.read_exact(&mut padding).await?;

        Ok(Some(Record { header, content }))
    }
}

/// Writes single records onto one socket.
///
/// The first transport error marks the writer broken; every later call
/// fails fast without touching the socket.
pub(crate) struct RecordWriter<W> {
    writer: W,
    broken: bool,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            broken: false,
        }
    }

    /// Writes one record and awaits its completion.
    ///
    /// The content must already fit the 16-bit length field; callers split
    /// larger payloads into multiple records.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `content` - The record content
    pub(crate) async fn write_record(
        &mut self, r#type: RecordType, request_id: u16, content: &[u8],
    ) -> ServerResult<()> {
        if self.broken {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        if content.len() > MAX_LENGTH {
            return Err(ProtocolError::BodyTooLarge {
                len: content.len(),
            }
            .into());
        }

        let header = Header::new(r#type, request_id, content);
        let result = self.write_frame(&header.to_bytes(), content).await;
        if result.is_err() {
            self.broken = true;
        }
        Ok(result?)
    }

    async fn write_frame(&mut self, header: &[u8], content: &[u8]) -> io::Result<()> {
        self.writer.write_all(header).await?;
        self.writer.write_all(content).await?;
        self.writer.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        if self.broken {
            return Ok(());
        }
        self.writer.shutdown().await
    }
}

/// The per-session record writer, shared between the session task and the
/// response handle held by a running responder.
///
/// Every write locks the session mutex for the whole record, so callers
/// observe a total order on the wire and records are never torn.
#[derive(Clone)]
pub(crate) struct SharedWriter(Arc<Mutex<RecordWriter<BoxWrite>>>);

impl SharedWriter {
    pub(crate) fn new(writer: BoxWrite) -> Self {
        Self(Arc::new(Mutex::new(RecordWriter::new(writer))))
    }

    /// Writes one record under the session lock, awaiting completion
    /// before returning.
    pub(crate) async fn write_record(
        &self, r#type: RecordType, request_id: u16, content: &[u8],
    ) -> ServerResult<()> {
        self.0.lock().await.write_record(r#type, request_id, content).await
    }

    /// Drains buffered output and closes the write direction.
    pub(crate) async fn shutdown(&self) -> ServerResult<()> {
        Ok(self.0.lock().await.shutdown().await?)
    }
}
