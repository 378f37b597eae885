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

//! Connection sessions and the TCP acceptor.
//!
//! The [`Server`] accepts connections forever and spawns one session task
//! per socket. A session demultiplexes inbound records by request id into
//! per-request state machines, answers management records inline, and
//! invokes the responder on its own task whenever a request's stdin
//! completes. Sessions share nothing with each other.

use crate::{
    config::ServerConfig,
    conn::{RecordReader, SharedWriter},
    error::{ProtocolError, ServerError, ServerResult},
    meta::{
        BeginRequestBody, EndRequestBody, ProtocolStatus, Record, RecordType, Role,
        unknown_type_content,
    },
    params,
    request::{Request, Step},
    responder::{Responder, ResponseHandle},
};
use futures_util::FutureExt;
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, split},
    net::{TcpListener, TcpSocket},
    time,
};
use tracing::{debug, error, info, warn};

/// FastCGI server: a TCP acceptor plus the responder every session
/// dispatches to.
pub struct Server<R> {
    config: ServerConfig,
    responder: Arc<R>,
}

impl<R: Responder> Server<R> {
    /// Constructs a `Server` from its configuration and responder.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen endpoint, backlog, timeouts
    /// * `responder` - The application callback answering every request
    pub fn new(config: ServerConfig, responder: R) -> Self {
        Self {
            config,
            responder: Arc::new(responder),
        }
    }

    /// Binds the configured endpoint and accepts connections until the
    /// process ends. Accept errors are logged and the loop continues;
    /// only a failed bind is fatal.
    pub async fn run(self) -> ServerResult<()> {
        let listener = bind(&self.config)?;
        info!(listen = %self.config.listen, "listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let responder = Arc::clone(&self.responder);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(error) = serve_connection(stream, responder, config).await {
                            warn!(%peer, %error, "session ended with error");
                        } else {
                            debug!(%peer, "session ended");
                        }
                    });
                }
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                }
            }
        }
    }
}

fn bind(config: &ServerConfig) -> ServerResult<TcpListener> {
    let bind_err = |source: io::Error| ServerError::Bind {
        addr: config.listen,
        source,
    };
    let socket = match config.listen {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(config.listen).map_err(bind_err)?;
    socket.listen(config.backlog).map_err(bind_err)
}

/// Serves one already-accepted connection to completion.
///
/// Exposed so custom accept loops and in-memory streams (for tests) can
/// drive a session directly.
pub async fn serve_connection<S, R>(
    stream: S, responder: Arc<R>, config: ServerConfig,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: Responder,
{
    let (read_half, write_half) = split(stream);
    Session {
        reader: RecordReader::new(read_half),
        writer: SharedWriter::new(Box::new(write_half)),
        responder,
        config,
        requests: HashMap::new(),
        keep_conn: true,
    }
    .run()
    .await
}

/// One connection's worth of state: the socket halves, the live requests
/// keyed by id, and the connection-level keep flag.
struct Session<S, R> {
    reader: RecordReader<S>,
    writer: SharedWriter,
    responder: Arc<R>,
    config: ServerConfig,
    requests: HashMap<u16, Request>,
    /// AND of the `KEEP_CONN` flags of every begin record seen. Any
    /// single short-connection request closes the socket once the last
    /// live request ends.
    keep_conn: bool,
}

impl<S: AsyncRead + Unpin, R: Responder> Session<S, R> {
    async fn run(mut self) -> ServerResult<()> {
        loop {
            let Some(record) = self.read_with_timeout().await? else {
                if self.requests.is_empty() {
                    self.writer.shutdown().await?;
                    return Ok(());
                }
                // Peer vanished mid-request; live requests are dropped
                // without END_REQUEST.
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            };

            debug!(
                r#type = %record.header.r#type,
                id = record.header.request_id,
                len = record.header.content_length,
                "record received"
            );

            if record.header.request_id == 0 {
                self.handle_management(record).await?;
            } else {
                self.dispatch(record).await?;
            }

            if self.requests.is_empty() && !self.keep_conn {
                self.writer.shutdown().await?;
                return Ok(());
            }
        }
    }

    async fn read_with_timeout(&mut self) -> ServerResult<Option<Record>> {
        match self.config.idle_timeout {
            Some(limit) => match time::timeout(limit, self.reader.read_record()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            },
            None => self.reader.read_record().await,
        }
    }

    /// Routes an application record to its request's state machine,
    /// creating the request on `BEGIN_REQUEST`.
    async fn dispatch(&mut self, record: Record) -> ServerResult<()> {
        let id = record.header.request_id;

        if record.header.r#type == RecordType::BeginRequest {
            return self.begin_request(record).await;
        }

        let Some(request) = self.requests.get_mut(&id) else {
            debug!(id, r#type = %record.header.r#type, "record for unknown request id discarded");
            return Ok(());
        };

        match request.feed(record)? {
            Step::Continue => Ok(()),
            Step::Aborted => {
                debug!(id, "request aborted by peer");
                self.requests.remove(&id);
                self.send_end_request(id, 0, ProtocolStatus::RequestComplete)
                    .await
            }
            Step::Respond => {
                let Some(request) = self.requests.remove(&id) else {
                    return Ok(());
                };
                self.respond(request).await
            }
        }
    }

    async fn begin_request(&mut self, record: Record) -> ServerResult<()> {
        let id = record.header.request_id;
        if self.requests.contains_key(&id) {
            // Reuse of a live id; the existing request is unaffected.
            let error = ProtocolError::DuplicateRequestId { id };
            warn!(%error, "begin refused with CANT_MPX_CONN");
            return self.send_end_request(id, 0, ProtocolStatus::CantMpxConn).await;
        }

        let body = BeginRequestBody::new_from_buf(&record.content);
        self.keep_conn = self.keep_conn && body.keep_conn();

        match Role::from_u16(body.role) {
            Some(Role::Responder) => {
                debug!(id, keep_conn = body.keep_conn(), "request begun");
                self.requests.insert(id, Request::new(id));
                Ok(())
            }
            _ => {
                debug!(id, role = body.role, "unsupported role rejected");
                self.send_end_request(id, 0, ProtocolStatus::UnknownRole).await
            }
        }
    }

    /// Invokes the responder for a completed request, on this task. No
    /// further inbound records are read while it runs.
    async fn respond(&mut self, request: Request) -> ServerResult<()> {
        let id = request.id;
        let ended = Arc::new(AtomicBool::new(false));
        let handle = ResponseHandle::new(self.writer.clone(), id, Arc::clone(&ended));

        let outcome = AssertUnwindSafe(self.responder.respond(
            request.params(),
            request.stdin(),
            handle,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(())) if ended.load(Ordering::Acquire) => Ok(()),
            Ok(Ok(())) => {
                let error = ServerError::ResponderFailure;
                warn!(id, %error, "responder returned without ending the request");
                self.send_end_request(id, 0, ProtocolStatus::Overloaded).await
            }
            Ok(Err(error)) => {
                if ended.load(Ordering::Acquire) {
                    warn!(id, %error, "responder failed after ending the request");
                    return Ok(());
                }
                warn!(id, %error, "responder failed");
                self.send_end_request(id, 0, ProtocolStatus::Overloaded).await
            }
            Err(_) => {
                let error = ServerError::ResponderFailure;
                error!(id, %error, "responder panicked");
                self.send_end_request(id, 0, ProtocolStatus::Overloaded).await
            }
        }
    }

    /// Answers a management record (`request_id` 0). These never create a
    /// request entry.
    async fn handle_management(&mut self, record: Record) -> ServerResult<()> {
        match record.header.r#type {
            RecordType::GetValues => {
                let pairs = params::decode_pairs_complete(&record.content)?;
                let mut content = Vec::new();
                for (name, _) in pairs {
                    let value = match name.as_str() {
                        "FCGI_MPXS_CONNS" => "1".to_string(),
                        "FCGI_MAX_CONNS" => self.config.max_conns.to_string(),
                        "FCGI_MAX_REQS" => self.config.max_reqs.to_string(),
                        _ => continue,
                    };
                    params::encode_pair(&name, &value, &mut content);
                }
                self.writer
                    .write_record(RecordType::GetValuesResult, 0, &content)
                    .await
            }
            other => {
                debug!(r#type = %other, "unknown management record");
                self.writer
                    .write_record(RecordType::UnknownType, 0, &unknown_type_content(other.to_u8()))
                    .await
            }
        }
    }

    async fn send_end_request(
        &self, id: u16, app_status: u32, protocol_status: ProtocolStatus,
    ) -> ServerResult<()> {
        let body = EndRequestBody::new(app_status, protocol_status);
        self.writer
            .write_record(RecordType::EndRequest, id, &body.to_content())
            .await
    }
}
