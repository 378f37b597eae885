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

//! End-to-end session tests over in-memory streams, driving the server
//! with hand-built record frames the way a web server would.

use async_trait::async_trait;
use fastcgi_server::{
    Params, Responder, ResponseHandle, ServerConfig, ServerResult, serve_connection,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
};

mod common;

const BEGIN_REQUEST: u8 = 1;
const ABORT_REQUEST: u8 = 2;
const END_REQUEST: u8 = 3;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
const STDOUT: u8 = 6;
const STDERR: u8 = 7;
const GET_VALUES: u8 = 9;
const GET_VALUES_RESULT: u8 = 10;
const UNKNOWN_TYPE: u8 = 11;

const ROLE_RESPONDER: u16 = 1;
const ROLE_AUTHORIZER: u16 = 2;
const KEEP_CONN: u8 = 0x01;

fn record(r#type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let id = request_id.to_be_bytes();
    let len = (content.len() as u16).to_be_bytes();
    let mut buf = vec![1, r#type, id[0], id[1], len[0], len[1], 0, 0];
    buf.extend_from_slice(content);
    buf
}

fn begin(request_id: u16, role: u16, flags: u8) -> Vec<u8> {
    let role = role.to_be_bytes();
    record(
        BEGIN_REQUEST,
        request_id,
        &[role[0], role[1], flags, 0, 0, 0, 0, 0],
    )
}

/// Encodes one short name-value pair (lengths under 128).
fn pair(name: &str, value: &str) -> Vec<u8> {
    let mut buf = vec![name.len() as u8, value.len() as u8];
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf
}

/// A full well-formed request: begin, one params pair, end of params, end
/// of stdin.
fn whole_request(request_id: u16, flags: u8, uri: &str) -> Vec<u8> {
    let mut buf = begin(request_id, ROLE_RESPONDER, flags);
    buf.extend_from_slice(&record(PARAMS, request_id, &pair("REQUEST_URI", uri)));
    buf.extend_from_slice(&record(PARAMS, request_id, &[]));
    buf.extend_from_slice(&record(STDIN, request_id, &[]));
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    r#type: u8,
    request_id: u16,
    content: Vec<u8>,
}

impl Frame {
    fn protocol_status(&self) -> u8 {
        assert_eq!(self.r#type, END_REQUEST);
        self.content[4]
    }

    fn app_status(&self) -> u32 {
        assert_eq!(self.r#type, END_REQUEST);
        u32::from_be_bytes([
            self.content[0],
            self.content[1],
            self.content[2],
            self.content[3],
        ])
    }
}

async fn read_frame(reader: &mut DuplexStream) -> Option<Frame> {
    let mut header = [0; 8];
    reader.read_exact(&mut header).await.ok()?;
    assert_eq!(header[0], 1, "server emitted a non-version-1 record");

    let mut content = vec![0; u16::from_be_bytes([header[4], header[5]]) as usize];
    reader.read_exact(&mut content).await.unwrap();
    let mut padding = vec![0; header[6] as usize];
    reader.read_exact(&mut padding).await.unwrap();

    Some(Frame {
        r#type: header[1],
        request_id: u16::from_be_bytes([header[2], header[3]]),
        content,
    })
}

async fn read_until_eof(reader: &mut DuplexStream) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = read_frame(reader).await {
        frames.push(frame);
    }
    frames
}

/// Reads frames up to and including the next `END_REQUEST`.
async fn read_response(reader: &mut DuplexStream) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(reader).await.expect("stream ended mid-response");
        let done = frame.r#type == END_REQUEST;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Echoes the request URI and body back on stdout.
struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(
        &self, params: &Params, stdin: &[u8], mut handle: ResponseHandle,
    ) -> ServerResult<()> {
        let uri = params.get("REQUEST_URI").map(String::as_str).unwrap_or("-");
        let body = format!(
            "Content-Type: text/plain\r\n\r\nuri={uri};stdin={}",
            String::from_utf8_lossy(stdin)
        );
        handle.write_stdout(body.as_bytes()).await?;
        handle.end_request(0).await
    }
}

fn spawn_session<R: Responder>(
    responder: R, config: ServerConfig,
) -> (DuplexStream, JoinHandle<ServerResult<()>>) {
    common::setup();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(serve_connection(server, Arc::new(responder), config));
    (client, task)
}

fn test_config() -> ServerConfig {
    ServerConfig::default().idle_timeout(Some(Duration::from_secs(5)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_request_without_keep_conn_closes_the_connection() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    client.write_all(&whole_request(1, 0, "/")).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 3);

    assert_eq!(frames[0].r#type, STDOUT);
    assert_eq!(frames[0].request_id, 1);
    assert!(!frames[0].content.is_empty());

    assert_eq!(frames[1].r#type, STDOUT);
    assert!(frames[1].content.is_empty());

    assert_eq!(frames[2].r#type, END_REQUEST);
    assert_eq!(frames[2].request_id, 1);
    assert_eq!(frames[2].protocol_status(), 0);
    assert_eq!(frames[2].app_status(), 0);

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_conn_accepts_a_second_request_on_the_same_connection() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    client.write_all(&whole_request(1, KEEP_CONN, "/first")).await.unwrap();
    let first = read_response(&mut client).await;
    assert_eq!(first.last().unwrap().request_id, 1);
    assert_eq!(first.last().unwrap().protocol_status(), 0);

    // The session must still be reading: send a fresh request on a new id.
    client.write_all(&whole_request(2, 0, "/second")).await.unwrap();
    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f.request_id == 2));
    assert!(
        String::from_utf8_lossy(&frames[0].content).contains("uri=/second")
    );

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multiplexed_requests_answer_each_id_independently() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    // Interleave the two requests record by record.
    let mut buf = Vec::new();
    buf.extend_from_slice(&begin(1, ROLE_RESPONDER, KEEP_CONN));
    buf.extend_from_slice(&begin(2, ROLE_RESPONDER, 0));
    buf.extend_from_slice(&record(PARAMS, 1, &pair("REQUEST_URI", "/one")));
    buf.extend_from_slice(&record(PARAMS, 2, &pair("REQUEST_URI", "/two")));
    buf.extend_from_slice(&record(PARAMS, 1, &[]));
    buf.extend_from_slice(&record(PARAMS, 2, &[]));
    buf.extend_from_slice(&record(STDIN, 1, b"alpha"));
    buf.extend_from_slice(&record(STDIN, 2, b"beta"));
    buf.extend_from_slice(&record(STDIN, 1, &[]));
    buf.extend_from_slice(&record(STDIN, 2, &[]));
    client.write_all(&buf).await.unwrap();

    let frames = read_until_eof(&mut client).await;

    for id in [1u16, 2] {
        let per_id: Vec<&Frame> = frames.iter().filter(|f| f.request_id == id).collect();
        assert_eq!(per_id.len(), 3, "request {id} should get exactly 3 frames");
        assert_eq!(per_id[0].r#type, STDOUT);
        assert_eq!(per_id[1].r#type, STDOUT);
        assert!(per_id[1].content.is_empty());
        assert_eq!(per_id[2].r#type, END_REQUEST);
        assert_eq!(per_id[2].protocol_status(), 0);
    }

    let one = String::from_utf8_lossy(&frames[0].content).into_owned();
    assert!(one.contains("uri=/one") && one.contains("stdin=alpha"));
    let two_body = frames
        .iter()
        .find(|f| f.request_id == 2 && f.r#type == STDOUT && !f.content.is_empty())
        .unwrap();
    let two = String::from_utf8_lossy(&two_body.content);
    assert!(two.contains("uri=/two") && two.contains("stdin=beta"));

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_is_answered_with_end_request_and_no_stdout() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    let mut buf = begin(1, ROLE_RESPONDER, 0);
    buf.extend_from_slice(&record(PARAMS, 1, &pair("REQUEST_URI", "/")));
    buf.extend_from_slice(&record(ABORT_REQUEST, 1, &[]));
    client.write_all(&buf).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].r#type, END_REQUEST);
    assert_eq!(frames[0].request_id, 1);
    assert_eq!(frames[0].app_status(), 0);
    assert_eq!(frames[0].protocol_status(), 0);

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_role_is_rejected_with_unknown_role() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    client
        .write_all(&begin(1, ROLE_AUTHORIZER, 0))
        .await
        .unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].r#type, END_REQUEST);
    assert_eq!(frames[0].protocol_status(), 3);

    task.await.unwrap().unwrap();
}

/// Writes a fixed number of `x` bytes, exercising the record split.
struct LargeResponder(usize);

#[async_trait]
impl Responder for LargeResponder {
    async fn respond(
        &self, _params: &Params, _stdin: &[u8], mut handle: ResponseHandle,
    ) -> ServerResult<()> {
        handle.write_stdout(&vec![b'x'; self.0]).await?;
        handle.end_request(0).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_stdout_is_split_at_the_record_cap() {
    let total = 200_000;
    let (mut client, task) = spawn_session(LargeResponder(total), test_config());

    client.write_all(&whole_request(1, 0, "/")).await.unwrap();

    let frames = read_until_eof(&mut client).await;

    let stdout: Vec<&Frame> = frames.iter().filter(|f| f.r#type == STDOUT).collect();
    let lengths: Vec<usize> = stdout.iter().map(|f| f.content.len()).collect();
    assert_eq!(lengths, vec![65535, 65535, 65535, 3395, 0]);

    // The non-empty records concatenate to exactly the responder's bytes.
    let body: Vec<u8> = stdout.iter().flat_map(|f| f.content.clone()).collect();
    assert_eq!(body, vec![b'x'; total]);

    assert_eq!(frames.last().unwrap().r#type, END_REQUEST);
    assert_eq!(frames.last().unwrap().protocol_status(), 0);

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_values_reports_known_names_only() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    let mut query = Vec::new();
    query.extend_from_slice(&pair("FCGI_MPXS_CONNS", ""));
    query.extend_from_slice(&pair("FCGI_MAX_CONNS", ""));
    query.extend_from_slice(&pair("NOT_A_THING", ""));
    client
        .write_all(&record(GET_VALUES, 0, &query))
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].r#type, GET_VALUES_RESULT);
    assert_eq!(frames[0].request_id, 0);
    let expected: Vec<u8> = [pair("FCGI_MPXS_CONNS", "1"), pair("FCGI_MAX_CONNS", "64")]
        .concat();
    assert_eq!(frames[0].content, expected);

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_management_type_is_answered_with_unknown_type() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    client.write_all(&record(99, 0, &[])).await.unwrap();
    client.shutdown().await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].r#type, UNKNOWN_TYPE);
    assert_eq!(frames[0].request_id, 0);
    assert_eq!(frames[0].content.len(), 8);
    assert_eq!(frames[0].content[0], 99);

    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_request_id_is_answered_with_cant_mpx_conn() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    let mut buf = begin(1, ROLE_RESPONDER, KEEP_CONN);
    buf.extend_from_slice(&begin(1, ROLE_RESPONDER, KEEP_CONN));
    client.write_all(&buf).await.unwrap();

    // The reuse is refused on the wire...
    let refusal = read_frame(&mut client).await.unwrap();
    assert_eq!(refusal.r#type, END_REQUEST);
    assert_eq!(refusal.request_id, 1);
    assert_eq!(refusal.protocol_status(), 1);

    // ...while the original request keeps working.
    let mut rest = record(PARAMS, 1, &[]);
    rest.extend_from_slice(&record(STDIN, 1, &[]));
    client.write_all(&rest).await.unwrap();

    let frames = read_response(&mut client).await;
    assert_eq!(frames.last().unwrap().protocol_status(), 0);

    client.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_params_length_kills_the_session_without_end_request() {
    let (mut client, task) = spawn_session(EchoResponder, test_config());

    let mut buf = begin(1, ROLE_RESPONDER, 0);
    // 4-byte name length of 0x10000, one past the cap.
    buf.extend_from_slice(&record(PARAMS, 1, &[0x80, 0x01, 0x00, 0x00, 0x01]));
    client.write_all(&buf).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert!(frames.is_empty());
    assert!(task.await.unwrap().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_timeout_tears_the_session_down() {
    let config = test_config().idle_timeout(Some(Duration::from_millis(50)));
    let (mut client, task) = spawn_session(EchoResponder, config);

    let frames = read_until_eof(&mut client).await;
    assert!(frames.is_empty());
    assert!(task.await.unwrap().is_err());
}

struct PanickingResponder;

#[async_trait]
impl Responder for PanickingResponder {
    async fn respond(
        &self, _params: &Params, _stdin: &[u8], _handle: ResponseHandle,
    ) -> ServerResult<()> {
        panic!("responder blew up");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_responder_is_answered_with_overloaded() {
    let (mut client, task) = spawn_session(PanickingResponder, test_config());

    client.write_all(&whole_request(1, 0, "/")).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].r#type, END_REQUEST);
    assert_eq!(frames[0].protocol_status(), 2);

    task.await.unwrap().unwrap();
}

struct ForgetfulResponder;

#[async_trait]
impl Responder for ForgetfulResponder {
    async fn respond(
        &self, _params: &Params, _stdin: &[u8], mut handle: ResponseHandle,
    ) -> ServerResult<()> {
        handle.write_stdout(b"half an answer").await
        // No end_request.
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responder_that_never_ends_is_answered_with_overloaded() {
    let (mut client, task) = spawn_session(ForgetfulResponder, test_config());

    client.write_all(&whole_request(1, 0, "/")).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    assert_eq!(frames.last().unwrap().r#type, END_REQUEST);
    assert_eq!(frames.last().unwrap().protocol_status(), 2);

    task.await.unwrap().unwrap();
}

/// Uses stderr as well, which must get its own stream terminator.
struct StderrResponder;

#[async_trait]
impl Responder for StderrResponder {
    async fn respond(
        &self, _params: &Params, _stdin: &[u8], mut handle: ResponseHandle,
    ) -> ServerResult<()> {
        handle.write_stderr(b"diagnostic").await?;
        handle.write_stdout(b"Content-Type: text/plain\r\n\r\nok").await?;
        handle.end_request(0).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_stream_is_terminated_when_used() {
    let (mut client, task) = spawn_session(StderrResponder, test_config());

    client.write_all(&whole_request(1, 0, "/")).await.unwrap();

    let frames = read_until_eof(&mut client).await;
    let types: Vec<u8> = frames.iter().map(|f| f.r#type).collect();
    assert_eq!(types, vec![STDERR, STDOUT, STDOUT, STDERR, END_REQUEST]);
    assert!(frames[3].content.is_empty());

    task.await.unwrap().unwrap();
}
