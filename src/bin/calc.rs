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

//! Demo responder: a tiny calculator behind FastCGI.
//!
//! Evaluates an integer expression (`+ - * /`, left to right) taken from
//! the `expr` query-string field, or from the request body on POST, and
//! replies with a `text/plain` CGI response.

use async_trait::async_trait;
use clap::Parser;
use fastcgi_server::{Params, Responder, ResponseHandle, Server, ServerConfig, ServerResult};
use std::{net::SocketAddr, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fcgi-calc", about = "FastCGI calculator responder")]
struct Cli {
    /// Endpoint to accept FastCGI connections on.
    #[arg(short, long, default_value = "0.0.0.0:6666")]
    listen: SocketAddr,

    /// Worker threads, 0 meaning one per core.
    #[arg(short, long, default_value_t = 0)]
    workers: usize,

    /// Idle timeout in seconds, 0 disabling the timeout.
    #[arg(long, default_value_t = 60)]
    idle_timeout: u64,
}

fn main() -> ServerResult<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = ServerConfig::default()
        .listen(cli.listen)
        .worker_threads(cli.workers)
        .idle_timeout((cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)));

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = builder.enable_all().build()?;
    runtime.block_on(Server::new(config, Calculator).run())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fcgi_calc=info,fastcgi_server=info".into()),
        ))
        .init();
}

struct Calculator;

#[async_trait]
impl Responder for Calculator {
    async fn respond(
        &self, params: &Params, stdin: &[u8], mut handle: ResponseHandle,
    ) -> ServerResult<()> {
        let expression = expression_from(params, stdin);
        match evaluate(&expression) {
            Ok(result) => {
                let body = format!("Content-Type: text/plain\r\n\r\n{result}\n");
                handle.write_stdout(body.as_bytes()).await?;
                handle.end_request(0).await
            }
            Err(reason) => {
                let diagnostic = format!("cannot evaluate {expression:?}: {reason}\n");
                handle.write_stderr(diagnostic.as_bytes()).await?;
                handle
                    .write_stdout(
                        b"Status: 400 Bad Request\r\nContent-Type: text/plain\r\n\r\nbad expression\n",
                    )
                    .await?;
                handle.end_request(1).await
            }
        }
    }
}

/// Takes the expression from the `expr` query-string field, falling back
/// to the request body.
fn expression_from(params: &Params, stdin: &[u8]) -> String {
    let query = params.get("QUERY_STRING").map(String::as_str).unwrap_or("");
    for item in query.split('&') {
        if let Some(raw) = item.strip_prefix("expr=") {
            return percent_decode(raw);
        }
    }
    String::from_utf8_lossy(stdin).into_owned()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

enum Token {
    Number(i64),
    Operator(char),
}

fn tokenize(expression: &str) -> Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut digits = String::new();
    let flush = |digits: &mut String, tokens: &mut Vec<Token>| -> Result<(), &'static str> {
        if digits.is_empty() {
            return Ok(());
        }
        let number = digits.parse().map_err(|_| "number out of range")?;
        tokens.push(Token::Number(number));
        digits.clear();
        Ok(())
    };
    for c in expression.chars() {
        match c {
            '0'..='9' => digits.push(c),
            '+' | '-' | '*' | '/' => {
                flush(&mut digits, &mut tokens)?;
                tokens.push(Token::Operator(c));
            }
            c if c.is_whitespace() => flush(&mut digits, &mut tokens)?,
            _ => return Err("unexpected character"),
        }
    }
    flush(&mut digits, &mut tokens)?;
    Ok(tokens)
}

/// Left-to-right integer evaluation, no precedence.
fn evaluate(expression: &str) -> Result<i64, &'static str> {
    let mut tokens = tokenize(expression)?.into_iter();
    let Some(Token::Number(mut acc)) = tokens.next() else {
        return Err("expected a number");
    };
    loop {
        let Some(token) = tokens.next() else {
            return Ok(acc);
        };
        let Token::Operator(op) = token else {
            return Err("expected an operator");
        };
        let Some(Token::Number(rhs)) = tokens.next() else {
            return Err("expected a number");
        };
        acc = match op {
            '+' => acc.wrapping_add(rhs),
            '-' => acc.wrapping_sub(rhs),
            '*' => acc.wrapping_mul(rhs),
            '/' if rhs == 0 => return Err("division by zero"),
            '/' => acc.wrapping_div(rhs),
            _ => return Err("unexpected character"),
        };
    }
}
