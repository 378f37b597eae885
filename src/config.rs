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

//! Server configuration.

use std::{net::SocketAddr, time::Duration};

/// Configuration of a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint to accept TCP connections on.
    pub listen: SocketAddr,
    /// Listen backlog handed to the OS.
    pub backlog: u32,
    /// Worker threads for the runtime; 0 means one per core. Applied by
    /// whoever builds the runtime, not by the server itself.
    pub worker_threads: usize,
    /// How long a connection may sit idle between records before the
    /// session is torn down. `None` disables the timeout.
    pub idle_timeout: Option<Duration>,
    /// `FCGI_MAX_CONNS` value reported to management queries.
    pub max_conns: usize,
    /// `FCGI_MAX_REQS` value reported to management queries.
    pub max_reqs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 6666)),
            backlog: 1024,
            worker_threads: 0,
            idle_timeout: Some(Duration::from_secs(60)),
            max_conns: 64,
            max_reqs: 64 * 16,
        }
    }
}

impl ServerConfig {
    /// Sets the listen endpoint.
    pub fn listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Sets the listen backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the worker thread count, 0 meaning one per core.
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Sets or disables the idle timeout.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the reported `FCGI_MAX_CONNS`.
    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    /// Sets the reported `FCGI_MAX_REQS`.
    pub fn max_reqs(mut self, max_reqs: usize) -> Self {
        self.max_reqs = max_reqs;
        self
    }
}
