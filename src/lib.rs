#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod config;
mod conn;
mod error;
mod meta;
pub mod params;
mod request;
pub mod responder;
pub mod server;

pub use crate::{
    config::ServerConfig,
    error::*,
    meta::{ProtocolStatus, RecordType, Role},
    params::Params,
    responder::{Responder, ResponseHandle},
    server::{Server, serve_connection},
};
