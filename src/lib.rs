//! # muxwire
//!
//! Many logical TCP-like streams and UDP-like packet flows carried over a
//! single physical connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Local flows / Dispatcher (outbound handlers)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Client multiplexor  ◄── frames ──►  Server demux        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Mux writer + frame codec (session id, status, target)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Pipes and links (bounded chunk queues, interrupt)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Physical byte stream (TCP, in-memory duplex, ...)      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use muxwire::config::MuxConfig;
//! use muxwire::mux::{Client, Server};
//! use muxwire::net::Destination;
//! use muxwire::outbound::DirectDispatcher;
//! use muxwire::pipe::{self, PipeOptions};
//!
//! # async fn demo() -> muxwire::Result<()> {
//! let config = MuxConfig::default();
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//!
//! let server = Server::new(
//!     pipe::attach(server_io, config.session_pipe()),
//!     Arc::new(DirectDispatcher::default()),
//!     &config,
//! );
//! tokio::spawn(async move { server.run().await });
//!
//! let client = Client::new(pipe::attach(client_io, config.session_pipe()), &config);
//! let (app, local) = pipe::new_links(PipeOptions::unbounded());
//! client.dispatch(Destination::parse(muxwire::net::Network::Tcp, "example.com:80")?, local)?;
//! # drop(app);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod buf;
pub mod config;
pub mod error;
pub mod mux;
pub mod net;
pub mod outbound;
pub mod pipe;

pub use error::{Error, Result};
