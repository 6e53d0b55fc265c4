//! Stream multiplexing.
//!
//! Many logical sessions share one physical connection. Each frame on the
//! wire is
//!
//! ```text
//! ┌──────────┬────────────┬────────┬────────┬──────────────┐
//! │ meta len │ session id │ status │ option │ target (New) │  metadata
//! │  u16 BE  │   u16 BE   │   u8   │   u8   │  net+addr+port│
//! └──────────┴────────────┴────────┴────────┴──────────────┘
//! ┌──────────┬─────────────┐
//! │ data len │   payload   │  only with the DATA option
//! │  u16 BE  │             │
//! └──────────┴─────────────┘
//! ```
//!
//! The [`Client`] opens sessions and demultiplexes replies; the [`Server`]
//! accepts sessions and hands each one to a [`Dispatcher`]. Both sides frame
//! outbound data with a [`MuxWriter`].

mod client;
pub mod frame;
mod pool;
mod server;
mod session;
mod writer;

pub use client::{Client, ClientStats};
pub use frame::{FrameMetadata, SessionId, SessionOption, SessionStatus, MAX_METADATA_LEN};
pub use pool::{ClientPool, Dialer};
pub use server::{Dispatcher, Server};
pub use writer::{MuxWriter, TransferType, MAX_SEGMENT_SIZE};
