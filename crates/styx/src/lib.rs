#![forbid(unsafe_code)]
//! Asynchronous 9P2000 (Styx) client library for Rust.
//!
//! This crate provides a tokio-based async client for the 9P2000 protocol,
//! the file protocol of Plan 9 and Inferno, allowing you to walk, open,
//! read, write, stat and remove files served by a remote 9P server over any
//! bidirectional byte stream.
//!
//! # Overview
//!
//! A [`Conn`] multiplexes any number of concurrent operations over one
//! stream. Each request is correlated with its reply by a 16-bit tag; a
//! reader task and a writer task run for the lifetime of the connection, and
//! every caller suspends only on its own reply. Expired operations are
//! cancelled with the protocol's flush mechanism rather than silently
//! abandoned.
//!
//! # Getting Started
//!
//! 1. Connect a stream to the server (TCP, TLS, a pipe — anything
//!    implementing `AsyncRead + AsyncWrite`)
//! 2. Create a [`Conn`] and negotiate a protocol version
//! 3. Optionally authenticate over the handle returned by [`Conn::auth`]
//! 4. Attach to one of the server's trees with [`Conn::attach`], and use the
//!    resulting [`Fsys`] and [`File`] instances for I/O
//!
//! # Example
//!
//! ```no_run
//! use styx::{Conn, Result, om};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let stream = tokio::net::TcpStream::connect("9p.example.org:564").await?;
//!     let conn = Conn::new(stream);
//!     conn.version(0, None).await?;
//!
//!     let fsys = conn.attach(None, "alice", "").await?;
//!     let file = fsys.open("/etc/motd", om::READ).await?;
//!     let data = file.read(8192).await?;
//!     println!("{}", String::from_utf8_lossy(&data));
//!
//!     file.close().await;
//!     fsys.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Version Negotiation**: client sends `TVersion`, server responds with
//!    `RVersion` choosing a message size no larger than the client's
//! 2. **Authentication** (optional): `TAuth`/`RAuth` exchange, then an
//!    authentication protocol run over the returned auth file
//! 3. **Attach**: the client attaches to a file tree with `TAttach`
//! 4. **Operations**: walk, open, create, read, write, stat, wstat, remove
//! 5. **Cleanup**: fids are clunked with `TClunk` to release resources
//!
//! ## Fid Management
//!
//! A "fid" (file identifier) is a 32-bit handle naming a file on the server
//! for one connection. The library allocates fids from a per-connection
//! pool, recycles them after their clunk is acknowledged, and never exposes
//! raw fid numbers: callers hold [`Fsys`] and [`File`] values instead.
//!
//! ## Cancellation
//!
//! Give a connection a time limit with [`Conn::set_time_limit`]. An expired
//! operation sends `TFlush` for its tag and fails with
//! [`Error::Interrupted`](error::Error::Interrupted) — unless the real
//! answer arrives before the flush is acknowledged, in which case the answer
//! stands. [`Conn::quick_flush`] returns to the caller immediately while
//! the flush completes in the background.
//!
//! # Error Handling
//!
//! All operations return [`error::Error`]. A server's error reply is
//! carried verbatim in `Error::Remote`; a dead connection fails every
//! pending and future request with `Error::Hungup`; walk failures split
//! into `Error::NotFound` and `Error::NotDir` so callers can branch without
//! matching text.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on
//! Rust's type system for memory safety. All file operations are async and
//! designed to be cancellation-safe.
pub mod client;
pub mod error;
pub mod fcall;
pub mod fsys;
pub mod serialize;
#[macro_use]
pub mod utils;
#[cfg(test)]
mod testsrv;

pub use crate::client::Conn;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fsys::{File, Fsys};
pub use crate::utils::Result;
