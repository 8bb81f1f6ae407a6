//! # blogd-client
//!
//! Client library for blogd.
//!
//! This crate provides:
//! - Async TCP client with request/response correlation
//! - High-level API for every blog operation
//! - LIST_BLOG as an async stream of posts

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use stream::ListStream;
