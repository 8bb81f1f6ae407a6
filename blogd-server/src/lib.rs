//! # blogd-server
//!
//! TCP server for blogd.
//!
//! This crate provides:
//! - `BlogService`, the request handler mapping blog operations onto a
//!   document store
//! - The error-to-status policy shared by every operation
//! - TCP connection handling with streamed LIST_BLOG responses
//! - Session tracking, configuration and Prometheus metrics

pub mod blog;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod session;

pub use blog::{to_blog_post, StoredBlogDocument};
pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, StorageConfig};
pub use error::ServerError;
pub use handler::{BlogService, BlogStream, ServerInfo};
pub use metrics::Metrics;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
