//! Recording reverse proxy for mimic.
//!
//! The proxy forwards client traffic to an upstream and posts every exchange
//! to a [`Recorder`], which writes response bodies to disk and keeps a mock
//! configuration up to date:
//!
//! ```text
//! client ──► ProxyServer ──► upstream
//!                │
//!                ▼ (unbounded queue)
//!            Recorder ──► <host>-config.yaml + response files
//! ```

pub mod client;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod mockconfig;
pub mod namer;
pub mod recorder;
pub mod server;

pub use client::PoolSettings;
pub use error::{RecorderError, Result};
pub use exchange::HttpExchange;
pub use mockconfig::{MockConfig, Resource};
pub use recorder::{Outcome, Recorder, RecorderHandle, RecorderOptions};
pub use server::{ProxyServer, ProxySettings, STATUS_PATH};
