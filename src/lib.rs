//! Server-side rendering runtime.
//!
//! Serves rendered pages through a persistent page cache, proxies API
//! routes to configured upstreams, and tracks in-flight work so a
//! serverless container only reports an invocation complete once every
//! response, cache write and metrics flush is done.

pub mod cache;
pub mod capture;
pub mod compression;
pub mod config;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod lambda;
pub mod metrics;
pub mod monitor;
pub mod proxy;
pub mod reload;
pub mod render;
pub mod response;
pub mod runtime;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};
pub use runtime::{SsrRuntime, SsrRuntimeBuilder};
