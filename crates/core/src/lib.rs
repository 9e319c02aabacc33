//! The core crate of the Wharf server.
//!
//! Wharf is a low-level streaming HTTP server library built around one
//! constraint: the entire lifetime of a request (head, body chunks,
//! optional trailers, informational responses, final head, response body,
//! response trailers) happens inside a single handler invocation, so
//! scope-based wrappers (tracing spans, timers, timeouts, cancellation
//! scopes) observe the complete exchange.
//!
//! The crate deliberately stops at the part level: HTTP/1.1 and HTTP/2 wire
//! framing is an external collaborator behind [`proto::HttpCodec`], and the
//! connection layer only decides which framing applies (plaintext is
//! HTTP/1.1; TLS negotiates via ALPN).
//!
//! # Feature flags
//!
//! | Feature | Description | Default? |
//! | --- | --- | :---: |
//! | `server` | Built-in listener loop ([`Server`]) | ✔️ |
//! | `rustls` | TLS, mutual TLS and ALPN via [`tokio-rustls`](https://crates.io/crates/tokio-rustls) | ✔️ |
//! | `test` | In-memory exchange utilities for testing | ✔️ |
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Re-export of `async_trait` for implementing the dyn-compatible traits.
pub use async_trait::async_trait;

#[macro_use]
mod cfg;

pub mod chain;
pub mod config;
pub mod conn;
mod error;
pub mod handler;
pub mod http;
pub mod proto;
cfg_feature! {
    #![feature = "server"]
    pub mod server;
    pub use self::server::{Server, ServerHandle};
}
pub mod service;
pub mod stream;
cfg_feature! {
    #![feature = "test"]
}

pub use self::chain::{ChainBuilder, RequestScope};
pub use self::conn::Listener;
pub use self::error::{BoxedError, Error};
pub use self::handler::Handler;
pub use self::http::{RequestContext, RequestHead, ResponseHead};
pub use self::service::Service;

/// Result type which has [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A list of things that automatically imports into application code.
pub mod prelude {
    pub use async_trait::async_trait;

    pub use crate::chain::{ChainBuilder, Next, RequestScope, Stage};
    pub use crate::conn::{Listener, TcpListener};
    cfg_feature! {
        #![feature = "rustls"]
        pub use crate::conn::RustlsListener;
        pub use crate::conn::rustls::RustlsConfig;
    }
    pub use crate::conn::HttpBuilder;
    pub use crate::handler::{Handler, handler_fn};
    pub use crate::http::{
        HeaderMap, Method, RequestContext, RequestHead, ResponseHead, ResponseSender, StatusCode,
        RequestConcludingReader,
    };
    cfg_feature! {
        #![feature = "server"]
        pub use crate::server::Server;
    }
    pub use crate::service::Service;
    pub use crate::stream::{AsyncReader, AsyncWriter, ReadError};
}

#[doc(hidden)]
pub trait IntoVecString {
    fn into_vec_string(self) -> Vec<String>;
}

impl IntoVecString for &'static str {
    fn into_vec_string(self) -> Vec<String> {
        vec![self.to_owned()]
    }
}
impl IntoVecString for String {
    fn into_vec_string(self) -> Vec<String> {
        vec![self]
    }
}

impl<const N: usize> IntoVecString for [&'static str; N] {
    fn into_vec_string(self) -> Vec<String> {
        self.into_iter().map(Into::into).collect()
    }
}

impl IntoVecString for Vec<String> {
    fn into_vec_string(self) -> Vec<String> {
        self
    }
}
