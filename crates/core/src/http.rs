//! HTTP-level request and response surface.
//!
//! This module instantiates the generic [`stream`](crate::stream)
//! primitives for HTTP: the request body becomes an [`AsyncReader`] over
//! byte chunks whose terminal element is the optional trailer block, and the
//! response becomes a write-state machine fed through a single-shot
//! [`ResponseSender`].

pub mod body;
pub mod request;
pub mod response;

pub use body::{RequestBodyReader, RequestConcludingReader};
pub use request::{RequestContext, RequestHead};
pub use response::{ResponseBodyWriter, ResponseConcludingWriter, ResponseHead, ResponseSender};

pub use http::uri::{Authority, PathAndQuery, Scheme};
pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
