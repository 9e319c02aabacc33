//! Wharf is a low-level streaming HTTP server library: the whole
//! request/response exchange, trailers included, is handled inside one
//! handler scope. See [`wharf_core`] for the full documentation.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use wharf_core as core;
#[doc(no_inline)]
pub use wharf_core::*;
