//! Upstream side of the completions route: request rewriting, the HTTP
//! client, and the response relay.

pub mod relay;
pub mod rewrite;
pub mod upstream;

pub use relay::{RelayContext, RelayError, RelayStream, scan_usage};
pub use rewrite::{RewriteError, forward_headers, rewrite_body};
pub use upstream::{Upstream, UpstreamBuilder};
