//! The interception proxy: a TLS listener for the target host whose every
//! request is forwarded to the real upstream and answered with its
//! (possibly rewritten) JSON.

pub mod forward;
pub mod rewrite;
pub mod routes;
pub mod server;
pub mod tls;

pub use forward::Forwarder;
pub use rewrite::RewriteRule;
pub use routes::{Route, router};
pub use server::ServerHandle;
