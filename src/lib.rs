//! Local TLS interception proxy for a single login host.

pub mod ca;
pub mod config;
pub mod error;
pub mod hosts;
pub mod lifecycle;
pub mod logging;
pub mod proxy;
pub mod resolver;

pub use error::{Error, Result};
