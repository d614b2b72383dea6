//! Utils Module.

pub mod http;
pub mod path;
pub mod server;
pub mod threadpool;
