//! Remote text front end
//!
//! A debuggee started with `--open` listens for one client at a time;
//! `rdbg attach` is that client.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use server::RemoteFrontEnd;
