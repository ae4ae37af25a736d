#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod retry;
pub mod server;

pub use client::{Client, ClientConfig};
pub use codec::{Codec, Decoded};
pub use retry::RetryPolicy;
pub use server::{factory, RequestHandler, Service};

// The service layer shares the runtime's error type: handler failures,
// protocol violations, timeouts, and disconnections all travel the same
// callback chains.
pub use colossus_runtime::Error;
