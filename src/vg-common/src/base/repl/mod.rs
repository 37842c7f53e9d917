mod channel;
pub use channel::*;

mod client;
pub use client::*;

mod registry;
pub use registry::*;

mod replicable;
pub use replicable::*;

mod server;
pub use server::*;

mod shared;
pub use shared::*;

#[cfg(test)]
pub(crate) mod testing;
