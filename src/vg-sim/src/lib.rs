pub mod host;
pub mod physics;
pub mod rewind;
