pub mod net;
pub mod repl;
pub mod signal;
pub mod world;
