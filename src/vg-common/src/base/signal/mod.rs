mod bus;
pub use bus::*;
