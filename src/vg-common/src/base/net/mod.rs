mod packet;
pub use packet::*;

mod transport;
pub use transport::*;

mod wire;
pub use wire::*;
