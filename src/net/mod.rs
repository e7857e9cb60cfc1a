pub mod connector;
pub mod datagram;
pub mod destination;
pub mod pool;
pub mod reactor;

pub use connector::*;
pub use datagram::*;
pub use destination::*;
pub use pool::*;
pub use reactor::*;
