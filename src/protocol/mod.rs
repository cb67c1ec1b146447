//! Wire-level building blocks: TDS constants, pre-login frame headers and
//! the packet buffer used for all transport I/O.

pub mod constants;
pub mod header;
pub mod packet;

pub use header::PreloginHeader;
pub use packet::Packet;
