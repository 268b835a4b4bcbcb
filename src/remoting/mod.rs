//! Wire protocol: packets, framing, channels and transports.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod interceptor;
pub mod packet;

pub use channel::{Channel, PacketHandler};
pub use codec::{Codec, Decodable, DEFAULT_MAX_FRAME_SIZE};
pub use connection::{Connection, Inbound, InVmConnection, TcpAcceptor, TcpConnection};
pub use interceptor::{intercept, Interceptor};
pub use packet::{Packet, PacketBody, PacketType, QueueQueryResult, PROTOCOL_VERSION};
