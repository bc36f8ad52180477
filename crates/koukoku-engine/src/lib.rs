pub mod chunks;
pub mod config;
pub mod connection;
pub mod engine;
pub mod loopback;
pub mod parser;
pub mod queue;
pub mod tls;

mod text;

pub use chunks::RawChunk;
pub use config::{EchoPolicy, EngineConfig};
pub use connection::{ConnectionEvent, ConnectionManager, Connector};
pub use engine::{Engine, SendTicket};
pub use loopback::{LoopbackConnector, LoopbackRemote};
pub use parser::{ParserEvent, StreamParser};
pub use queue::SendQueue;
pub use tls::TlsConnector;
