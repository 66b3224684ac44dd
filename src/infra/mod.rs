//! Infrastructure adapters: TCP and in-memory transports.

pub mod transport;

pub use transport::{
    InMemoryModelTransport, InMemoryReceiverTransport, SequentialMessageIds, TcpModelTransport,
    TcpReceiverTransport,
};
