//! Transport backends.

pub mod memory;
pub mod tcp;

pub use memory::{InMemoryModelTransport, InMemoryReceiverTransport, RecordedCall, SequentialMessageIds};
pub use tcp::{
    read_json_lines, write_json_line, TcpModelTransport, TcpReceiverTransport,
    DEFAULT_MAX_LINE_BYTES,
};
