//! The instruments RPC layer: wire format plus a concurrent session built on
//! top of it.

pub mod message;
pub mod session;

pub use message::{Aux, AuxValue, Message, MessageHeader, PayloadHeader};
pub use session::RpcSession;
