//! Call-correlated RPC over TCP.
//!
//! A [`Server`] runs registered [`Method`]s on a bounded worker pool and answers each
//! CALL with a REPLY or ERROR carrying the same call id. A [`Client`] multiplexes calls
//! over one connection and matches those answers back to the waiting callers.

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod message;
pub mod method;
pub mod net;
pub mod pool;
pub mod types;

pub use config::{ClientConfig, ServerConfig};
pub use error::{root_cause, ErrorTranslator, MethodError, RpcError, Translation};
pub use futures::future::BoxFuture;
pub use message::{CallId, Message, MessageType, Payload, RemoteError, NO_REPLY};
pub use method::{Method, MethodRegistry, RegistryError};
pub use net::{
    channel::{Channel, ChannelId},
    client::{Client, Command},
    server::{Server, ServerHandle},
};
pub use types::{Decode, Encode, TypeMismatch, Value};
