//! chanfetch transport: HTTP-style request/response correlation over a single
//! bidirectional message channel.
//!
//! A [`TransportClient`] turns `fetch` calls into request envelopes and awaits
//! the matching answer; a [`TransportServer`] turns request envelopes into
//! [`EmulatedRequest`]/[`EmulatedResponse`] pairs for a handler. Several
//! clients and servers can share one channel, partitioned by instance id.

pub mod channel;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod fetch;
pub mod headers;
pub mod instance;
pub mod logging;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;

pub use channel::{Channel, MemoryChannel, MessageHandler, Subscription};
pub use client::TransportClient;
pub use config::TransportConfig;
pub use correlation::{CorrelationManager, CorrelationStats, PendingReply};
pub use error::{RemoteError, Result, TransportError};
pub use fetch::{FetchOptions, FetchResponse};
pub use headers::Headers;
pub use instance::{generate_instance_id, InstanceFilter, Role};
pub use logging::{init_logging, LogLevel};
pub use protocol::{Envelope, ErrorEnvelope, Method, RequestEnvelope, ResponseEnvelope};
pub use request::{BodyEvent, EmulatedRequest};
pub use response::{EmulatedResponse, FinishKind, ResponseState};
pub use server::{HandlerFuture, RequestHandler, ServerState, ServerStats, TransportServer};
