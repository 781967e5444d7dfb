//!Client for the RTM publish/subscribe messaging service.
//!
//!A [`Client`] keeps one WebSocket connection to the service and multiplexes
//!requests, replies and subscription data over it. Nothing runs in the
//!background: every reply handler, subscription handler and close listener
//!is called from inside a read call made by the application.
//!
//!```rust,no_run
//!# fn main() -> rtm::Result<()> {
//!use std::time::Duration;
//!
//!let client = rtm::Client::new("wss://example.api.satori.com", "<appkey>")?;
//!client.on_close(|ev| eprintln!("closed: {}", ev));
//!client.connect()?;
//!
//!client.subscribe("animals", rtm::SubscribeOptions::new(), |_ctx, event| {
//!    for message in event.messages() {
//!        println!("{}", message);
//!    }
//!})?;
//!
//!client.publish(
//!    "animals",
//!    &serde_json::json!({"who": "zebra", "where": [34.134358, -118.321506]}),
//!    rtm::on_reply(|reply| {
//!        if !reply.is_success() {
//!            eprintln!("publish failed: {:?}", reply.reason());
//!        }
//!    }),
//!)?;
//!
//!client.sock_read_repeatedly(Some(Duration::from_secs(10)))?;
//!client.close()?;
//!# Ok(())
//!# }
//!```
//!
//!The client can also be shared: one thread blocks in
//![`Client::sock_read_repeatedly`] while others publish.

#![deny(trivial_numeric_casts, unused_extern_crates)]

pub use crate::client::{Client, ConnectionState, ReplyHandler};
pub use crate::config::{rtm_url, ClientBuilder};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::logger::Logger;
pub use crate::pdu::{Action, CloseEvent, Pdu, Reply, ReplyKind};
pub use crate::subscription::{
    EventKind, History, ReadOptions, SubscribeOptions, SubscriptionContext, SubscriptionEvent,
    SubscriptionHandler, SubscriptionState,
};
pub use crate::transport::{EventSink, FrameKind, ReadStatus, Transport, TransportEvent};
pub use crate::websocket::WebSocketTransport;

pub mod auth;
mod client;
mod config;
pub mod error;
mod logger;
pub mod pdu;
mod subscription;
pub mod transport;
mod websocket;


/// Wraps a closure as the optional reply handler of a request.
pub fn on_reply<F>(f: F) -> Option<ReplyHandler>
where
    F: FnOnce(Reply) + Send + 'static,
{
    Some(Box::new(f))
}
