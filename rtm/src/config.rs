//! Client construction.

use crate::client::Client;
use crate::error::{ErrorKind, Result};
use crate::logger::Logger;
use crate::transport::Transport;
use crate::websocket::WebSocketTransport;

/// Protocol version path appended to the endpoint.
pub const PROTOCOL_PATH: &str = "v2";

/// `<endpoint>/v2?appkey=<appkey>`
pub fn rtm_url(endpoint: &str, appkey: &str) -> Result<String> {
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(crate::context!(ErrorKind::InvalidEndpoint(
            endpoint.to_string()
        )));
    }
    Ok(format!(
        "{}/{}?appkey={}",
        endpoint.trim_end_matches('/'),
        PROTOCOL_PATH,
        appkey
    ))
}

/// Builds a [`Client`] with a custom transport or logger.
///
/// ```rust,no_run
/// # fn main() -> rtm::Result<()> {
/// let client = rtm::Client::builder("wss://example.api.satori.com", "<appkey>")
///     .logger(rtm::Logger::from_env())
///     .build()?;
/// client.connect()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    endpoint: String,
    appkey: String,
    transport: Option<Box<dyn Transport>>,
    logger: Logger,
}

impl ClientBuilder {
    pub fn new<E: Into<String>, A: Into<String>>(endpoint: E, appkey: A) -> Self {
        ClientBuilder {
            endpoint: endpoint.into(),
            appkey: appkey.into(),
            transport: None,
            logger: Logger::default(),
        }
    }

    /// Replaces the default WebSocket transport.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Result<Client> {
        let url = rtm_url(&self.endpoint, &self.appkey)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Box::new(WebSocketTransport::new()));
        Ok(Client::from_parts(url, transport, self.logger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_has_a_single_slash() {
        assert_eq!(
            rtm_url("wss://host.example", "K").unwrap(),
            "wss://host.example/v2?appkey=K"
        );
        assert_eq!(
            rtm_url("ws://127.0.0.1:8080/", "K").unwrap(),
            "ws://127.0.0.1:8080/v2?appkey=K"
        );
    }

    #[test]
    fn endpoint_needs_websocket_scheme() {
        let err = rtm_url("https://host.example", "K").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::InvalidEndpoint("https://host.example".into())
        );
        assert!(ClientBuilder::new("host", "K").build().is_err());
    }
}
