//! HTTP relay channel client.

use async_trait::async_trait;
use pulse_common::constants::{DEFAULT_RELAY_PORT, RELAY_RPC_TIMEOUT, headers};
use pulse_common::{PulseError, RelayRequest, RelayResponse};

use super::RelayChannel;

/// Talks to the relay service of another pulse daemon over HTTP
pub struct HttpRelayChannel {
    client: reqwest::Client,
    nodename: String,
}

impl HttpRelayChannel {
    pub fn new(nodename: impl Into<String>) -> Result<Self, PulseError> {
        let client = reqwest::Client::builder()
            .timeout(RELAY_RPC_TIMEOUT)
            .connect_timeout(RELAY_RPC_TIMEOUT)
            .build()
            .map_err(|e| PulseError::Internal(format!("relay client: {e}")))?;

        Ok(Self {
            client,
            nodename: nodename.into(),
        })
    }
}

/// `relay` is `host` or `host:port`
fn relay_url(relay: &str) -> String {
    let has_port = relay
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

    if has_port {
        format!("http://{relay}/relay")
    } else {
        format!("http://{relay}:{DEFAULT_RELAY_PORT}/relay")
    }
}

impl HttpRelayChannel {
    /// One round trip. Error replies carry a `RelayResponse` body too, so
    /// only transport and decoding failures are errors here.
    async fn call(
        &self,
        request: &RelayRequest,
        relay: &str,
        secret: &str,
    ) -> Result<RelayResponse, PulseError> {
        let response = self
            .client
            .post(relay_url(relay))
            .header(headers::X_NODE_NAME, &self.nodename)
            .header(headers::X_RELAY_SECRET, secret)
            .json(request)
            .send()
            .await
            .map_err(|e| PulseError::Relay(format!("{relay}: {e}")))?;

        let status = response.status();
        response
            .json::<RelayResponse>()
            .await
            .map_err(|e| PulseError::Relay(format!("{relay}: undecodable reply ({status}): {e}")))
    }
}

#[async_trait]
impl RelayChannel for HttpRelayChannel {
    async fn send(
        &self,
        request: &RelayRequest,
        relay: &str,
        secret: &str,
    ) -> Option<RelayResponse> {
        match self.call(request, relay, secret).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::debug!(action = request.action(), error = %e, "Relay request failed");
                None
            }
        }
    }
}
