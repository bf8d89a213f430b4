//! High-level client for the Vesper SDK.

use crate::dispatch::NotificationDispatcher;
use crate::error::Result;
use crate::network::{MemoryTransport, RuleSource, ViewSource};
use crate::subscription::{RuleSubscription, ViewSubscription};
use std::sync::Arc;
use tracing::debug;

/// Configuration for the Vesper client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Name used in logs.
    pub client_name: String,
    /// Fold queued result calls into one when a listener falls behind.
    pub coalesce_results: bool,
    /// Fetch a result snapshot when fragments skip logical times.
    pub resync_results_on_gap: bool,
    /// Channel capacity per subscription for the in-memory transport.
    pub subscription_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "vesper-client".to_string(),
            coalesce_results: true,
            resync_results_on_gap: true,
            subscription_buffer: 256,
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn coalesce_results(mut self, enabled: bool) -> Self {
        self.config.coalesce_results = enabled;
        self
    }

    pub fn resync_results_on_gap(mut self, enabled: bool) -> Self {
        self.config.resync_results_on_gap = enabled;
        self
    }

    pub fn subscription_buffer(mut self, capacity: usize) -> Self {
        self.config.subscription_buffer = capacity;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The main Vesper client.
///
/// Holds the transport and the dispatcher shared by every subscription it
/// opens.
///
/// # Example
///
/// ```rust
/// use vsr_sdk::{Client, ClientConfig};
///
/// # tokio_test::block_on(async {
/// let client = Client::new_with_memory_transport(ClientConfig::default());
/// client.transport().create_rule_stream("limits", 5, ["A", "B"]);
///
/// let rules = client.subscribe_rules("limits").await.unwrap();
/// assert_eq!(rules.version().await.get(), 5);
/// # });
/// ```
pub struct Client<T: RuleSource + ViewSource> {
    config: ClientConfig,
    transport: Arc<T>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl Client<MemoryTransport> {
    /// Create a new client with a fault-free in-memory transport.
    pub fn new_with_memory_transport(config: ClientConfig) -> Self {
        let transport = MemoryTransport::new().with_buffer(config.subscription_buffer);
        Self::new(Arc::new(transport), config)
    }
}

impl<T: RuleSource + ViewSource> Client<T> {
    /// Create a new client with a custom transport.
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        Self {
            config,
            transport,
            dispatcher: Arc::new(NotificationDispatcher::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.client_name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Ids of every open subscription.
    pub fn subscriptions(&self) -> Vec<String> {
        self.dispatcher.routes()
    }

    /// Mirror a rule stream, seeded from its current snapshot.
    pub async fn subscribe_rules(&self, stream: impl Into<String>) -> Result<RuleSubscription<T>> {
        let stream = stream.into();
        debug!(client = %self.config.client_name, %stream, "subscribing to rules");
        RuleSubscription::open(
            stream,
            self.transport.clone(),
            self.dispatcher.clone(),
            &self.config,
        )
        .await
    }

    /// Follow a view's results, seeded from its latest full result if there is one.
    pub async fn subscribe_view(&self, view: impl Into<String>) -> Result<ViewSubscription<T>> {
        let view = view.into();
        debug!(client = %self.config.client_name, %view, "subscribing to view");
        ViewSubscription::open(
            view,
            self.transport.clone(),
            self.dispatcher.clone(),
            &self.config,
        )
        .await
    }
}

/// Convenience functions for quick setups.
pub mod quick {
    use super::*;
    use vsr_delta::NetworkConfig;

    /// A client over a transport that withholds, duplicates and reorders messages.
    pub fn chaotic_client(seed: u64) -> Client<MemoryTransport> {
        let config = ClientConfig::default();
        let transport = MemoryTransport::with_network(NetworkConfig::chaotic().with_seed(seed))
            .with_buffer(config.subscription_buffer);
        Client::new(Arc::new(transport), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;

    #[test]
    fn test_config_builder() {
        let config = ClientConfigBuilder::new()
            .client_name("desk-7")
            .coalesce_results(false)
            .resync_results_on_gap(false)
            .subscription_buffer(16)
            .build();

        assert_eq!(config.client_name, "desk-7");
        assert!(!config.coalesce_results);
        assert!(!config.resync_results_on_gap);
        assert_eq!(config.subscription_buffer, 16);
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.client_name, "vesper-client");
        assert!(config.coalesce_results);
        assert!(config.resync_results_on_gap);
        assert_eq!(config.subscription_buffer, 256);
    }

    #[tokio::test]
    async fn test_subscriptions_are_exclusive() {
        let client = Client::new_with_memory_transport(ClientConfig::default());
        client.transport().create_rule_stream("limits", 0, ["A"]);
        client.transport().create_view("risk");

        let rules = client.subscribe_rules("limits").await.unwrap();
        let view = client.subscribe_view("risk").await.unwrap();
        assert_eq!(client.subscriptions(), vec!["limits", "risk"]);

        assert!(matches!(
            client.subscribe_rules("limits").await,
            Err(SdkError::AlreadySubscribed(_))
        ));

        rules.close().await;
        view.close().await;
        assert!(client.subscriptions().is_empty());
        assert!(client.subscribe_rules("limits").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_stream_fails_to_subscribe() {
        let client = Client::new_with_memory_transport(ClientConfig::default());
        assert!(matches!(
            client.subscribe_view("missing").await,
            Err(SdkError::TransportDisconnected(_))
        ));
    }
}
