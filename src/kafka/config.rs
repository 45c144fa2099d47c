use crate::config::KafkaConfig;
use rdkafka::config::ClientConfig;
use tracing::info;

/// Creates an `rdkafka` [`ClientConfig`] shared by producers and consumers.
///
/// It handles:
/// - Setting up bootstrap servers and the client id.
/// - Enabling SSL/TLS if `ssl_enabled` is true.
/// - Configuring SASL authentication if a mechanism, username and password
///   are all provided.
pub fn create_client_config(config: &KafkaConfig, brokers: &[String]) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", brokers.join(","));
    client_config.set(
        "client.id",
        config.client_id.clone().unwrap_or_else(default_client_id),
    );

    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
    }

    if let (Some(mechanism), Some(username), Some(password)) = (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        info!(sasl_mechanism = %mechanism, "Configuring SASL authentication");
        client_config
            .set("sasl.mechanism", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);

        if config.ssl_enabled {
            client_config.set("security.protocol", "sasl_ssl");
        } else {
            client_config.set("security.protocol", "sasl_plaintext");
        }
    }

    client_config
}

/// Client id derived from the hostname, falling back to a random UUID.
pub fn default_client_id() -> String {
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("eventline-{}", name);
        }
    }

    format!("eventline-{}", uuid::Uuid::new_v4())
}
