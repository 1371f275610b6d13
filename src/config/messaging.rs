//! Messaging and broker connection configuration types.

use serde::Deserialize;

/// Default name this process publishes under.
pub const DEFAULT_SERVICE_NAME: &str = "hris";
/// Default exchange HRIS publishes its own events to.
pub const DEFAULT_EXCHANGE: &str = "hris.events";
/// Default consumer prefetch (unacknowledged message ceiling).
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Name stamped as the origin of published events. Events carrying this
    /// name are skipped by this process's consumers.
    pub service_name: String,
    /// Exchange this service publishes to.
    pub exchange: String,
    /// Queues to consume. Empty means the queues the built-in features
    /// consume.
    pub queues: Vec<String>,
    /// Consumer tag prefix.
    pub consumer_tag: String,
    /// Broker connection settings.
    pub amqp: AmqpConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            queues: Vec::new(),
            consumer_tag: format!("{}-consumer", DEFAULT_SERVICE_NAME),
            amqp: AmqpConfig::default(),
        }
    }
}

/// AMQP connection configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// Full connection URL. Overrides the individual fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch_count: u16,
    /// Connection name shown in the broker's management UI.
    pub connection_name: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            connection_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl AmqpConfig {
    /// Config pointing at an explicit URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Connection URL, built from the individual fields unless `url` is set.
    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        format!(
            "amqp://{}:{}@{}:{}/{}",
            percent_encode(&self.username),
            percent_encode(&self.password),
            self.host,
            self.port,
            percent_encode(&self.vhost)
        )
    }

    /// Connection URL with credentials removed, for logging.
    pub fn redacted_url(&self) -> String {
        let url = self.url();
        match (url.find("://"), url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}***{}", &url[..scheme_end + 3], &url[at..])
            }
            _ => url,
        }
    }
}

impl std::fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("url", &self.redacted_url())
            .field("prefetch_count", &self.prefetch_count)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

/// Percent-encode everything outside the URI unreserved set.
fn percent_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
