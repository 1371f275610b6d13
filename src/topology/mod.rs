//! Broker topology declarations.
//!
//! Feature modules describe the queues they need as [`Binding`]s and add them
//! to a [`TopologyRegistry`] during startup. The registry is handed to
//! [`Engine::apply_topology`](crate::engine::Engine::apply_topology) once the
//! broker connection is up, which replays the bindings in registration order.
//!
//! ## Dead-lettering
//!
//! One dead-letter exchange and queue are shared by every binding that opts
//! in. They are always declared, before any feature binding.

/// Dead-letter exchange shared by all dead-lettered queues.
pub const DEAD_LETTER_EXCHANGE: &str = "hris.dlx";
/// Queue collecting dead-lettered messages.
pub const DEAD_LETTER_QUEUE: &str = "hris.dlq";
/// Routing key joining the dead-letter exchange and queue.
pub const DEAD_LETTER_ROUTING_KEY: &str = "hris.dead_letter";

/// A queue bound to an exchange for a set of routing-key patterns.
///
/// Patterns use topic-exchange wildcards: `*` matches exactly one word and
/// `#` matches zero or more words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
    /// Whether the queue and exchange survive a broker restart.
    pub durable: bool,
    /// Whether rejected or expired messages go to the dead-letter exchange.
    pub dead_letter: bool,
}

impl Binding {
    /// Create a durable, dead-lettered binding with no routing keys.
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_keys: Vec::new(),
            durable: true,
            dead_letter: true,
        }
    }

    /// Add a routing-key pattern.
    pub fn route(mut self, pattern: impl Into<String>) -> Self {
        self.routing_keys.push(pattern.into());
        self
    }

    /// Add several routing-key patterns.
    pub fn routes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }
}

/// Append-only list of bindings, filled during startup.
///
/// Registering the same binding twice is allowed and leads to a redundant
/// (idempotent) declaration when the topology is applied.
#[derive(Debug, Default, Clone)]
pub struct TopologyRegistry {
    bindings: Vec<Binding>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bindings, preserving order.
    pub fn register(&mut self, bindings: impl IntoIterator<Item = Binding>) {
        self.bindings.extend(bindings);
    }

    /// All bindings in registration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Distinct queue names in first-registration order.
    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = Vec::new();
        for binding in &self.bindings {
            if !queues.contains(&binding.queue.as_str()) {
                queues.push(&binding.queue);
            }
        }
        queues
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Remove every binding. Only meant for test isolation.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Check a routing key against a topic-exchange pattern.
///
/// Both are dot-separated words. `*` matches exactly one word, `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
