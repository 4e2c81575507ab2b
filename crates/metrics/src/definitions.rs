//! Metric name definitions.

/// Feed lifecycle and traffic metrics
pub mod feeds {
    /// Total number of feeds opened
    pub const OPENED_TOTAL: &str = "feedlink_feeds_opened_total";
    /// Number of feeds currently held by the registry
    pub const REGISTERED: &str = "feedlink_feeds_registered";
    /// Total number of messages delivered by feed collections
    pub const MESSAGES_RECEIVED_TOTAL: &str = "feedlink_feed_messages_received_total";
    /// Total number of text messages sent to feeds
    pub const MESSAGES_SENT_TOTAL: &str = "feedlink_feed_messages_sent_total";
    /// Text sends rejected by the messaging client
    pub const SEND_FAILURES_TOTAL: &str = "feedlink_feed_send_failures_total";
}

/// Engine binding metrics
pub mod assistant {
    /// Number of active engine bindings
    pub const BINDINGS_ACTIVE: &str = "feedlink_assistant_bindings_active";
    /// Total number of commands forwarded to engines
    pub const COMMANDS_TOTAL: &str = "feedlink_assistant_commands_total";
    /// Commands whose handler returned an error
    pub const COMMAND_FAILURES_TOTAL: &str = "feedlink_assistant_command_failures_total";
    /// Bindings that failed to start
    pub const BINDING_START_FAILURES_TOTAL: &str =
        "feedlink_assistant_binding_start_failures_total";
}

/// Linking handshake metrics
pub mod link {
    /// Handshake phase-one starts
    pub const STARTS_TOTAL: &str = "feedlink_link_starts_total";
    /// Handshakes that completed and promoted the manager
    pub const COMPLETIONS_TOTAL: &str = "feedlink_link_completions_total";
    /// Handshake failures in either phase
    pub const FAILURES_TOTAL: &str = "feedlink_link_failures_total";
}
