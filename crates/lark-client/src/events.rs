// Connection lifecycle notifications delivered to the status listener.

/// Events observed by the status listener, delivered sequentially per
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnected,
    Reconnected,
    Resubscribed,
    DiscoveredServers,
    LameDuck,
    Closed,
}

/// Observable connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}
