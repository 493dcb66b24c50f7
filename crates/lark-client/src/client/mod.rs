// Connection runtime modules.
pub(crate) mod connection;
pub(crate) mod reader;
pub(crate) mod reconnect;
pub(crate) mod subscriptions;
pub(crate) mod write_queue;
pub(crate) mod writer;
