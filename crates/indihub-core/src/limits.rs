//! Protocol size limits and tuning constants shared across the agent.

/// Largest single read taken from a local INDI-server or PHD2 socket.
pub const MAX_LOCAL_READ: usize = 49152;

/// Upper bound on a single command written to the local INDI-server.
pub const MAX_LOCAL_WRITE: usize = 2048;

/// Largest message accepted from or offered to the cloud relay.
pub const RELAY_MAX_FRAME: usize = 10 * 1024 * 1024;

/// Capacity of the queue between local readers and the tunnel sender.
/// Once full, readers block and TCP flow control reaches the INDI-server.
pub const RESPONSE_QUEUE_SIZE: usize = 4096;

/// How long stopped sockets get to drain before a mode starts again.
pub const MODE_SETTLE: std::time::Duration = std::time::Duration::from_secs(1);

/// Pause after a failed local reconnect before the next attempt.
pub const RECONNECT_PAUSE: std::time::Duration = std::time::Duration::from_secs(1);
