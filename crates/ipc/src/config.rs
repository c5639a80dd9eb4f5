//! Compile-time defaults of the runtime.
//!
//! The core takes no CLI flags, environment variables or config files; the
//! surrounding daemon supplies its own knobs and passes explicit values where
//! the API allows it.

use std::time::Duration;

/// Maximum number of simultaneously connected peers per processor.
pub const DEFAULT_MAX_NUMBER_OF_PEERS: usize = 500;

/// How long a synchronous call waits for the reply before giving up.
pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_millis(5000);

/// Backlog passed to `listen(2)` on the accepting socket.
pub const ACCEPT_BACKLOG: usize = 1000;

/// Pause between connection attempts while the listener is not up yet.
pub const CONNECT_RETRY_STEP: Duration = Duration::from_millis(10);

/// How long a client keeps retrying to connect by default.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
