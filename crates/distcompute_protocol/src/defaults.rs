//! Canonical default values shared across the coordinator and worker.

use std::time::Duration;

/// Default TCP port the coordinator listens on.
pub const DEFAULT_COORDINATOR_PORT: u16 = 5555;

/// Maximum body size carried by a single framed unit before it must be
/// split into `CHUNK_START`/`CHUNK_DATA`/`CHUNK_END`.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Bodies larger than this are compressed (flag bit 0 set) unless the
/// caller forces compression on or off.
pub const COMPRESSION_THRESHOLD: usize = 512 * 1024;

/// Moderate deflate-family compression level (matches the Python
/// prototype's `zlib.compress(data, level=6)`).
pub const COMPRESSION_LEVEL: u32 = 6;

/// Default interval between worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default liveness window: how long the coordinator tolerates a gap
/// between heartbeats before declaring a worker dead. 3x the heartbeat
/// interval, as specified.
pub const DEFAULT_LIVENESS_MULTIPLIER: u32 = 3;

/// How often the heartbeat sweeper scans the worker table.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
