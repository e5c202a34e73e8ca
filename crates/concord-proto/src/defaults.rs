//! Tunable operational defaults for concord nodes.
//!
//! Protocol-level constants (wire format, versions) remain in
//! [`crate::constants`]. This module centralizes the defaults that a
//! `NodeConfig` or CLI flag can override.

// ─── Peer Lifecycle ─────────────────────────────────────────────────────────

/// A peer whose record has not been updated for this long is considered
/// down. Also gates reconnect attempts (seconds).
pub const DEFAULT_STALE_INTERVAL_SECS: u64 = 5 * 60;

/// Interval between peer refreshes: heartbeat our record, reload the
/// others, reconnect where allowed (seconds).
pub const DEFAULT_PEER_REFRESH_INTERVAL_SECS: u64 = 60;

// ─── Lock Arbitration ───────────────────────────────────────────────────────

/// How long an acquiring or releasing node waits for ratifications before
/// acting anyway (milliseconds).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

// ─── Mappings ───────────────────────────────────────────────────────────────

/// Period of the mapping flusher that pushes batched updates (milliseconds).
pub const DEFAULT_MAPPING_FLUSH_INTERVAL_MS: u64 = 250;

/// Number of nodes eligible to master remote mappings.
pub const DEFAULT_MINISTER_COUNT: usize = 1;

// ─── Transport ──────────────────────────────────────────────────────────────

/// Maximum size of a single frame, header included (bytes). 512 KB.
/// Protects against corrupt length headers on the wire.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;

/// Bytes requested from the socket per read when the frame buffer is
/// otherwise full.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Channel buffer size for the per-connection write queue.
pub const DEFAULT_PEER_WRITE_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for the node command queue.
pub const DEFAULT_NODE_COMMAND_CHANNEL_SIZE: usize = 1024;

/// Capacity of the dropped-lock notification channel.
pub const DEFAULT_DROPPED_LOCK_CHANNEL_SIZE: usize = 64;

/// Capacity of each stale-cache observer channel.
pub const DEFAULT_STALE_CACHE_CHANNEL_SIZE: usize = 64;
