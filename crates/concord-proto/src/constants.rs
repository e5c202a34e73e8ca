/// Concord protocol and system constants.

/// Node-to-node protocol version, checked when a session subscribes.
pub const CONCORD_PROTO_VER: u16 = 0x01;

/// Default listen port for peer sessions.
pub const CONCORD_LISTEN_PORT: u16 = 47624;

/// Size of the frame length header. The header value counts itself.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Smallest frame buffer the reader or writer starts with.
pub const FRAME_INITIAL_CAPACITY: usize = 32;

/// Cache names under this prefix carry mapping syncs rather than
/// application stale-cache payloads.
pub const MAPPING_CACHE_PREFIX: &str = "mapping/";

/// Separator between levels of a region path ("na/east/1").
pub const REGION_SEPARATOR: char = '/';

/// Virtual nodes per minister on the mastership ring.
pub const MASTER_RING_VNODES: u16 = 64;
