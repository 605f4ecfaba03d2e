/// Periodic flush interval of the sync manager, in seconds
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;

/// Minimum spacing between two successful flush passes, in seconds
pub const DEFAULT_MIN_FLUSH_INTERVAL_SECS: u64 = 5;

/// Maximum number of events sent in one batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Delay before a follow-up flush when a batch left events behind, in milliseconds
pub const DEFAULT_FOLLOW_UP_DELAY_MS: u64 = 1_000;

/// Capacity of the in-memory notification broadcast channel
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Sync endpoint paths (relative to the API base URL)
pub const XP_SYNC_PATH: &str = "/api/xp/sync";
pub const QUEST_SYNC_PATH: &str = "/api/quests/sync";

/// File name of the indexed store inside the data directory
pub const INDEXED_STORE_FILE: &str = "outbox.db";

/// Directory name of the key-value fallback store inside the data directory
pub const KV_STORE_DIR: &str = "kv";
