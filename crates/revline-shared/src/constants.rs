/// Prefix of locally generated placeholder message ids
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Staleness window (seconds) of `last_seen_at` still counted as online
pub const DEFAULT_ONLINE_THRESHOLD_SECS: u32 = 45;

/// Presence heartbeat period in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Delay before the post-send thread reconciliation refetch (millis)
pub const RECONCILE_DELAY_MS: u64 = 1_000;

/// Minimum spacing between bulk recovery refreshes in seconds
pub const REFRESH_COOLDOWN_SECS: u64 = 5;

/// Messages fetched per thread refetch
pub const THREAD_PAGE_SIZE: u32 = 200;

/// Lifetime of signed image URLs in seconds
pub const SIGNED_URL_TTL_SECS: u64 = 3_600;

/// Storage bucket holding chat images
pub const IMAGE_BUCKET: &str = "chat-uploads";

/// Default MIME type for chat images
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Conversation summary text stored for image messages
pub const IMAGE_SUMMARY_TEXT: &str = "[image]";

/// Realtime topic names
pub const INBOX_TOPIC: &str = "inbox-live";
pub const PRESENCE_TOPIC: &str = "presence-users";

/// Sender name used when a profile lookup fails
pub const FALLBACK_USERNAME: &str = "user";
