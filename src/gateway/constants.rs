/// Gateway API version requested in the connection URL.
pub const GATEWAY_VERSION: u8 = 10;

/// Used when neither configuration nor REST discovery yields a URL.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Time (ms) the write task gets to flush a close frame before it is aborted.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Bounds (ms) of the random wait before identifying after INVALID_SESSION.
pub const INVALID_SESSION_DELAY_MS: (u64, u64) = (1_000, 5_000);

/// Client close code that keeps the session resumable.
pub const CLOSE_CODE_RESUMABLE: u16 = 4000;

/// Normal closure; the server discards the session.
pub const CLOSE_CODE_NORMAL: u16 = 1000;
