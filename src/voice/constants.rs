/// Voice gateway version requested in the connection URL.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// Audio sample rate (48 kHz).
pub const SAMPLE_RATE: u32 = 48_000;

pub const CHANNELS: usize = 2;

/// Samples per channel in one 20 ms frame.
pub const FRAME_SAMPLES: usize = 960;

/// Interleaved samples in one 20 ms stereo frame.
pub const PCM_FRAME_LEN: usize = FRAME_SAMPLES * CHANNELS;

pub const FRAME_DURATION_MS: u64 = 20;

/// Largest decoded frame (120 ms) in interleaved samples.
pub const MAX_DECODED_LEN: usize = 5_760 * CHANNELS;

pub const MAX_OPUS_FRAME_SIZE: usize = 4_000;

/// Opus frame the server treats as silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Silence frames sent after audio stops, before speaking is cleared.
pub const SILENCE_FRAME_COUNT: usize = 5;

/// Falling further behind than this many frames resets the pacing clock.
pub const MAX_PACING_LAG_FRAMES: u32 = 5;

pub const RTP_VERSION_BYTE: u8 = 0x80;
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 0x78;
pub const RTP_HEADER_LEN: usize = 12;
pub const RTP_TIMESTAMP_STEP: u32 = FRAME_SAMPLES as u32;

/// Lost frames concealed before a gap is treated as a resync.
pub const MAX_CONCEALED_FRAMES: u16 = 5;

/// Backward jumps larger than this are a restarted sender, not a stale packet.
pub const RESYNC_BACKWARD_THRESHOLD: u16 = 100;

pub const UDP_PACKET_BUF_CAPACITY: usize = 1_460;
pub const DISCOVERY_PACKET_SIZE: usize = 74;
pub const IP_DISCOVERY_TIMEOUT_SECS: u64 = 5;

pub const DAVE_INITIAL_VERSION: u16 = 1;
pub const MAX_PENDING_PROPOSALS: usize = 64;

/// Reconnect policy of a single voice websocket.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_MAX_MS: u64 = 8_000;

/// Delay before a fresh IDENTIFY after a session-invalid close.
pub const RECONNECT_DELAY_FRESH_MS: u64 = 500;

pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Fallback when HELLO omits the interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 13_750;
