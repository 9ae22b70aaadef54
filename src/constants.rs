// Media Assistant Constants
// Defaults for every tunable. EngineConfig overrides most of them at runtime.

// Paths
pub const DATA_DIR_ENV: &str = "MEDIA_ASSISTANT_DATA_DIR";
pub const APP_DIR_NAME: &str = "media-assistant";
pub const DB_FOLDER: &str = "db";
pub const DB_FILENAME: &str = "media_assistant.db";
pub const CACHE_FOLDER: &str = "cache";
pub const LOGS_FOLDER: &str = "logs";
pub const CONFIG_FILENAME: &str = "config.json";

// Hashing
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB
pub const HASH_FAST_SCHEME: &str = "first_last_size_v1";
pub const HASH_FULL_READ_LIMIT: u64 = 256 * 1_048_576; // above this, sample instead of full read

// Media queue
pub const DEFAULT_WORKER_COUNT: usize = 16;
pub const DEFAULT_PARSE_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_MAX_PARSE_ATTEMPTS: i64 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_SUBMIT_CAPACITY: usize = 256;
pub const STORE_ERROR_BACKOFF_MS: u64 = 1_000;
pub const ORPHAN_SWEEP_LIMIT: usize = 200;

// Watcher
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const WATCH_RAW_CAPACITY: usize = 8_192;

// Scanner
pub const SCAN_REQUEST_CAPACITY: usize = 100;
pub const SCAN_PROGRESS_LOG_EVERY: u64 = 1_000;

// Event hub
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
pub const DEFAULT_EVENT_LOG_MAX_ROWS: i64 = 50_000;
pub const DEFAULT_EVENT_LOG_MAX_AGE_DAYS: i64 = 30;
pub const EVENT_LOG_RETENTION_EVERY: u64 = 1_000;
pub const EVENT_LOG_PAGE_MAX: i64 = 500;

// Bloom filter
pub const DEFAULT_BLOOM_FPR: f64 = 0.01;
pub const BLOOM_CAPACITY_FACTOR: usize = 10;
pub const BLOOM_MIN_CAPACITY: usize = 10_000;

// Database
pub const DB_BUSY_TIMEOUT_MS: u32 = 5_000;
pub const DB_POOL_EXTRA_CONNECTIONS: usize = 4;

// Thumbnail settings
pub const THUMB_MAX_EDGE: u32 = 300;
pub const VIDEO_THUMB_SEEK_SECS: &str = "0.5";

// Fallback parser
pub const FALLBACK_PARSER_NAME: &str = "dummy.fallback";

// Parser priorities used at bootstrap
pub const PRIORITY_NATIVE: i32 = 20;
pub const PRIORITY_EXTERNAL_TOOL: i32 = 15;
pub const PRIORITY_EXTERNAL_PARSER: i32 = 30;
pub const PRIORITY_FALLBACK: i32 = 0;

// Extension tables
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "mkv", "webm", "flv"];

pub const RAW_EXTENSIONS: [&str; 11] = [
    "cr2", "cr3", "nef", "arw", "dng", "raf", "orf", "rw2", "pef", "srw", "3fr",
];

pub const PSD_EXTENSIONS: [&str; 2] = ["psd", "psb"];

// Files that are never media assets
pub const IGNORED_FILE_EXTENSIONS: [&str; 24] = [
    "exe", "msi", "dll", "sys", "zip", "rar", "7z", "tar", "gz", "tmp", "log", "part", "bak",
    "iso", "dmg", "pkg", "ini", "db", "dat", "lock", "swp", "crdownload", "download", "partial",
];

pub const IGNORED_FILE_NAMES: [&str; 4] = ["thumbs.db", "desktop.ini", ".ds_store", "icon\r"];

pub const IGNORED_DIR_NAMES: [&str; 9] = [
    "node_modules", "target", "dist", "build", "$recycle.bin",
    "system volume information", "__macosx", "lost+found", "@eadir",
];
