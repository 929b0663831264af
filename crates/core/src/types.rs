/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Zero-based position of a scene within a batch.
pub type SceneIndex = usize;

/// Number of bytes in one mebibyte.
pub const BYTES_PER_MB: u64 = 1024 * 1024;
