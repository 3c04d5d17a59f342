/// Jobs are identified by a random UUID assigned at creation.
pub type JobId = uuid::Uuid;

/// Chat-side identifiers (user, chat, message) are plain integers.
pub type ChatRef = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
