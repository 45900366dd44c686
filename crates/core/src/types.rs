/// All primary keys are BIGSERIAL (or a process-local counter in memory).
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Hex SHA-256 of a segment's generation-relevant inputs.
pub type Fingerprint = String;

/// Opaque reference to an object held by the storage collaborator.
pub type OutputRef = String;
