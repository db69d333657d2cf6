//! Row shape of the target table
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Columns of the target table, in insert order.
/// `message_id` is prepended by the sink and is not part of [Record].
pub const COLUMNS: [&str; 9] = [
    "full_name",
    "gender",
    "location",
    "city",
    "country",
    "postcode",
    "latitude",
    "longitude",
    "email",
];

/// Name of the key column used for idempotent inserts
pub const KEY_COLUMN: &str = "message_id";

/// Validated user profile, one row of the target table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub full_name: String,
    pub gender: String,
    pub location: String,
    pub city: String,
    pub country: String,
    pub postcode: i32,
    pub latitude: f32,
    pub longitude: f32,
    pub email: String,
}

/// Record together with the deterministic id of the message it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyedRecord {
    pub id: Uuid,
    pub partition: i32,
    pub offset: i64,
    pub record: Record,
}

/// Derives the row key from the message coordinates.
/// The same message always maps to the same id, so re-inserting it is a no-op.
pub fn record_id(topic: &str, partition: i32, offset: i64) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{topic}/{partition}/{offset}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_is_deterministic() {
        assert_eq!(record_id("names", 0, 42), record_id("names", 0, 42));
        assert_ne!(record_id("names", 0, 42), record_id("names", 1, 42));
        assert_ne!(record_id("names", 0, 42), record_id("names", 0, 43));
        assert_ne!(record_id("names", 0, 42), record_id("other", 0, 42));
    }
}
