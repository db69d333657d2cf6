//! Reshaping of validated records before they reach the sink
use crate::record::Record;

/// Maps a decoded record to the row written to the table.
/// Implementations are pure: no I/O, no state.
pub trait Transform {
    fn apply(&self, record: Record) -> Record;
}

/// Passes records through untouched; the schema already matches the table
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(&self, record: Record) -> Record {
        record
    }
}

pub fn transform(record: Record) -> Record {
    Identity.apply(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keeps_record() {
        let r = Record {
            full_name: "Jane Doe".into(),
            gender: "F".into(),
            location: "X".into(),
            city: "Y".into(),
            country: "Z".into(),
            postcode: 12345,
            latitude: 10.5,
            longitude: 20.5,
            email: "j@x.com".into(),
        };
        assert_eq!(transform(r.clone()), r);
    }
}
