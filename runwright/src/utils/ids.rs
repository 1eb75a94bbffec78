//! Identifier generation.

use uuid::Uuid;

/// Generates a time-ordered identifier for runs, step runs and artifacts.
///
/// UUIDv7 keeps newest-first listings cheap for stores that sort by id.
#[must_use]
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Generates a random identifier for execution handles.
#[must_use]
pub fn random_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_v7() {
        assert_eq!(new_id().get_version_num(), 7);
    }

    #[test]
    fn test_random_id_is_v4() {
        assert_eq!(random_id().get_version_num(), 4);
    }
}
