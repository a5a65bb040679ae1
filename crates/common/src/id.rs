//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for entities.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// ULIDs are:
    /// - Lexicographically sortable by creation millisecond
    /// - Shorter than UUIDs when represented as strings
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate an opaque worker identity for queue leases.
    #[must_use]
    pub fn generate_worker_id(&self) -> String {
        format!("worker-{}", Uuid::now_v7().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_eq!(id2.len(), 26);
        assert_ne!(id1, id2);
        // Note: ULIDs generated rapidly within the same millisecond
        // may not be strictly ordered due to the random component
    }

    #[test]
    fn test_generate_worker_id() {
        let id_gen = IdGenerator::new();
        let worker = id_gen.generate_worker_id();

        assert!(worker.starts_with("worker-"));
        assert_eq!(worker.len(), "worker-".len() + 32);
        assert_ne!(worker, id_gen.generate_worker_id());
    }
}
