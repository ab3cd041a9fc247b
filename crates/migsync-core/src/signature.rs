//! Keyed signatures for migration scripts and rollback records.
//!
//! Every script persisted by a handler is signed with a shared validation
//! key so that tampered rollback data is detected before it is executed.

use sha2::{Digest, Sha256};

use crate::handler::RollbackRecord;

/// Computes and verifies keyed digests over migration content.
///
/// Content is trimmed of surrounding whitespace before hashing, so
/// leading/trailing whitespace never changes a digest.
#[derive(Debug, Clone)]
pub struct Signer {
    key: String,
}

impl Signer {
    /// Create a signer bound to a validation key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Sign a single script body.
    pub fn sign(&self, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(content.trim().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify a digest produced by [`Signer::sign`].
    pub fn verify(&self, content: &str, digest: &str) -> bool {
        self.sign(content) == digest
    }

    /// Sign the fields of a stored rollback record.
    ///
    /// The digest covers the ordered concatenation of the migration name,
    /// step index, step kind, serialized arguments (absent arguments
    /// contribute nothing), and the trimmed script body.
    pub fn sign_stored(
        &self,
        migration: &str,
        step: u32,
        kind: &str,
        args: Option<&str>,
        code: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(migration.as_bytes());
        hasher.update(step.to_string().as_bytes());
        hasher.update(kind.as_bytes());
        hasher.update(args.unwrap_or("").as_bytes());
        hasher.update(code.trim().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify the fields of a stored rollback record against a digest.
    pub fn verify_stored(
        &self,
        migration: &str,
        step: u32,
        kind: &str,
        args: Option<&str>,
        code: &str,
        digest: &str,
    ) -> bool {
        self.sign_stored(migration, step, kind, args, code) == digest
    }

    /// Sign a rollback record, returning the digest to store alongside it.
    pub fn sign_record(&self, record: &RollbackRecord) -> String {
        self.sign_stored(
            &record.migration,
            record.step,
            &record.kind,
            record.args.as_deref(),
            &record.code,
        )
    }

    /// Verify a rollback record against its embedded signature.
    pub fn verify_record(&self, record: &RollbackRecord) -> bool {
        self.sign_record(record) == record.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signer = Signer::new("secret");
        let digest = signer.sign("CREATE TABLE users (id INTEGER)");
        assert!(signer.verify("CREATE TABLE users (id INTEGER)", &digest));
    }

    #[test]
    fn test_verify_rejects_changed_content() {
        let signer = Signer::new("secret");
        let digest = signer.sign("DROP TABLE users");
        assert!(!signer.verify("DROP TABLE user", &digest));
    }

    #[test]
    fn test_verify_rejects_changed_digest() {
        let signer = Signer::new("secret");
        let mut digest = signer.sign("DROP TABLE users");
        let flipped = if digest.ends_with('0') { "1" } else { "0" };
        digest.truncate(digest.len() - 1);
        digest.push_str(flipped);
        assert!(!signer.verify("DROP TABLE users", &digest));
    }

    #[test]
    fn test_surrounding_whitespace_ignored() {
        let signer = Signer::new("secret");
        let digest = signer.sign("SELECT 1");
        assert!(signer.verify("  SELECT 1\n\n", &digest));
    }

    #[test]
    fn test_key_changes_digest() {
        let a = Signer::new("alpha");
        let b = Signer::new("beta");
        assert_ne!(a.sign("SELECT 1"), b.sign("SELECT 1"));
    }

    #[test]
    fn test_stored_record_signature_covers_all_fields() {
        let signer = Signer::new("secret");
        let digest = signer.sign_stored("app:001", 2, "sql", Some("[\"t\"]"), "DROP TABLE t");
        assert!(signer.verify_stored("app:001", 2, "sql", Some("[\"t\"]"), "DROP TABLE t", &digest));
        assert!(!signer.verify_stored("app:001", 3, "sql", Some("[\"t\"]"), "DROP TABLE t", &digest));
        assert!(!signer.verify_stored("app:001", 2, "sql", None, "DROP TABLE t", &digest));
        assert!(!signer.verify_stored("app:001", 2, "sql", Some("[\"t\"]"), "DROP TABLE u", &digest));
    }

    #[test]
    fn test_record_roundtrip() {
        let signer = Signer::new("secret");
        let mut record = RollbackRecord {
            migration: "app:001".to_string(),
            step: 1,
            kind: "sql".to_string(),
            args: None,
            code: "DROP TABLE t".to_string(),
            signature: String::new(),
        };
        record.signature = signer.sign_record(&record);
        assert!(signer.verify_record(&record));
        record.code.push('x');
        assert!(!signer.verify_record(&record));
    }
}
