//! Process-wide backend descriptor snapshot.
//!
//! Runs read an immutable `Arc<BackendTable>` captured at start; `publish`
//! swaps in a new table without disturbing runs already in flight.

use parking_lot::RwLock;
use std::sync::Arc;

use quill_core::{BackendTable, ConfigurationError};

#[derive(Debug)]
pub struct DescriptorRegistry {
    current: RwLock<Arc<BackendTable>>,
}

impl DescriptorRegistry {
    pub fn new(table: BackendTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// The table as of now.
    pub fn snapshot(&self) -> Arc<BackendTable> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Install `table`, assigning it the next version number.
    pub fn publish(&self, mut table: BackendTable) -> Result<u64, ConfigurationError> {
        table.validate()?;
        let mut current = self.current.write();
        table.version = current.version + 1;
        let version = table.version;
        *current = Arc::new(table);
        tracing::info!(version, backends = current.len(), "Published backend descriptor table");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_publish() {
        let registry = DescriptorRegistry::new(BackendTable::builtin().unwrap());
        let before = registry.snapshot();
        let start = registry.version();

        let smaller = BackendTable::from_yaml(
            r#"
backends:
  - id: gemini-flash
    capability_tags: [short-form]
    default_temperature: 0.7
    max_output_tokens: 1500
    cost_class: economy
"#,
        )
        .unwrap();

        let version = registry.publish(smaller).unwrap();
        assert_eq!(version, start + 1);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(before.len(), 4);
        assert_eq!(before.version, start);
    }
}
