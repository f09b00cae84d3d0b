//! Persistence seam.
//!
//! The server appends every accepted operation and saves a snapshot when a
//! session empties or ends. A snapshot supersedes the operations stored
//! before it.

use std::collections::HashMap;
use std::sync::Mutex;
use tandem_core::Operation;
use uuid::Uuid;

use crate::document::DocumentSnapshot;
use crate::error::CollabError;

/// Durable storage for documents.
pub trait Persistence: Send + Sync {
    fn append_operation(&self, document: Uuid, op: &Operation) -> Result<(), CollabError>;

    fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> Result<(), CollabError>;

    fn load_snapshot(&self, document: Uuid) -> Result<Option<DocumentSnapshot>, CollabError>;

    /// Operations appended since the last snapshot.
    fn operations(&self, document: Uuid) -> Result<Vec<Operation>, CollabError>;

    fn list_documents(&self) -> Result<Vec<Uuid>, CollabError>;
}

#[derive(Default)]
struct Tables {
    /// LZ4-compressed snapshots.
    snapshots: HashMap<Uuid, Vec<u8>>,
    ops: HashMap<Uuid, Vec<Operation>>,
}

/// In-process store. Snapshots are kept in their encoded form.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, CollabError> {
        self.tables
            .lock()
            .map_err(|_| CollabError::Storage("store mutex poisoned".into()))
    }
}

impl Persistence for MemoryStore {
    fn append_operation(&self, document: Uuid, op: &Operation) -> Result<(), CollabError> {
        self.tables()?.ops.entry(document).or_default().push(op.clone());
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> Result<(), CollabError> {
        let bytes = snapshot.encode()?;
        let mut tables = self.tables()?;
        log::debug!("Saving snapshot of {} ({} bytes)", snapshot.id, bytes.len());
        tables.snapshots.insert(snapshot.id, bytes);
        tables.ops.remove(&snapshot.id);
        Ok(())
    }

    fn load_snapshot(&self, document: Uuid) -> Result<Option<DocumentSnapshot>, CollabError> {
        let tables = self.tables()?;
        tables
            .snapshots
            .get(&document)
            .map(|bytes| DocumentSnapshot::decode(bytes))
            .transpose()
    }

    fn operations(&self, document: Uuid) -> Result<Vec<Operation>, CollabError> {
        Ok(self.tables()?.ops.get(&document).cloned().unwrap_or_default())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, CollabError> {
        let tables = self.tables()?;
        let mut ids: Vec<Uuid> = tables.snapshots.keys().chain(tables.ops.keys()).copied().collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentKind, Edit, SharedDocument};
    use tandem_core::SiteId;

    fn doc() -> SharedDocument {
        SharedDocument::with_content(Uuid::new_v4(), "notes", DocumentKind::Text, SiteId::from_u128(1), "hello")
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = MemoryStore::new();
        let doc = doc();
        store.save_snapshot(&doc.snapshot()).unwrap();
        let loaded = store.load_snapshot(doc.id()).unwrap().unwrap();
        assert_eq!(loaded.render(), "hello");
        assert!(store.load_snapshot(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_supersedes_ops() {
        let store = MemoryStore::new();
        let mut doc = doc();
        for applied in doc.apply_local(Uuid::nil(), Edit::insert(5, "!")).unwrap() {
            store.append_operation(doc.id(), &applied.op).unwrap();
        }
        assert_eq!(store.operations(doc.id()).unwrap().len(), 1);
        assert_eq!(store.list_documents().unwrap(), vec![doc.id()]);

        store.save_snapshot(&doc.snapshot()).unwrap();
        assert!(store.operations(doc.id()).unwrap().is_empty());
        assert_eq!(store.load_snapshot(doc.id()).unwrap().unwrap().render(), "hello!");
    }
}
