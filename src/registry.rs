//! `DocumentRegistry`: in-memory document table backed by storage (spec
//! §4.8).

use crate::address::DocumentId;
use crate::crdt::CrdtDoc;
use crate::document::Document;
use crate::error::Result;
use crate::storage::{Storage, StorageProvider};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Events the registry emits.
pub enum RegistryEvent {
    DocumentAdded(DocumentId),
    DocumentUpdated(DocumentId),
    DocumentDestroyed(DocumentId),
}

/// Holds live documents by id, falling through to `Storage` on miss.
pub struct DocumentRegistry<D: CrdtDoc, H, C> {
    documents: RwLock<HashMap<DocumentId, Arc<Document<D>>>>,
    storage: Arc<Storage<H, C>>,
    on_event: Box<dyn Fn(RegistryEvent) + Send + Sync>,
}

impl<D, H, C> DocumentRegistry<D, H, C>
where
    D: CrdtDoc,
    H: StorageProvider + Clone + 'static,
    C: StorageProvider + Clone + 'static,
{
    pub fn new(storage: Arc<Storage<H, C>>, on_event: impl Fn(RegistryEvent) + Send + Sync + 'static) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            storage,
            on_event: Box::new(on_event),
        }
    }

    /// Idempotent: merges into an existing in-memory document, or stores a
    /// freshly-imported one (spec §4.8 `setDocument`).
    pub async fn set_document(&self, document: Arc<Document<D>>) -> Result<()>
    where
        D::Patch: Send,
    {
        let id = document.document_id();
        let existing = self.documents.read().get(&id).cloned();
        if let Some(existing) = existing {
            let header = document.header();
            document.with_crdt(|crdt| existing.merge_document(&header, crdt));
            (self.on_event)(RegistryEvent::DocumentUpdated(id));
        } else {
            self.documents.write().insert(id, document.clone());
            (self.on_event)(RegistryEvent::DocumentAdded(id));
        }
        Ok(())
    }

    /// Returns the in-memory document if present; otherwise loads header +
    /// binary from storage and adopts it (spec §4.8 `findDocument`).
    pub async fn find_document(
        &self,
        id: &DocumentId,
        on_event: impl Fn(crate::document::DocumentEvent<'_, D::Patch>) + Send + Sync + 'static,
    ) -> Result<Option<Arc<Document<D>>>> {
        if let Some(doc) = self.documents.read().get(id).cloned() {
            return Ok(Some(doc));
        }
        let Some(header_bytes) = self.storage.load_header(id).await? else {
            return Ok(None);
        };
        let content_bytes = self.storage.load_binary(id).await?.unwrap_or_default();
        let header = crate::header::DocumentHeader::import(&header_bytes)?;
        let mut crdt = D::init();
        crdt.load_incremental(&content_bytes);
        let document = Arc::new(adopt(header, crdt, on_event));
        self.documents.write().insert(*id, document.clone());
        Ok(Some(document))
    }

    /// Returns the header of an already in-memory document, without
    /// falling through to storage. Used to gate inbound signals (spec
    /// §4.6 "checks that the referenced document exists locally").
    pub fn cached_header(&self, id: &DocumentId) -> Option<crate::header::DocumentHeader> {
        self.documents.read().get(id).map(|doc| doc.header())
    }

    /// Destroys and removes the document, emitting `document-destroyed`
    /// (spec §4.8 `removeDocument`).
    pub fn remove_document(&self, id: &DocumentId) {
        if let Some(doc) = self.documents.write().remove(id) {
            doc.destroy();
            (self.on_event)(RegistryEvent::DocumentDestroyed(*id));
        }
    }

    /// Delegates to storage for the full set of known ids (spec §4.8
    /// `listDocumentIds`).
    pub async fn list_document_ids(&self) -> Result<Vec<DocumentId>> {
        self.storage.list().await
    }
}

fn adopt<D: CrdtDoc>(
    header: crate::header::DocumentHeader,
    crdt: D,
    on_event: impl Fn(crate::document::DocumentEvent<'_, D::Patch>) + Send + Sync + 'static,
) -> Document<D> {
    // `Document` has no constructor that takes a pre-built header/crdt pair
    // directly (only `create`/`import`); storage-adopted documents reuse
    // `import`'s signed-export path would require re-signing, which the
    // registry has no key for, so this constructs the same `Inner` shape
    // `import` would via the crate-visible helper below.
    Document::from_parts(header, crdt, on_event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::map::{MapCrdt, Value};
    use crate::crypto::Keypair;
    use crate::header::Metadata;
    use crate::storage::SledStorageProvider;

    #[async_std::test]
    async fn storage_round_trip_preserves_heads() {
        let headers = SledStorageProvider::memory().unwrap();
        let content = SledStorageProvider::memory().unwrap();
        let storage = Arc::new(Storage::new(headers, content, |_| {}));
        let owner = Keypair::generate();
        let doc = Document::<MapCrdt>::create(&owner, [], Metadata::new(), |_| {});
        doc.update(|crdt| {
            crdt.set("n", Value::Int(7));
        });

        struct Wrapped<'a>(&'a Document<MapCrdt>);
        impl<'a> crate::storage::StoredDocument for Wrapped<'a> {
            fn document_id(&self) -> DocumentId {
                self.0.document_id()
            }
            fn header_bytes(&self) -> Vec<u8> {
                self.0.header().export()
            }
            fn content_bytes(&self) -> Vec<u8> {
                self.0.with_crdt(|c| c.save())
            }
        }
        storage.set_document(&Wrapped(&doc)).await.unwrap();

        let registry = DocumentRegistry::<MapCrdt, _, _>::new(storage, |_| {});
        let found = registry
            .find_document(&doc.document_id(), |_| {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.heads(), doc.heads());
    }
}
