//! `Document`: pairs a `DocumentHeader` with an opaque CRDT doc (spec §3,
//! §4.2).

use crate::address::DocumentId;
use crate::crdt::CrdtDoc;
use crate::crypto::Keypair;
use crate::error::{Error, Result};
use crate::header::{sign_authorized, DocumentHeader, Metadata};
use parking_lot::RwLock;
use std::convert::TryInto;
use std::time::Instant;

/// Events a `Document` fires. Fire-and-forget: handler errors must not
/// mutate the document (spec §4.2).
pub enum DocumentEvent<'a, P> {
    Change,
    Patch(&'a [P]),
    HeaderUpdated,
    Destroyed,
}

/// The signed export payload (spec §6): `{header, content, signature}`.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SignedExport {
    pub header: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

struct Inner<D> {
    header: DocumentHeader,
    crdt: D,
    destroyed: bool,
    last_accessed: Instant,
}

/// Wraps a CRDT doc keyed by a header. A `Document` exclusively owns its
/// CRDT state and header (spec §3 ownership rules); the registry shares it
/// by reference-counted handle.
pub struct Document<D: CrdtDoc> {
    state: RwLock<Inner<D>>,
    on_event: Box<dyn Fn(DocumentEvent<'_, D::Patch>) + Send + Sync>,
}

impl<D: CrdtDoc> Document<D> {
    pub fn create(
        private_key: &Keypair,
        allowed_users: impl IntoIterator<Item = crate::crypto::PublicKey>,
        metadata: Metadata,
        on_event: impl Fn(DocumentEvent<'_, D::Patch>) + Send + Sync + 'static,
    ) -> Self {
        let header = DocumentHeader::create(private_key, allowed_users, metadata);
        Self {
            state: RwLock::new(Inner {
                header,
                crdt: D::init(),
                destroyed: false,
                last_accessed: Instant::now(),
            }),
            on_event: Box::new(on_event),
        }
    }

    /// Decodes `{header, content, signature}`, verifies the header and the
    /// content signature, and loads the CRDT state (spec §4.2 `import`).
    pub fn import(
        bytes: &[u8],
        on_event: impl Fn(DocumentEvent<'_, D::Patch>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let export: SignedExport =
            crate::codec::from_canonical(bytes).map_err(|_| Error::InvalidHeader)?;
        let header = DocumentHeader::import(&export.header)?;
        let signature = crate::crypto::Signature::from_bytes(
            export
                .signature
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidHeader)?,
        );
        if !header.verify_signature(&export.content, &signature) {
            return Err(Error::InvalidHeader);
        }
        let mut crdt = D::init();
        crdt.load_incremental(&export.content);
        Ok(Self {
            state: RwLock::new(Inner {
                header,
                crdt,
                destroyed: false,
                last_accessed: Instant::now(),
            }),
            on_event: Box::new(on_event),
        })
    }

    /// Builds a `Document` around an already-verified header and CRDT doc,
    /// skipping signature re-verification. Used by the registry when
    /// adopting a document loaded from storage, where the header was
    /// already verified once at `set_document` time.
    pub fn from_parts(
        header: DocumentHeader,
        crdt: D,
        on_event: impl Fn(DocumentEvent<'_, D::Patch>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: RwLock::new(Inner {
                header,
                crdt,
                destroyed: false,
                last_accessed: Instant::now(),
            }),
            on_event: Box::new(on_event),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.state.read().header.document_id()
    }

    pub fn header(&self) -> DocumentHeader {
        self.touch();
        self.state.read().header.clone()
    }

    pub fn heads(&self) -> D::Heads {
        self.touch();
        self.state.read().crdt.get_heads()
    }

    pub fn last_accessed(&self) -> Instant {
        self.state.read().last_accessed
    }

    fn touch(&self) {
        self.state.write().last_accessed = Instant::now();
    }

    /// Runs `f` on the current CRDT doc; emits `change` if heads differ
    /// from before, always emits `patch` (spec §4.2 `update`). A no-op
    /// after `destroy()`.
    pub fn update(&self, f: impl FnOnce(&mut D)) {
        let mut state = self.state.write();
        if state.destroyed {
            return;
        }
        let before = state.crdt.get_heads();
        let patches = state.crdt.change(f);
        let after = state.crdt.get_heads();
        state.last_accessed = Instant::now();
        drop(state);
        if before != after {
            (self.on_event)(DocumentEvent::Change);
        }
        (self.on_event)(DocumentEvent::Patch(&patches));
    }

    /// Convenience alias over `update` (spec §4.2 `change`).
    pub fn change(&self, f: impl FnOnce(&mut D)) {
        self.update(f);
    }

    /// Same as `update`, but rooted at a historical `heads` set instead of
    /// the live state (spec §4.2 `changeAt`). Emits the same
    /// `change`/`patch` events `update` does.
    pub fn change_at(&self, heads: &D::Heads, f: impl FnOnce(&mut D)) {
        let mut state = self.state.write();
        if state.destroyed {
            return;
        }
        let before = state.crdt.get_heads();
        let patches = state.crdt.change_at(heads, f);
        let after = state.crdt.get_heads();
        state.last_accessed = Instant::now();
        drop(state);
        if before != after {
            (self.on_event)(DocumentEvent::Change);
        }
        (self.on_event)(DocumentEvent::Patch(&patches));
    }

    /// Produces `{header, content, signature}`, failing `Unauthorized`
    /// unless `private_key` is an allowed user (spec §4.2 `export`,
    /// testable property 3).
    pub fn export(&self, private_key: &Keypair) -> Result<Vec<u8>> {
        self.touch();
        let state = self.state.read();
        let content = state.crdt.save();
        let header_bytes = state.header.export();
        let signature = sign_authorized(&state.header, private_key, &content)?;
        let export = SignedExport {
            header: header_bytes,
            content,
            signature: signature.as_bytes().to_vec(),
        };
        crate::codec::to_canonical(&export).map_err(|e| Error::StorageFailure(e.into()))
    }

    /// Attempts `DocumentHeader::upgrade`; emits `header-updated` on
    /// success (spec §4.2 `updateHeader`).
    pub fn update_header(&self, new: DocumentHeader) -> bool {
        let mut state = self.state.write();
        if state.destroyed {
            return false;
        }
        match DocumentHeader::upgrade(&state.header, new) {
            Ok(upgraded) => {
                state.header = upgraded;
                drop(state);
                (self.on_event)(DocumentEvent::HeaderUpdated);
                true
            }
            Err(_) => false,
        }
    }

    /// Merges `other`'s CRDT state in, if the header upgrade accepts (or
    /// headers are already equal) — spec §4.2 `mergeDocument`.
    pub fn merge_document(&self, other_header: &DocumentHeader, other_crdt: &D) {
        let mut state = self.state.write();
        if state.destroyed {
            return;
        }
        let accepted = *other_header == state.header
            || DocumentHeader::upgrade(&state.header, other_header.clone())
                .map(|h| {
                    state.header = h;
                    true
                })
                .unwrap_or(false);
        if accepted {
            state.crdt.merge(other_crdt);
            state.last_accessed = Instant::now();
        }
    }

    /// Sets the destroyed flag and emits `destroyed`; subsequent mutating
    /// operations are no-ops (spec §4.2 `destroy`).
    pub fn destroy(&self) {
        let mut state = self.state.write();
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        drop(state);
        (self.on_event)(DocumentEvent::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.read().destroyed
    }

    /// Replaces the event callback after construction. Lets a caller that
    /// only learns a document's id from decoding it (e.g. `Document::import`)
    /// wire in an id-keyed hook afterward, rather than needing the id before
    /// the document exists.
    pub fn set_on_event(&mut self, on_event: impl Fn(DocumentEvent<'_, D::Patch>) + Send + Sync + 'static) {
        self.on_event = Box::new(on_event);
    }

    /// Emits `change`/`patch` for a mutation applied outside `update`/
    /// `change_at` (spec §4.7: the synchronizer "applies any change set via
    /// `update`" after an inbound sync message). `before` is the heads
    /// captured prior to applying `patches`.
    pub fn notify_patches(&self, before: D::Heads, patches: Vec<D::Patch>) {
        if self.is_destroyed() {
            return;
        }
        let after = self.heads();
        if before != after {
            (self.on_event)(DocumentEvent::Change);
        }
        (self.on_event)(DocumentEvent::Patch(&patches));
    }

    /// Runs `f` with read access to the CRDT doc, for synchronizer/storage
    /// code that needs to call `save`/`generate_sync_message` without going
    /// through `update`.
    pub fn with_crdt<R>(&self, f: impl FnOnce(&D) -> R) -> R {
        self.touch();
        f(&self.state.read().crdt)
    }

    pub fn with_crdt_mut<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.touch();
        f(&mut self.state.write().crdt)
    }
}
