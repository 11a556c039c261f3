//! Type registry mapping [`TypeId`]s to registered message types.
//!
//! The registry is the portability anchor for checkpoints: every payload that
//! crosses a step boundary carries a `TypeId`, and restoration validates that
//! each referenced id is still registered before a run is allowed to restart.
//!
//! A process-global registry is available via [`TypeRegistry::global`]. It is
//! sealed when the first runner is constructed; registrations after sealing
//! are rejected. Tests and embedded workflows can use a scoped registry
//! instead ([`TypeRegistry::new`]), which never seals implicitly.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

use crate::types::TypeId;

/// Metadata recorded for a registered type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeEntry {
    /// Optional supertype, used by routers for base-type dispatch fallback.
    pub supertype: Option<TypeId>,
}

/// Errors raised by registry operations.
#[derive(Debug, Error, miette::Diagnostic)]
pub enum RegistryError {
    /// The registry has been sealed; no further registrations are accepted.
    #[error("type registry is sealed; cannot register `{type_id}`")]
    #[diagnostic(
        code(relaygraph::registry::sealed),
        help("Register all message types before constructing a runner, or use a scoped registry.")
    )]
    Sealed { type_id: TypeId },

    /// A type was re-registered with conflicting metadata.
    #[error("type `{type_id}` is already registered with a different supertype")]
    #[diagnostic(code(relaygraph::registry::conflict))]
    Conflict { type_id: TypeId },

    /// A declared supertype has not been registered.
    #[error("supertype `{supertype}` of `{type_id}` is not registered")]
    #[diagnostic(
        code(relaygraph::registry::unknown_supertype),
        help("Register the supertype first; chains are validated at registration time.")
    )]
    UnknownSupertype { type_id: TypeId, supertype: TypeId },

    /// A checkpoint references a type this process does not know.
    #[error("checkpoint references unregistered type `{type_id}`")]
    #[diagnostic(
        code(relaygraph::registry::fingerprint),
        help("The restoring process must register every type the captured run used.")
    )]
    UnknownType { type_id: TypeId },
}

/// Registry of message types, keyed by stable [`TypeId`].
///
/// Registration is idempotent per `(id, supertype)` pair and immutable per
/// type once registered: re-registering with the same supertype is a no-op,
/// re-registering with a different one is a [`RegistryError::Conflict`].
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entries: RwLock<FxHashMap<TypeId, TypeEntry>>,
    sealed: AtomicBool,
}

static GLOBAL: OnceLock<std::sync::Arc<TypeRegistry>> = OnceLock::new();

impl TypeRegistry {
    /// Create a scoped registry, isolated from the process-global one.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the process-global registry.
    pub fn global() -> std::sync::Arc<TypeRegistry> {
        std::sync::Arc::clone(GLOBAL.get_or_init(|| std::sync::Arc::new(TypeRegistry::default())))
    }

    /// Register a root type (no supertype).
    pub fn register(&self, id: impl Into<TypeId>) -> Result<TypeId, RegistryError> {
        self.insert(id.into(), None)
    }

    /// Register a type with a supertype for base-type dispatch.
    ///
    /// The supertype must already be registered so that chains are acyclic by
    /// construction.
    pub fn register_with_supertype(
        &self,
        id: impl Into<TypeId>,
        supertype: impl Into<TypeId>,
    ) -> Result<TypeId, RegistryError> {
        self.insert(id.into(), Some(supertype.into()))
    }

    fn insert(&self, id: TypeId, supertype: Option<TypeId>) -> Result<TypeId, RegistryError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(RegistryError::Sealed { type_id: id });
        }
        let mut entries = self.entries.write();
        if let Some(st) = &supertype {
            if !entries.contains_key(st) {
                return Err(RegistryError::UnknownSupertype {
                    type_id: id,
                    supertype: st.clone(),
                });
            }
        }
        match entries.get(&id) {
            Some(existing) if existing.supertype == supertype => Ok(id),
            Some(_) => Err(RegistryError::Conflict { type_id: id }),
            None => {
                entries.insert(id.clone(), TypeEntry { supertype });
                Ok(id)
            }
        }
    }

    /// Whether a type id is registered.
    #[must_use]
    pub fn contains(&self, id: &TypeId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// The registered supertype of `id`, if any.
    #[must_use]
    pub fn supertype_of(&self, id: &TypeId) -> Option<TypeId> {
        self.entries.read().get(id).and_then(|e| e.supertype.clone())
    }

    /// Walk the supertype chain of `id`, excluding `id` itself.
    ///
    /// The walk is bounded by the registry size, so a (theoretically
    /// impossible) cycle cannot spin forever.
    #[must_use]
    pub fn supertype_chain(&self, id: &TypeId) -> Vec<TypeId> {
        let entries = self.entries.read();
        let mut chain = Vec::new();
        let mut cursor = entries.get(id).and_then(|e| e.supertype.clone());
        while let Some(next) = cursor {
            if chain.len() >= entries.len() {
                break;
            }
            cursor = entries.get(&next).and_then(|e| e.supertype.clone());
            chain.push(next);
        }
        chain
    }

    /// Seal the registry against further registrations.
    ///
    /// Called on the global registry when the first runner is constructed.
    /// Scoped registries are never sealed implicitly.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Validate that every id in a checkpoint fingerprint is registered.
    pub fn validate_fingerprint(&self, ids: &[TypeId]) -> Result<(), RegistryError> {
        let entries = self.entries.read();
        for id in ids {
            if !entries.contains_key(id) {
                return Err(RegistryError::UnknownType {
                    type_id: id.clone(),
                });
            }
        }
        Ok(())
    }
}
