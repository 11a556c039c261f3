//! Runtime execution aliases, kept separate from the core domain types.

/// Identifier of a checkpoint session; opaque, unique within a store.
pub type SessionId = String;

/// Superstep counter, indexed from 0.
pub type StepNumber = u64;
