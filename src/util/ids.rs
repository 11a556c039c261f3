//! Human-readable identifier generation for sessions and runs.

use rand::distr::Alphanumeric;
use rand::Rng;

const ID_SUFFIX_LEN: usize = 8;

/// Generator for short, prefixed, random identifiers.
///
/// Collision space is small by design; these ids are for humans reading
/// logs and store indexes. Checkpoint and request ids use UUIDs.
#[derive(Clone, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn suffix(&self) -> String {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(char::from)
            .collect::<String>()
            .to_lowercase()
    }

    #[must_use]
    pub fn generate_session_id(&self) -> String {
        format!("sess-{}", self.suffix())
    }

    #[must_use]
    pub fn generate_run_id(&self) -> String {
        format!("run-{}", self.suffix())
    }
}
