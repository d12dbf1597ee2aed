//! Mechanism configuration.
//!
//! [`MechanismConfig`] is plain serde data so hosts can load it from whatever
//! format they already use. Missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};

use crate::engine::error::{ApparatusError, ApparatusResult};
use crate::engine::storage::DEFAULT_PAGE_BYTES;
use crate::engine::types::{PLACES_PER_MECHANISM_MAX, PLACES_PER_MECHANISM_MIN};


/// What a deferred entry does when its target subject vanished before the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingTargetPolicy {
    /// The entry becomes a `Noop`.
    #[default]
    Ignore,
    /// The entry fails with `Missing` and a warning is logged.
    Report,
}

/// Tunables of a single mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanismConfig {
    /// Rows preallocated in every column of a new chunk.
    pub chunk_initial_capacity: usize,
    /// Target size of one storage page in bytes.
    pub page_bytes: usize,
    /// Maximum number of subject slots.
    pub max_subjects: usize,
    /// Worker cap for concurrent operation; `0` uses the rayon pool size.
    pub max_threads: usize,
    /// Smallest row range handed to one worker.
    pub min_rows_per_thread: usize,
    /// Handling of deferred entries whose target is gone.
    pub missing_target_policy: MissingTargetPolicy,
}

impl Default for MechanismConfig {
    fn default() -> Self {
        Self {
            chunk_initial_capacity: 64,
            page_bytes: DEFAULT_PAGE_BYTES,
            max_subjects: PLACES_PER_MECHANISM_MAX,
            max_threads: 0,
            min_rows_per_thread: 1024,
            missing_target_policy: MissingTargetPolicy::Ignore,
        }
    }
}

impl MechanismConfig {
    /// Checks every field against its legal range.
    pub fn validate(&self) -> ApparatusResult<()> {
        if !(PLACES_PER_MECHANISM_MIN..=PLACES_PER_MECHANISM_MAX).contains(&self.max_subjects) {
            return Err(ApparatusError::InvalidArgument(format!(
                "max_subjects must be within [{PLACES_PER_MECHANISM_MIN}, {PLACES_PER_MECHANISM_MAX}], got {}",
                self.max_subjects
            ))
            .surfaced());
        }
        if self.page_bytes == 0 {
            return Err(ApparatusError::InvalidArgument("page_bytes must be positive".into()).surfaced());
        }
        if self.min_rows_per_thread == 0 {
            return Err(ApparatusError::InvalidArgument("min_rows_per_thread must be positive".into()).surfaced());
        }
        Ok(())
    }

    /// Effective worker cap.
    pub fn threads(&self) -> usize {
        if self.max_threads == 0 {
            rayon::current_num_threads()
        } else {
            self.max_threads
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::Status;

    #[test]
    fn defaults_are_valid() {
        let config = MechanismConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.missing_target_policy, MissingTargetPolicy::Ignore);
        assert!(config.threads() >= 1);
    }

    #[test]
    fn limits_are_enforced() {
        let config = MechanismConfig { max_subjects: 1000, ..Default::default() };
        assert_eq!(config.validate().unwrap_err().status(), Status::InvalidArgument);
        let config = MechanismConfig { min_rows_per_thread: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let bytes = rmp_serde::to_vec_named(&MechanismConfig { page_bytes: 4096, ..Default::default() }).unwrap();
        let config: MechanismConfig = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(config.page_bytes, 4096);
        assert_eq!(config.chunk_initial_capacity, 64);
    }
}
