//! # Engine Module
//!
//! Building blocks of the data engine, bottom-up:
//! - ids, statuses and errors
//! - bit masks, type registries, traitmarks, flagmarks, fingerprints, filters
//! - column storage and chunks
//! - subject handles and the subject registry
//! - lock counting, the deferred queue and mechanisms
//! - chains, adjectives, records and reductions
//!
//! Public API exposure is controlled by `lib.rs`.

pub mod types;
pub mod error;
pub mod bitmask;
pub mod registry;
pub mod traitmark;
pub mod flagmark;
pub mod fingerprint;
pub mod filter;
pub mod storage;
pub mod chunk;
pub mod subject;
pub mod lock;
pub mod commands;
pub mod config;
pub mod mechanism;
pub mod chain;
pub mod adjective;
pub mod record;
pub mod reduce;
