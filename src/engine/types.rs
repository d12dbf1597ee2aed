//! Core Identifiers, Handle Layout, and Compile-Time Constants
//!
//! This module defines the **numeric identifiers and bit layouts** shared by
//! every other part of the engine: subject handles, chunk ids, trait and
//! detail ids, and the capacities that bound them.
//!
//! ## Subject Handle Representation
//!
//! A subject handle is a packed 64-bit integer:
//!
//! ```text
//! | mechanism (8) | generation (24) | slot (32) |
//! ```
//!
//! - **Slot** indexes the owning mechanism's `SubjectInfo` array.
//! - **Generation** is bumped every time the slot is released, so handles
//!   issued before a despawn never validate again.
//! - **Mechanism** identifies which mechanism issued the handle. Id `0` is
//!   reserved, which makes the all-zero handle the invalid handle.
//!
//! The widths are validated with static assertions below.
//!
//! ## Safety
//!
//! This module contains no unsafe code. The constants here are relied upon
//! by the storage and registry layers, so changing them changes the handle
//! wire format.

/// Bit-width type used for compile-time layout calculations.
pub type Bits = u8;

/// Packed 64-bit subject handle value.
pub type SubjectID = u64;
/// Index of a slot within a mechanism's subject registry.
pub type SlotIndex = u32;
/// Generation counter of a subject slot.
pub type Generation = u32;
/// Identifier of a mechanism within the process.
pub type MechanismID = u8;

/// Identifier of a chunk within its mechanism.
pub type ChunkID = u32;
/// Dense identifier of a registered trait type.
pub type TraitID = u32;
/// Dense identifier of a registered detail class.
pub type DetailID = u32;
/// Identifier of an adjective or mechanic within its mechanism.
pub type AdjectiveID = u32;

/// Total number of bits in a [`SubjectID`].
pub const HANDLE_BITS: Bits = 64;
/// Number of bits reserved for the slot index.
pub const SLOT_BITS: Bits = 32;
/// Number of bits reserved for the generation counter.
pub const GENERATION_BITS: Bits = 24;
/// Number of bits reserved for the mechanism id.
pub const MECHANISM_BITS: Bits = HANDLE_BITS - SLOT_BITS - GENERATION_BITS;

const _: [(); 1] = [(); (SLOT_BITS + GENERATION_BITS < HANDLE_BITS) as usize];
const _: [(); 1] = [(); (MECHANISM_BITS == 8) as usize];
const _: [(); 1] = [(); (GENERATION_BITS <= 32) as usize];

const fn mask(bits: Bits) -> SubjectID {
    if bits == 0 { 0 } else { ((1 as SubjectID) << bits) - 1 }
}

/// Mask selecting the slot portion of a [`SubjectID`].
pub const SLOT_MASK: SubjectID = mask(SLOT_BITS);
/// Mask selecting the generation portion (after shifting).
pub const GENERATION_MASK: SubjectID = mask(GENERATION_BITS);
/// Mask selecting the mechanism portion (after shifting).
pub const MECHANISM_MASK: SubjectID = mask(MECHANISM_BITS);

/// Handle value that never refers to a subject.
pub const INVALID_SUBJECT_ID: SubjectID = 0;

/// Upper bound on subject slots a single mechanism may hold.
pub const PLACES_PER_MECHANISM_MAX: usize = (1usize << 31) - 1;
/// Lower bound any configured slot limit must respect.
pub const PLACES_PER_MECHANISM_MIN: usize = 1usize << 24;

const _: [(); 1] = [(); (PLACES_PER_MECHANISM_MAX as u64 <= SLOT_MASK) as usize];
const _: [(); 1] = [(); (PLACES_PER_MECHANISM_MIN < PLACES_PER_MECHANISM_MAX) as usize];

/// Largest mechanism id that may be issued. Id `0` is reserved.
pub const MECHANISMS_MAX: usize = MECHANISM_MASK as usize;

/// Number of bits in one bitmask group word.
pub const GROUP_BITS: usize = 64;

/// Packs mechanism id, generation and slot into a [`SubjectID`].
#[inline]
pub const fn make_subject_id(mechanism: MechanismID, generation: Generation, slot: SlotIndex) -> SubjectID {
    ((mechanism as SubjectID) << (SLOT_BITS + GENERATION_BITS))
        | (((generation as SubjectID) & GENERATION_MASK) << SLOT_BITS)
        | (slot as SubjectID & SLOT_MASK)
}

/// Unpacks a [`SubjectID`] into `(mechanism, generation, slot)`.
#[inline]
pub const fn split_subject_id(id: SubjectID) -> (MechanismID, Generation, SlotIndex) {
    let slot = (id & SLOT_MASK) as SlotIndex;
    let generation = ((id >> SLOT_BITS) & GENERATION_MASK) as Generation;
    let mechanism = ((id >> (SLOT_BITS + GENERATION_BITS)) & MECHANISM_MASK) as MechanismID;
    (mechanism, generation, slot)
}

/// Advances a generation counter, wrapping within [`GENERATION_BITS`].
#[inline]
pub const fn next_generation(generation: Generation) -> Generation {
    ((generation as SubjectID + 1) & GENERATION_MASK) as Generation
}
