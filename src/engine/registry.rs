//! # Trait and Detail Registries
//!
//! Process-wide registries that assign a dense, stable id to every trait type
//! and every detail class the first time it is observed.
//!
//! ## Purpose
//! Each id names one bit position shared by every [`BitMask`] in the process,
//! so traitmarks built in different mechanisms compare directly. Each trait
//! entry also carries the type-erased element operations that columns and
//! records use to construct, copy, and destroy values they cannot name.
//!
//! ## Design
//! - Entries are leaked into `&'static` storage on registration and never
//!   removed, so lookups can hand out plain references.
//! - Trait types register on first observation through [`trait_info`].
//!   Serializable traits additionally install a codec through
//!   [`register_serializable_trait`]; the codec may be attached later than the
//!   entry itself.
//! - Detail classes carry an optional base class. A detail's inclusion mask is
//!   its own bit plus every ancestor bit; its exclusion mask is its own bit
//!   only. A subject carrying `D` therefore satisfies a filter that requires
//!   any ancestor of `D`.
//!
//! ## Invariants
//! - Ids are never reused and never change for the lifetime of the process.
//! - Registration is idempotent.
//! - A trait's inclusion and exclusion masks are the single bit of its id.
//!
//! ## Concurrency
//! Each registry sits behind a `parking_lot::RwLock`; registration takes the
//! write side once per type, everything else reads.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::mem::{align_of, size_of};
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::bitmask::BitMask;
use crate::engine::error::{ApparatusError, ApparatusResult};
use crate::engine::types::{DetailID, TraitID};


/// A type that can be stored as a trait in chunk columns.
///
/// Implemented automatically for every `Clone + Default + Send + Sync + 'static` type.
pub trait Trait: Any + Clone + Default + Send + Sync {}

impl<T: Any + Clone + Default + Send + Sync> Trait for T {}

/// Type-erased element operations for one trait type.
///
/// All pointers must be aligned for the trait type and point at memory large
/// enough for one element.
#[derive(Clone, Copy)]
pub struct TraitOps {
    /// Element size in bytes.
    pub size: usize,
    /// Element alignment in bytes.
    pub align: usize,
    /// Writes a default value into uninitialised memory.
    pub default_in_place: unsafe fn(*mut u8),
    /// Replaces an initialised value with the default.
    pub assign_default: unsafe fn(*mut u8),
    /// Clones `src` into uninitialised `dst`.
    pub clone_into_uninit: unsafe fn(*const u8, *mut u8),
    /// Clones `src` over an initialised `dst`.
    pub clone_assign: unsafe fn(*const u8, *mut u8),
    /// Drops the value in place. `None` for types without drop glue.
    pub drop_in_place: Option<unsafe fn(*mut u8)>,
}

unsafe fn default_in_place<T: Trait>(dst: *mut u8) {
    unsafe { dst.cast::<T>().write(T::default()) }
}

unsafe fn assign_default<T: Trait>(dst: *mut u8) {
    unsafe { *dst.cast::<T>() = T::default() }
}

unsafe fn clone_into_uninit<T: Trait>(src: *const u8, dst: *mut u8) {
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) }
}

unsafe fn clone_assign<T: Trait>(src: *const u8, dst: *mut u8) {
    unsafe { (*dst.cast::<T>()).clone_from(&*src.cast::<T>()) }
}

unsafe fn drop_erased<T>(ptr: *mut u8) {
    unsafe { ptr.cast::<T>().drop_in_place() }
}

impl TraitOps {
    /// Builds the operations for `T`.
    pub fn of<T: Trait>() -> Self {
        Self {
            size: size_of::<T>(),
            align: align_of::<T>(),
            default_in_place: default_in_place::<T>,
            assign_default: assign_default::<T>,
            clone_into_uninit: clone_into_uninit::<T>,
            clone_assign: clone_assign::<T>,
            drop_in_place: if std::mem::needs_drop::<T>() { Some(drop_erased::<T>) } else { None },
        }
    }
}

/// Payload codec for a serializable trait type.
#[derive(Clone, Copy)]
pub struct TraitCodec {
    /// Encodes the value at the pointer.
    pub encode: unsafe fn(*const u8) -> ApparatusResult<Vec<u8>>,
    /// Decodes bytes into uninitialised memory at the pointer.
    pub decode: unsafe fn(&[u8], *mut u8) -> ApparatusResult<()>,
}

unsafe fn encode_payload<T: Trait + Serialize>(src: *const u8) -> ApparatusResult<Vec<u8>> {
    let value = unsafe { &*src.cast::<T>() };
    rmp_serde::to_vec(value).map_err(|e| ApparatusError::Codec(format!("{}: {e}", type_name::<T>())))
}

unsafe fn decode_payload<T: Trait + DeserializeOwned>(bytes: &[u8], dst: *mut u8) -> ApparatusResult<()> {
    let value: T = rmp_serde::from_slice(bytes)
        .map_err(|e| ApparatusError::Codec(format!("{}: {e}", type_name::<T>())))?;
    unsafe { dst.cast::<T>().write(value) };
    Ok(())
}

/// Registry entry for one trait type.
pub struct TraitInfo {
    id: TraitID,
    name: &'static str,
    type_id: TypeId,
    ops: TraitOps,
    mask: BitMask,
    codec: OnceLock<TraitCodec>,
}

impl TraitInfo {
    /// Dense id and bit position.
    #[inline]
    pub fn id(&self) -> TraitID {
        self.id
    }

    /// Canonical name used by record files.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rust type id of the trait type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Element operations.
    #[inline]
    pub fn ops(&self) -> &TraitOps {
        &self.ops
    }

    /// Single-bit inclusion mask.
    #[inline]
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Single-bit exclusion mask; same bit as [`TraitInfo::mask`].
    #[inline]
    pub fn excluded_mask(&self) -> &BitMask {
        &self.mask
    }

    /// Payload codec, if the type was registered as serializable.
    #[inline]
    pub fn codec(&self) -> Option<&TraitCodec> {
        self.codec.get()
    }

    /// `true` if this entry describes `T`.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Fails with `WrongType` unless this entry describes `T`.
    #[inline]
    pub fn expect_type<T: 'static>(&self) -> ApparatusResult<()> {
        if self.is::<T>() {
            Ok(())
        } else {
            Err(ApparatusError::WrongType { expected: self.name, actual: type_name::<T>() }.surfaced())
        }
    }
}

impl std::fmt::Debug for TraitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraitInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.ops.size)
            .finish()
    }
}

#[derive(Default)]
struct TraitRegistry {
    by_type: HashMap<TypeId, &'static TraitInfo>,
    by_name: HashMap<&'static str, &'static TraitInfo>,
    by_id: Vec<&'static TraitInfo>,
}

fn trait_registry() -> &'static RwLock<TraitRegistry> {
    static TRAITS: OnceLock<RwLock<TraitRegistry>> = OnceLock::new();
    TRAITS.get_or_init(|| RwLock::new(TraitRegistry::default()))
}

/// Returns the registry entry for `T`, registering it on first observation.

pub fn trait_info<T: Trait>() -> &'static TraitInfo {
    let type_id = TypeId::of::<T>();
    if let Some(info) = trait_registry().read().by_type.get(&type_id).copied() {
        return info;
    }
    let mut registry = trait_registry().write();
    if let Some(info) = registry.by_type.get(&type_id).copied() {
        return info;
    }
    let id = registry.by_id.len() as TraitID;
    let info: &'static TraitInfo = Box::leak(Box::new(TraitInfo {
        id,
        name: type_name::<T>(),
        type_id,
        ops: TraitOps::of::<T>(),
        mask: BitMask::from_indices([id as usize]),
        codec: OnceLock::new(),
    }));
    registry.by_type.insert(type_id, info);
    registry.by_name.insert(info.name, info);
    registry.by_id.push(info);
    log::debug!(target: "apparatus", "registered trait `{}` as #{id}", info.name);
    info
}

/// Dense id of `T`, registering it on first observation.
#[inline]
pub fn trait_id_of<T: Trait>() -> TraitID {
    trait_info::<T>().id
}

/// Registers `T` and installs its record payload codec.
pub fn register_serializable_trait<T: Trait + Serialize + DeserializeOwned>() -> &'static TraitInfo {
    let info = trait_info::<T>();
    let _ = info.codec.set(TraitCodec { encode: encode_payload::<T>, decode: decode_payload::<T> });
    info
}

/// Looks up a trait entry by id.
pub fn trait_info_by_id(id: TraitID) -> Option<&'static TraitInfo> {
    trait_registry().read().by_id.get(id as usize).copied()
}

/// Looks up a trait entry by canonical name.
pub fn trait_info_by_name(name: &str) -> Option<&'static TraitInfo> {
    trait_registry().read().by_name.get(name).copied()
}

/// Number of registered trait types.
pub fn registered_traits_count() -> usize {
    trait_registry().read().by_id.len()
}


/// A class in the detail hierarchy.
///
/// `base` names the parent class, if any. Registering a detail registers its
/// ancestors first.
pub trait Detail: Any + Send + Sync {
    /// Parent class entry, or `None` for a root class.
    fn base() -> Option<&'static DetailInfo> {
        None
    }
}

/// Registry entry for one detail class.
pub struct DetailInfo {
    id: DetailID,
    name: &'static str,
    type_id: TypeId,
    base: Option<DetailID>,
    mask: BitMask,
    excluded_mask: BitMask,
}

impl DetailInfo {
    /// Dense id and bit position.
    #[inline]
    pub fn id(&self) -> DetailID {
        self.id
    }

    /// Class name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rust type id of the class marker.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Parent class id.
    #[inline]
    pub fn base(&self) -> Option<DetailID> {
        self.base
    }

    /// Own bit plus every ancestor bit.
    #[inline]
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Own bit only.
    #[inline]
    pub fn excluded_mask(&self) -> &BitMask {
        &self.excluded_mask
    }
}

impl std::fmt::Debug for DetailInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &self.base)
            .finish()
    }
}

#[derive(Default)]
struct DetailRegistry {
    by_type: HashMap<TypeId, &'static DetailInfo>,
    by_id: Vec<&'static DetailInfo>,
}

fn detail_registry() -> &'static RwLock<DetailRegistry> {
    static DETAILS: OnceLock<RwLock<DetailRegistry>> = OnceLock::new();
    DETAILS.get_or_init(|| RwLock::new(DetailRegistry::default()))
}

/// Returns the registry entry for `D`, registering it and its ancestors on
/// first observation.
pub fn detail_info<D: Detail>() -> &'static DetailInfo {
    let type_id = TypeId::of::<D>();
    if let Some(info) = detail_registry().read().by_type.get(&type_id).copied() {
        return info;
    }
    // Resolve the base before taking the write lock; it may register more classes.
    let base = D::base();
    let mut registry = detail_registry().write();
    if let Some(info) = registry.by_type.get(&type_id).copied() {
        return info;
    }
    let id = registry.by_id.len() as DetailID;
    let excluded_mask = BitMask::from_indices([id as usize]);
    let mut mask = excluded_mask.clone();
    if let Some(base) = base {
        mask |= &base.mask;
    }
    let info: &'static DetailInfo = Box::leak(Box::new(DetailInfo {
        id,
        name: type_name::<D>(),
        type_id,
        base: base.map(|b| b.id),
        mask,
        excluded_mask,
    }));
    registry.by_type.insert(type_id, info);
    registry.by_id.push(info);
    log::debug!(target: "apparatus", "registered detail `{}` as #{id}", info.name);
    info
}

/// Looks up a detail entry by id.
pub fn detail_info_by_id(id: DetailID) -> Option<&'static DetailInfo> {
    detail_registry().read().by_id.get(id as usize).copied()
}

/// `true` if `derived` is `ancestor` or inherits from it.
pub fn detail_is_a(derived: &DetailInfo, ancestor: &DetailInfo) -> bool {
    derived.mask.at(ancestor.id as usize)
}
