//! # Traitmarks and Detailmarks
//!
//! Type sets describing what a subject carries.
//!
//! ## Design
//! A [`Traitmark`] keeps its trait entries sorted by registry id together with
//! a cached [`BitMask`] over those ids. Sorting gives every chunk a canonical
//! column order, and the mask turns set comparison into word operations. Two
//! traitmarks with the same type set are equal regardless of insertion order.
//!
//! A [`Detailmark`] is the same idea for detail classes, except that it keeps
//! two masks: the *inclusive* one (own bits plus ancestors) describes what a
//! subject carries, while the *own-bit* one is used on the filter side.
//!
//! ## Invariants
//! - No duplicates; entries are always sorted by id.
//! - The cached masks always match the entry list.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitOr, Sub};

use crate::engine::bitmask::BitMask;
use crate::engine::error::Status;
use crate::engine::registry::{detail_info, trait_info, Detail, DetailInfo, Trait, TraitInfo};
use crate::engine::storage::TraitValue;
use crate::engine::types::TraitID;


/// Ordered set of trait types with a cached bit mask.
#[derive(Clone, Default)]
pub struct Traitmark {
    traits: Vec<&'static TraitInfo>,
    mask: BitMask,
}

impl Traitmark {
    /// Creates an empty traitmark.
    #[inline]
    pub const fn new() -> Self {
        Self { traits: Vec::new(), mask: BitMask::new() }
    }

    /// Builds a traitmark from a tuple of trait types, e.g. `Traitmark::of::<(A, B)>()`.
    pub fn of<S: TraitSet>() -> Self {
        Self::from_infos(S::trait_infos())
    }

    /// Builds a traitmark from registry entries, dropping duplicates.
    pub fn from_infos(infos: impl IntoIterator<Item = &'static TraitInfo>) -> Self {
        let mut traitmark = Self::new();
        for info in infos {
            traitmark.add_info(info);
        }
        traitmark
    }

    /// Builder form of [`Traitmark::add`].
    #[inline]
    pub fn with<T: Trait>(mut self) -> Self {
        self.add_info(trait_info::<T>());
        self
    }

    /// Adds `T`; `Noop` if it was already present.
    #[inline]
    pub fn add<T: Trait>(&mut self) -> Status {
        self.add_info(trait_info::<T>())
    }

    /// Adds a trait entry; `Noop` if it was already present.
    pub fn add_info(&mut self, info: &'static TraitInfo) -> Status {
        match self.traits.binary_search_by_key(&info.id(), |t| t.id()) {
            Ok(_) => Status::Noop,
            Err(position) => {
                self.traits.insert(position, info);
                self.mask.set(info.id() as usize, true);
                Status::Success
            }
        }
    }

    /// Removes `T`; `Noop` if it was absent.
    #[inline]
    pub fn remove<T: Trait>(&mut self) -> Status {
        self.remove_info(trait_info::<T>())
    }

    /// Removes a trait entry; `Noop` if it was absent.
    pub fn remove_info(&mut self, info: &'static TraitInfo) -> Status {
        match self.traits.binary_search_by_key(&info.id(), |t| t.id()) {
            Ok(position) => {
                self.traits.remove(position);
                self.mask.clear(info.id() as usize);
                Status::Success
            }
            Err(_) => Status::Noop,
        }
    }

    /// Removes every trait.
    pub fn reset(&mut self) {
        self.traits.clear();
        self.mask.reset();
    }

    /// `true` if `T` is present.
    #[inline]
    pub fn contains<T: Trait>(&self) -> bool {
        self.mask.at(trait_info::<T>().id() as usize)
    }

    /// `true` if the trait with `id` is present.
    #[inline]
    pub fn contains_id(&self, id: TraitID) -> bool {
        self.mask.at(id as usize)
    }

    /// Position of the trait with `id` in the sorted sequence.
    #[inline]
    pub fn index_of(&self, id: TraitID) -> Option<usize> {
        if !self.contains_id(id) {
            return None;
        }
        self.traits.binary_search_by_key(&id, |t| t.id()).ok()
    }

    /// `true` if every trait of `other` is present in `self`.
    #[inline]
    pub fn includes(&self, other: &Traitmark) -> bool {
        self.mask.includes(&other.mask)
    }

    /// Number of traits.
    #[inline]
    pub fn len(&self) -> usize {
        self.traits.len()
    }

    /// `true` if there are no traits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    /// Trait entries in id order.
    #[inline]
    pub fn traits(&self) -> &[&'static TraitInfo] {
        &self.traits
    }

    /// Cached mask over trait ids.
    #[inline]
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Union of `self` and `other`.
    pub fn union(&self, other: &Traitmark) -> Traitmark {
        let mut out = self.clone();
        for &info in other.traits() {
            out.add_info(info);
        }
        out
    }

    /// Traits of `self` not in `other`.
    pub fn difference(&self, other: &Traitmark) -> Traitmark {
        Traitmark::from_infos(self.traits.iter().copied().filter(|t| !other.contains_id(t.id())))
    }
}

impl PartialEq for Traitmark {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask
    }
}

impl Eq for Traitmark {}

impl Hash for Traitmark {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mask.hash(state);
    }
}

impl BitOr for &Traitmark {
    type Output = Traitmark;

    #[inline]
    fn bitor(self, rhs: &Traitmark) -> Traitmark {
        self.union(rhs)
    }
}

impl Sub for &Traitmark {
    type Output = Traitmark;

    #[inline]
    fn sub(self, rhs: &Traitmark) -> Traitmark {
        self.difference(rhs)
    }
}

impl fmt::Debug for Traitmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.traits.iter().map(|t| t.name())).finish()
    }
}


/// Ordered set of detail classes.
#[derive(Clone, Default)]
pub struct Detailmark {
    details: Vec<&'static DetailInfo>,
    mask: BitMask,
    excluded_mask: BitMask,
}

impl Detailmark {
    /// Creates an empty detailmark.
    #[inline]
    pub const fn new() -> Self {
        Self { details: Vec::new(), mask: BitMask::new(), excluded_mask: BitMask::new() }
    }

    /// Builder form of [`Detailmark::add`].
    #[inline]
    pub fn with<D: Detail>(mut self) -> Self {
        self.add_info(detail_info::<D>());
        self
    }

    /// Adds `D`; `Noop` if it was already present.
    #[inline]
    pub fn add<D: Detail>(&mut self) -> Status {
        self.add_info(detail_info::<D>())
    }

    /// Adds a detail entry; `Noop` if it was already present.
    pub fn add_info(&mut self, info: &'static DetailInfo) -> Status {
        match self.details.binary_search_by_key(&info.id(), |d| d.id()) {
            Ok(_) => Status::Noop,
            Err(position) => {
                self.details.insert(position, info);
                self.mask |= info.mask();
                self.excluded_mask |= info.excluded_mask();
                Status::Success
            }
        }
    }

    /// Removes `D`; `Noop` if it was absent.
    pub fn remove<D: Detail>(&mut self) -> Status {
        let info = detail_info::<D>();
        match self.details.binary_search_by_key(&info.id(), |d| d.id()) {
            Ok(position) => {
                self.details.remove(position);
                self.rebuild_masks();
                Status::Success
            }
            Err(_) => Status::Noop,
        }
    }

    fn rebuild_masks(&mut self) {
        self.mask.reset();
        self.excluded_mask.reset();
        for info in &self.details {
            self.mask |= info.mask();
            self.excluded_mask |= info.excluded_mask();
        }
    }

    /// Detail entries in id order.
    #[inline]
    pub fn details(&self) -> &[&'static DetailInfo] {
        &self.details
    }

    /// Number of details.
    #[inline]
    pub fn len(&self) -> usize {
        self.details.len()
    }

    /// `true` if there are no details.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }

    /// Inclusive mask: own bits plus every ancestor bit.
    #[inline]
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    /// Own bits only, as used by the filter side.
    #[inline]
    pub fn excluded_mask(&self) -> &BitMask {
        &self.excluded_mask
    }
}

impl PartialEq for Detailmark {
    fn eq(&self, other: &Self) -> bool {
        self.excluded_mask == other.excluded_mask
    }
}

impl Eq for Detailmark {}

impl Hash for Detailmark {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.excluded_mask.hash(state);
    }
}

impl fmt::Debug for Detailmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.details.iter().map(|d| d.name())).finish()
    }
}


/// A tuple of trait types usable as a traitmark, e.g. `(Position, Velocity)`.
pub trait TraitSet {
    /// Registry entries of every member type.
    fn trait_infos() -> Vec<&'static TraitInfo>;
}

/// A tuple of trait values usable for spawning, e.g. `(Position { .. }, Velocity { .. })`.
pub trait TraitBundle: Send + 'static {
    /// Moves the member values into type-erased holders.
    fn into_trait_values(self) -> Vec<TraitValue>;
}

macro_rules! impl_trait_tuples {
    ($($name:ident),+) => {
        impl<$($name: Trait),+> TraitSet for ($($name,)+) {
            fn trait_infos() -> Vec<&'static TraitInfo> {
                vec![$(trait_info::<$name>()),+]
            }
        }

        impl<$($name: Trait),+> TraitBundle for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_trait_values(self) -> Vec<TraitValue> {
                let ($($name,)+) = self;
                vec![$(TraitValue::new($name)),+]
            }
        }
    };
}

impl_trait_tuples!(A);
impl_trait_tuples!(A, B);
impl_trait_tuples!(A, B, C);
impl_trait_tuples!(A, B, C, D);
impl_trait_tuples!(A, B, C, D, E);
impl_trait_tuples!(A, B, C, D, E, F);
impl_trait_tuples!(A, B, C, D, E, F, G);
impl_trait_tuples!(A, B, C, D, E, F, G, H);
