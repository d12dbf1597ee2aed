//! # Subject Records
//!
//! A [`SubjectRecord`] is a detached snapshot of one subject: its traitmark,
//! its user-settable flags and an owned value per trait. Records are used to
//! queue deferred spawns, to copy subjects between mechanisms and to persist
//! them.
//!
//! ## Binary format
//!
//! All integers are little-endian `u32`.
//!
//! ```text
//! record     := count name{count} flagmark payload{count}
//! name       := len utf8[len]           registered trait name
//! payload    := len bytes[len]          rmp-serde encoding of the value
//!
//! collection := guid[16] version count record{count}
//! ```
//!
//! Trait names are resolved against the registry on load, so every trait in
//! a file must be registered with
//! [`register_serializable_trait`](crate::engine::registry::register_serializable_trait)
//! before reading. Flag bits outside the known range, and protected flags,
//! are dropped on load.

use std::sync::Arc;

use crate::engine::error::{ApparatusError, ApparatusResult, Status};
use crate::engine::filter::Filter;
use crate::engine::flagmark::Flagmark;
use crate::engine::mechanism::Mechanism;
use crate::engine::registry::{trait_info, trait_info_by_name, Trait};
use crate::engine::storage::TraitValue;
use crate::engine::subject::SubjectHandle;
use crate::engine::traitmark::{TraitBundle, Traitmark};


/// Format GUID written at the start of every collection.
pub const RECORD_FORMAT_GUID: [u8; 16] = guid([0x5E17_14CD, 0x484E_2951, 0x707A_89A7, 0x9302_AB78]);

/// Current collection format version.
pub const RECORD_FORMAT_VERSION: u32 = 1;

const fn guid(words: [u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        out[i] = words[i / 4].to_le_bytes()[i % 4];
        i += 1;
    }
    out
}

/// A single trait value inside a record.
pub type TraitRecord = TraitValue;


/// Detached snapshot of a subject.
///
/// Values are kept in traitmark order, one per trait.
#[derive(Clone, Debug, Default)]
pub struct SubjectRecord {
    traitmark: Traitmark,
    flagmark: Flagmark,
    values: Vec<TraitRecord>,
}

impl SubjectRecord {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record holding the values of a trait tuple.
    ///
    /// ## Errors
    /// `InvalidArgument` if the tuple repeats a type.
    pub fn of<B: TraitBundle>(bundle: B) -> ApparatusResult<Self> {
        Self::from_values(bundle.into_trait_values(), Flagmark::NONE)
    }

    pub(crate) fn from_values(mut values: Vec<TraitRecord>, flagmark: Flagmark) -> ApparatusResult<Self> {
        let traitmark = Traitmark::from_infos(values.iter().map(TraitValue::info));
        if traitmark.len() != values.len() {
            return Err(ApparatusError::InvalidArgument("record repeats a trait type".into()).surfaced());
        }
        values.sort_by_key(|value| value.info().id());
        Ok(Self { traitmark, flagmark: flagmark & Flagmark::USER_SETTABLE, values })
    }

    /// Builder form of [`SubjectRecord::set_flagmark`].
    pub fn with_flagmark(mut self, flagmark: Flagmark) -> Self {
        self.set_flagmark(flagmark);
        self
    }

    /// Sets the flags a spawn from this record starts with.
    ///
    /// Protected and undefined bits are dropped.
    pub fn set_flagmark(&mut self, flagmark: Flagmark) {
        self.flagmark = flagmark & Flagmark::USER_SETTABLE;
    }

    /// Trait set.
    #[inline]
    pub fn traitmark(&self) -> &Traitmark {
        &self.traitmark
    }

    /// Starting flags.
    #[inline]
    pub fn flagmark(&self) -> Flagmark {
        self.flagmark
    }

    /// Values in traitmark order.
    #[inline]
    pub fn values(&self) -> &[TraitRecord] {
        &self.values
    }

    /// Number of traits.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if the record carries no traits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn position_of(&self, id: u32) -> Result<usize, usize> {
        self.values.binary_search_by_key(&id, |value| value.info().id())
    }

    /// Writes `T`, adding it if absent.
    pub fn set_trait<T: Trait>(&mut self, value: T) -> Status {
        let value = TraitValue::new(value);
        match self.position_of(value.info().id()) {
            Ok(at) => self.values[at] = value,
            Err(at) => {
                self.traitmark.add_info(value.info());
                self.values.insert(at, value);
            }
        }
        Status::Success
    }

    /// Adds a default `T`; `Noop` if present.
    pub fn obtain_trait<T: Trait>(&mut self) -> Status {
        if self.has_trait::<T>() {
            return Status::Noop;
        }
        self.set_trait(T::default())
    }

    /// Removes `T`; `Noop` if absent.
    pub fn remove_trait<T: Trait>(&mut self) -> Status {
        match self.position_of(trait_info::<T>().id()) {
            Ok(at) => {
                self.values.remove(at);
                self.traitmark.remove::<T>()
            }
            Err(_) => Status::Noop,
        }
    }

    /// Clone of `T`.
    pub fn get_trait<T: Trait>(&self) -> ApparatusResult<T> {
        let info = trait_info::<T>();
        self.position_of(info.id())
            .map_err(|_| ApparatusError::Missing(format!("record has no `{}`", info.name())))
            .and_then(|at| self.values[at].get::<T>())
    }

    /// `true` if the record carries `T`.
    pub fn has_trait<T: Trait>(&self) -> bool {
        self.traitmark.contains::<T>()
    }

    /// Appends the binary encoding to `out`.
    ///
    /// ## Errors
    /// `UnsupportedOperation` if a trait was not registered as serializable.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> ApparatusResult<()> {
        put_len(out, self.values.len())?;
        for value in &self.values {
            let name = value.info().name().as_bytes();
            put_len(out, name.len())?;
            out.extend_from_slice(name);
        }
        out.extend_from_slice(&self.flagmark.bits().to_le_bytes());
        for value in &self.values {
            let payload = value.encode()?;
            put_len(out, payload.len())?;
            out.extend_from_slice(&payload);
        }
        Ok(())
    }

    /// Binary encoding of the record.
    pub fn to_bytes(&self) -> ApparatusResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decodes a record produced by [`SubjectRecord::to_bytes`].
    ///
    /// ## Errors
    /// - `Error` (codec) on truncated input or trailing bytes.
    /// - `Missing` for a trait name the registry does not know.
    pub fn from_bytes(bytes: &[u8]) -> ApparatusResult<Self> {
        let mut reader = Reader { bytes, at: 0 };
        let record = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(record)
    }

    fn decode(reader: &mut Reader<'_>) -> ApparatusResult<Self> {
        let count = reader.u32()? as usize;
        let infos = (0..count)
            .map(|_| {
                let len = reader.u32()? as usize;
                let name = std::str::from_utf8(reader.take(len)?)
                    .map_err(|error| ApparatusError::Codec(format!("trait name is not UTF-8: {error}")))?;
                trait_info_by_name(name).ok_or_else(|| ApparatusError::Missing(format!("trait `{name}` is not registered")))
            })
            .collect::<ApparatusResult<Vec<_>>>()?;
        let flagmark = Flagmark(reader.u32()?).known_only();
        let values = infos
            .into_iter()
            .map(|info| {
                let len = reader.u32()? as usize;
                TraitValue::decode(info, reader.take(len)?)
            })
            .collect::<ApparatusResult<Vec<_>>>()?;
        Self::from_values(values, flagmark)
    }
}


/// Ordered set of records with the union of their traitmarks.
#[derive(Clone, Debug, Default)]
pub struct SubjectRecordCollection {
    traitmark: Traitmark,
    records: Vec<SubjectRecord>,
}

impl SubjectRecordCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots every subject of `mechanism` matching `filter`, in
    /// iteration order.
    pub fn collect(mechanism: &Arc<Mechanism>, filter: Filter) -> ApparatusResult<Self> {
        let chain = mechanism.enchain_solid(filter)?;
        let mut collection = Self::new();
        for handle in chain.iter() {
            collection.push(mechanism.record_of(handle)?);
        }
        log::debug!(target: "apparatus", "collected {} records from mechanism #{}", collection.len(), mechanism.id());
        Ok(collection)
    }

    /// Appends a record.
    pub fn push(&mut self, record: SubjectRecord) {
        self.traitmark = self.traitmark.union(record.traitmark());
        self.records.push(record);
    }

    /// Union of every record's traitmark.
    #[inline]
    pub fn traitmark(&self) -> &Traitmark {
        &self.traitmark
    }

    /// Records in insertion order.
    #[inline]
    pub fn records(&self) -> &[SubjectRecord] {
        &self.records
    }

    /// Number of records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if there are no records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Spawns one subject per record, in order.
    pub fn spawn_into(&self, mechanism: &Mechanism) -> ApparatusResult<Vec<SubjectHandle>> {
        self.records.iter().map(|record| mechanism.spawn_subject_record(record)).collect()
    }

    /// Binary encoding with the format header.
    pub fn to_bytes(&self) -> ApparatusResult<Vec<u8>> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&RECORD_FORMAT_GUID);
        out.extend_from_slice(&RECORD_FORMAT_VERSION.to_le_bytes());
        put_len(&mut out, self.records.len())?;
        for record in &self.records {
            record.encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Decodes a collection produced by [`SubjectRecordCollection::to_bytes`].
    ///
    /// ## Errors
    /// - `InvalidArgument` if the GUID does not match.
    /// - `UnsupportedOperation` for a newer format version.
    /// - as [`SubjectRecord::from_bytes`] otherwise.
    pub fn from_bytes(bytes: &[u8]) -> ApparatusResult<Self> {
        let mut reader = Reader { bytes, at: 0 };
        if reader.take(RECORD_FORMAT_GUID.len())? != RECORD_FORMAT_GUID {
            return Err(ApparatusError::InvalidArgument("not a subject record collection".into()).surfaced());
        }
        let version = reader.u32()?;
        if version > RECORD_FORMAT_VERSION {
            return Err(ApparatusError::UnsupportedOperation(format!(
                "record format version {version} is newer than {RECORD_FORMAT_VERSION}"
            )));
        }
        let count = reader.u32()? as usize;
        let mut collection = Self::new();
        for _ in 0..count {
            collection.push(SubjectRecord::decode(&mut reader)?);
        }
        reader.finish()?;
        Ok(collection)
    }
}

impl FromIterator<SubjectRecord> for SubjectRecordCollection {
    fn from_iter<I: IntoIterator<Item = SubjectRecord>>(iter: I) -> Self {
        let mut collection = Self::new();
        iter.into_iter().for_each(|record| collection.push(record));
        collection
    }
}


fn put_len(out: &mut Vec<u8>, len: usize) -> ApparatusResult<()> {
    let len = u32::try_from(len).map_err(|_| ApparatusError::OutOfLimit { what: "record bytes", limit: u32::MAX as usize })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> ApparatusResult<&'a [u8]> {
        let end = self.at.checked_add(len).filter(|&end| end <= self.bytes.len()).ok_or_else(|| {
            ApparatusError::Codec(format!("truncated record: wanted {len} bytes at offset {}", self.at))
        })?;
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u32(&mut self) -> ApparatusResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn finish(&self) -> ApparatusResult<()> {
        match self.bytes.len() - self.at {
            0 => Ok(()),
            extra => Err(ApparatusError::Codec(format!("{extra} trailing bytes after record"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::register_serializable_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Tag(String);

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Weight(f64);

    #[test]
    fn records_keep_traitmark_order_and_drop_protected_flags() {
        let record = SubjectRecord::of((Weight(2.5), Tag("a".into())))
            .unwrap()
            .with_flagmark(Flagmark::STALE | Flagmark::B);
        assert_eq!(record.flagmark(), Flagmark::B);
        let ids: Vec<_> = record.values().iter().map(|v| v.info().id()).collect();
        let expected: Vec<_> = record.traitmark().traits().iter().map(|t| t.id()).collect();
        assert_eq!(ids, expected);
        assert!(SubjectRecord::of((Tag::default(), Tag::default())).is_err());
    }

    #[test]
    fn editing_records() {
        let mut record = SubjectRecord::new();
        assert_eq!(record.obtain_trait::<Weight>(), Status::Success);
        assert_eq!(record.obtain_trait::<Weight>(), Status::Noop);
        record.set_trait(Weight(4.0));
        assert_eq!(record.get_trait::<Weight>().unwrap(), Weight(4.0));
        assert_eq!(record.remove_trait::<Weight>(), Status::Success);
        assert_eq!(record.get_trait::<Weight>().unwrap_err().status(), Status::Missing);
        assert!(record.is_empty() && record.traitmark().is_empty());
    }

    #[test]
    fn binary_round_trip_and_corruption() {
        register_serializable_trait::<Tag>();
        register_serializable_trait::<Weight>();
        let collection: SubjectRecordCollection = (0..3)
            .map(|i| SubjectRecord::of((Tag(format!("t{i}")), Weight(i as f64))).unwrap().with_flagmark(Flagmark::C))
            .collect();
        let bytes = collection.to_bytes().unwrap();
        assert_eq!(&bytes[..16], &RECORD_FORMAT_GUID);

        let decoded = SubjectRecordCollection::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.records()[2].get_trait::<Tag>().unwrap(), Tag("t2".into()));
        assert_eq!(decoded.records()[1].flagmark(), Flagmark::C);

        let truncated = SubjectRecordCollection::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(truncated.status(), Status::Error);
        let mut foreign = bytes.clone();
        foreign[0] ^= 0xFF;
        assert_eq!(SubjectRecordCollection::from_bytes(&foreign).unwrap_err().status(), Status::InvalidArgument);
        let mut newer = bytes;
        newer[16] = 9;
        assert_eq!(SubjectRecordCollection::from_bytes(&newer).unwrap_err().status(), Status::UnsupportedOperation);
    }

    #[test]
    fn traits_without_codec_refuse_to_encode() {
        #[derive(Clone, Default)]
        struct Opaque;
        let record = SubjectRecord::of((Opaque,)).unwrap();
        assert_eq!(record.to_bytes().unwrap_err().status(), Status::UnsupportedOperation);
    }
}
