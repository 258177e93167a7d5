//! Field tags and descriptor maps.
//!
//! Every cacheable entity declares its fields as `Option<V>` slots, each registered under a
//! [`FieldTag`]. The resulting [`FieldMap`] is built once per type and gives O(1) access
//! from a tag to a type-erased accessor for that slot.
//!
//! Provider specific response types implement [`FieldSource`] with the same tag enum,
//! which allows merging a subset of fields into the canonical entity without converting
//! the whole response first.

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, CacheResult};
use crate::value::FieldValue;

/// A type-erased field value.
pub(crate) type BoxedValue = Box<dyn Any + Send + Sync>;

/// A closed, ordered set of field identifiers.
///
/// Use the [`field_tags!`](crate::field_tags) macro to declare one.
pub trait FieldTag: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// All tags, ordered by their [`index`](Self::index).
    const ALL: &'static [Self];

    /// The ordinal of this tag, which is below `ALL.len()` and at most 63.
    fn index(self) -> usize;

    /// The stable name of this tag, used in snapshot files.
    fn name(self) -> &'static str;

    /// Looks up a tag by its [`name`](Self::name).
    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tag| tag.name() == name)
    }
}

/// A type that exposes some of its data as tagged fields.
pub trait FieldSource: Send + Sync + 'static {
    /// The tag enum shared with the cached entity.
    type Field: FieldTag;

    /// The descriptor map of this type.
    ///
    /// Implementations should build the map once and keep it in a `static`.
    fn field_map() -> &'static FieldMap<Self, Self::Field>
    where
        Self: Sized;
}

/// The canonical entity type stored by a [`FieldCache`](crate::FieldCache).
///
/// A fresh entity is created through [`Default`] the first time a key is accessed, and is
/// then mutated in place for the lifetime of that cache entry.
pub trait CacheEntity: FieldSource + Default {}

impl<T: FieldSource + Default> CacheEntity for T {}

/// A set of field tags backed by a bitmap.
pub struct FieldSet<F> {
    bits: u64,
    _tag: PhantomData<F>,
}

impl<F: FieldTag> FieldSet<F> {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self {
            bits: 0,
            _tag: PhantomData,
        }
    }

    /// Creates a set containing every tag.
    pub fn all() -> Self {
        F::ALL.iter().copied().collect()
    }

    /// Adds `tag`, returning `true` if it was not in the set before.
    pub fn insert(&mut self, tag: F) -> bool {
        let mask = Self::mask(tag);
        let added = self.bits & mask == 0;
        self.bits |= mask;
        added
    }

    /// Removes `tag`, returning `true` if it was in the set.
    pub fn remove(&mut self, tag: F) -> bool {
        let mask = Self::mask(tag);
        let removed = self.bits & mask != 0;
        self.bits &= !mask;
        removed
    }

    pub fn contains(&self, tag: F) -> bool {
        self.bits & Self::mask(tag) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Iterates the tags in this set in tag order.
    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        F::ALL.iter().copied().filter(|tag| self.contains(*tag))
    }

    fn mask(tag: F) -> u64 {
        let index = tag.index();
        debug_assert!(index < 64, "field tag {tag:?} exceeds the 64 tag limit");
        1 << index
    }
}

impl<F> Clone for FieldSet<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for FieldSet<F> {}

impl<F> PartialEq for FieldSet<F> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<F> Eq for FieldSet<F> {}

impl<F: FieldTag> Default for FieldSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FieldTag> FromIterator<F> for FieldSet<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        let mut set = Self::new();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

impl<F: FieldTag> fmt::Debug for FieldSet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Describes a single tagged slot on type `T`.
pub struct FieldDescriptor<T, F> {
    tag: F,
    memory_only: bool,
    slot: Box<dyn ErasedSlot<T>>,
}

impl<T, F: FieldTag> FieldDescriptor<T, F> {
    pub fn tag(&self) -> F {
        self.tag
    }

    /// Memory-only fields are never written to disk.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only
    }

    /// Whether this field can be persisted inline as JSON.
    pub fn is_json(&self) -> bool {
        self.slot.is_json()
    }

    /// The [`TypeId`] of the field value `V` (not of `Option<V>`).
    pub fn value_type(&self) -> TypeId {
        self.slot.value_type()
    }

    pub fn value_type_name(&self) -> &'static str {
        self.slot.type_name()
    }

    /// Whether values of this field own a resource that needs releasing.
    pub fn needs_release(&self) -> bool {
        self.slot.needs_release()
    }

    /// Returns `true` if the slot currently holds a value.
    pub fn has_value(&self, target: &T) -> bool {
        self.slot.value_ref(target).is_some()
    }

    pub(crate) fn value_ref<'a>(&self, target: &'a T) -> Option<&'a (dyn Any + Send + Sync)> {
        self.slot.value_ref(target)
    }

    pub(crate) fn clone_value(&self, target: &T) -> Option<BoxedValue> {
        self.slot.clone_value(target)
    }

    /// Writes `value` into the slot, returning the superseded value if it has to be
    /// released.
    pub(crate) fn replace(
        &self,
        target: &mut T,
        value: Option<BoxedValue>,
    ) -> CacheResult<Option<BoxedValue>> {
        self.slot
            .replace(target, value)
            .map_err(|expected| CacheError::TypeMismatch {
                field: self.tag.name(),
                expected,
            })
    }

    /// Returns `true` if both slots hold the very same value, see [`FieldValue::is_same`].
    pub(crate) fn is_same_value(&self, a: &T, b: &T) -> bool {
        self.slot.is_same_value(a, b)
    }

    /// Empties the slot, returning the previous value.
    pub(crate) fn take(&self, target: &mut T) -> Option<BoxedValue> {
        self.slot.take(target)
    }

    pub(crate) fn release_value(&self, value: BoxedValue) {
        self.slot.release(value)
    }

    /// Encodes the current value as JSON, or `None` if the field has no JSON codec.
    pub(crate) fn to_json(&self, target: &T) -> Option<CacheResult<serde_json::Value>> {
        self.slot.to_json(target).map(|r| r.map_err(CacheError::from))
    }

    /// Decodes a JSON value, or `None` if the field has no JSON codec.
    pub(crate) fn from_json(
        &self,
        json: serde_json::Value,
    ) -> Option<CacheResult<Option<BoxedValue>>> {
        self.slot.from_json(json).map(|r| r.map_err(CacheError::from))
    }
}

impl<T, F: FieldTag> fmt::Debug for FieldDescriptor<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("tag", &self.tag)
            .field("type", &self.value_type_name())
            .field("memory_only", &self.memory_only)
            .finish()
    }
}

/// The immutable tag → slot mapping of a type.
pub struct FieldMap<T, F> {
    slots: Vec<Option<FieldDescriptor<T, F>>>,
}

impl<T: 'static, F: FieldTag> FieldMap<T, F> {
    pub fn builder() -> FieldMapBuilder<T, F> {
        FieldMapBuilder {
            slots: F::ALL.iter().map(|_| None).collect(),
        }
    }

    /// Returns the descriptor for `tag`, if `T` declares it.
    pub fn get(&self, tag: F) -> Option<&FieldDescriptor<T, F>> {
        self.slots.get(tag.index()).and_then(Option::as_ref)
    }

    pub fn contains(&self, tag: F) -> bool {
        self.get(tag).is_some()
    }

    /// Iterates all declared descriptors in tag order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor<T, F>> {
        self.slots.iter().flatten()
    }

    /// The set of declared tags.
    pub fn tags(&self) -> FieldSet<F> {
        self.iter().map(FieldDescriptor::tag).collect()
    }

    /// The tags that can be copied from `self` into `target`.
    ///
    /// A tag qualifies if both types declare it with the same value type. Everything else
    /// is silently left out.
    pub fn compatible_with<E: 'static>(&self, target: &FieldMap<E, F>) -> FieldSet<F> {
        let mut compatible = FieldSet::new();
        for source in self.iter() {
            match target.get(source.tag) {
                Some(slot) if slot.value_type() == source.value_type() => {
                    compatible.insert(source.tag);
                }
                Some(slot) => {
                    tracing::debug!(
                        field = source.tag.name(),
                        source = source.value_type_name(),
                        target = slot.value_type_name(),
                        "field types differ, field is not mergeable"
                    );
                }
                None => {
                    tracing::debug!(
                        field = source.tag.name(),
                        target = type_name::<E>(),
                        "field not declared on target",
                    );
                }
            }
        }
        compatible
    }
}

impl<T, F: FieldTag> fmt::Debug for FieldMap<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter().flatten()).finish()
    }
}

/// Builds a [`FieldMap`].
///
/// ```ignore
/// FieldMap::builder()
///     .field(AnimeField::Title, |a: &Anime| &a.title, |a| &mut a.title)
///     .memory_only(AnimeField::Image, |a: &Anime| &a.image, |a| &mut a.image)
///     .build()
/// ```
pub struct FieldMapBuilder<T, F> {
    slots: Vec<Option<FieldDescriptor<T, F>>>,
}

impl<T: 'static, F: FieldTag> FieldMapBuilder<T, F> {
    /// Registers a field that is persisted inline as JSON, unless a binary type handler is
    /// registered for `V`.
    pub fn field<V, G, M>(self, tag: F, get: G, get_mut: M) -> Self
    where
        V: FieldValue + Serialize + DeserializeOwned,
        G: Fn(&T) -> &Option<V> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<V> + Send + Sync + 'static,
    {
        let slot = Slot {
            get,
            get_mut,
            json: Some(JsonCodec {
                encode: encode_json::<V>,
                decode: decode_json::<V>,
            }),
            _marker: PhantomData,
        };
        self.insert(tag, false, Box::new(slot))
    }

    /// Registers a field that can only be persisted through a binary type handler.
    ///
    /// Without a registered handler for `V` the field stays in memory.
    pub fn opaque<V, G, M>(self, tag: F, get: G, get_mut: M) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &Option<V> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<V> + Send + Sync + 'static,
    {
        let slot = Slot {
            get,
            get_mut,
            json: None,
            _marker: PhantomData,
        };
        self.insert(tag, false, Box::new(slot))
    }

    /// Registers a field that is never written to disk.
    pub fn memory_only<V, G, M>(self, tag: F, get: G, get_mut: M) -> Self
    where
        V: FieldValue,
        G: Fn(&T) -> &Option<V> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Option<V> + Send + Sync + 'static,
    {
        let slot = Slot {
            get,
            get_mut,
            json: None,
            _marker: PhantomData,
        };
        self.insert(tag, true, Box::new(slot))
    }

    pub fn build(self) -> FieldMap<T, F> {
        FieldMap { slots: self.slots }
    }

    fn insert(mut self, tag: F, memory_only: bool, slot: Box<dyn ErasedSlot<T>>) -> Self {
        let index = tag.index();
        assert!(
            self.slots[index].is_none(),
            "field {tag:?} registered twice on {}",
            type_name::<T>()
        );
        self.slots[index] = Some(FieldDescriptor {
            tag,
            memory_only,
            slot,
        });
        self
    }
}

/// Object safe access to one `Option<V>` slot of `T`.
trait ErasedSlot<T>: Send + Sync {
    fn value_type(&self) -> TypeId;
    fn type_name(&self) -> &'static str;
    fn is_json(&self) -> bool;
    fn needs_release(&self) -> bool;
    fn value_ref<'a>(&self, target: &'a T) -> Option<&'a (dyn Any + Send + Sync)>;
    fn clone_value(&self, target: &T) -> Option<BoxedValue>;
    /// Errors with the expected type name if `value` has the wrong type.
    fn replace(
        &self,
        target: &mut T,
        value: Option<BoxedValue>,
    ) -> Result<Option<BoxedValue>, &'static str>;
    fn is_same_value(&self, a: &T, b: &T) -> bool;
    fn take(&self, target: &mut T) -> Option<BoxedValue>;
    fn release(&self, value: BoxedValue);
    fn to_json(&self, target: &T) -> Option<serde_json::Result<serde_json::Value>>;
    fn from_json(&self, json: serde_json::Value)
    -> Option<serde_json::Result<Option<BoxedValue>>>;
}

struct JsonCodec<V> {
    encode: fn(&V) -> serde_json::Result<serde_json::Value>,
    decode: fn(serde_json::Value) -> serde_json::Result<V>,
}

fn encode_json<V: Serialize>(value: &V) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(value)
}

fn decode_json<V: DeserializeOwned>(json: serde_json::Value) -> serde_json::Result<V> {
    serde_json::from_value(json)
}

struct Slot<T, V, G, M> {
    get: G,
    get_mut: M,
    json: Option<JsonCodec<V>>,
    _marker: PhantomData<fn(&T)>,
}

impl<T, V, G, M> ErasedSlot<T> for Slot<T, V, G, M>
where
    T: 'static,
    V: FieldValue,
    G: Fn(&T) -> &Option<V> + Send + Sync + 'static,
    M: Fn(&mut T) -> &mut Option<V> + Send + Sync + 'static,
{
    fn value_type(&self) -> TypeId {
        TypeId::of::<V>()
    }

    fn type_name(&self) -> &'static str {
        type_name::<V>()
    }

    fn is_json(&self) -> bool {
        self.json.is_some()
    }

    fn needs_release(&self) -> bool {
        V::NEEDS_RELEASE
    }

    fn value_ref<'a>(&self, target: &'a T) -> Option<&'a (dyn Any + Send + Sync)> {
        (self.get)(target)
            .as_ref()
            .map(|value| value as &(dyn Any + Send + Sync))
    }

    fn clone_value(&self, target: &T) -> Option<BoxedValue> {
        (self.get)(target)
            .clone()
            .map(|value| Box::new(value) as BoxedValue)
    }

    fn replace(
        &self,
        target: &mut T,
        value: Option<BoxedValue>,
    ) -> Result<Option<BoxedValue>, &'static str> {
        let value = match value {
            Some(value) => Some(*value.downcast::<V>().map_err(|_| type_name::<V>())?),
            None => None,
        };

        let slot = (self.get_mut)(target);
        let identical = matches!((&*slot, &value), (Some(old), Some(new)) if old.is_same(new));
        let old = std::mem::replace(slot, value);

        Ok(match old {
            Some(old) if !identical => Some(Box::new(old) as BoxedValue),
            _ => None,
        })
    }

    fn is_same_value(&self, a: &T, b: &T) -> bool {
        match ((self.get)(a), (self.get)(b)) {
            (Some(a), Some(b)) => a.is_same(b),
            _ => false,
        }
    }

    fn take(&self, target: &mut T) -> Option<BoxedValue> {
        (self.get_mut)(target)
            .take()
            .map(|value| Box::new(value) as BoxedValue)
    }

    fn release(&self, value: BoxedValue) {
        if let Ok(value) = value.downcast::<V>() {
            value.release();
        }
    }

    fn to_json(&self, target: &T) -> Option<serde_json::Result<serde_json::Value>> {
        let codec = self.json.as_ref()?;
        Some(match (self.get)(target) {
            Some(value) => (codec.encode)(value),
            None => Ok(serde_json::Value::Null),
        })
    }

    fn from_json(
        &self,
        json: serde_json::Value,
    ) -> Option<serde_json::Result<Option<BoxedValue>>> {
        let codec = self.json.as_ref()?;
        Some(match json {
            serde_json::Value::Null => Ok(None),
            json => (codec.decode)(json).map(|value| Some(Box::new(value) as BoxedValue)),
        })
    }
}
