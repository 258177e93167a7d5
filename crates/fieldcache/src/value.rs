use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

/// A value that owns a resource which has to be released explicitly, like a decoded image
/// buffer or an OS handle.
///
/// Cache fields holding such values store them as `Arc<T>`. When a field is overwritten
/// with a different value, or the cache is cleared, the superseded value is released
/// exactly once.
pub trait Release: Send + Sync + 'static {
    /// Releases the underlying resource.
    fn release(&self);
}

/// A value that can be stored in a cached field.
///
/// Plain data only needs the marker impl. Values owning a resource get their release and
/// identity semantics through the `Arc<T: Release>` impl.
pub trait FieldValue: Clone + Send + Sync + 'static {
    /// Whether values of this type have to be released when replaced.
    const NEEDS_RELEASE: bool = false;

    /// Releases the resource held by this value.
    fn release(&self) {}

    /// Returns `true` if `other` is the very same value, in which case it is not released
    /// when stored again.
    fn is_same(&self, _other: &Self) -> bool {
        false
    }
}

impl<T: Release + ?Sized> FieldValue for Arc<T> {
    const NEEDS_RELEASE: bool = true;

    fn release(&self) {
        T::release(self)
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

macro_rules! plain_field_values {
    ($($ty:ty),* $(,)?) => {
        $(impl FieldValue for $ty {})*
    };
}

plain_field_values!(
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    usize,
    f32,
    f64,
    String,
    DateTime<Utc>,
    NaiveDate,
    serde_json::Value,
);

impl<T: Clone + Send + Sync + 'static> FieldValue for Vec<T> {}

impl<K, V> FieldValue for BTreeMap<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
}
