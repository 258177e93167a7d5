//! Binary persistence for field value types without a JSON representation.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::field::BoxedValue;
use crate::value::FieldValue;

/// Encodes and decodes values of type `T` to and from a binary sidecar file.
pub trait BinaryCodec<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T, writer: &mut dyn Write) -> io::Result<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> io::Result<T>;
}

/// A [`BinaryCodec`] with its value type erased.
pub(crate) trait ErasedHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn serialize(&self, value: &(dyn Any + Send + Sync), writer: &mut dyn Write)
    -> io::Result<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> io::Result<BoxedValue>;
}

struct Handler<T, C> {
    codec: C,
    _value: PhantomData<fn() -> T>,
}

impl<T: FieldValue, C: BinaryCodec<T>> ErasedHandler for Handler<T, C> {
    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn serialize(
        &self,
        value: &(dyn Any + Send + Sync),
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected a value of type `{}`", type_name::<T>()),
            )
        })?;
        self.codec.serialize(value, writer)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> io::Result<BoxedValue> {
        let value = self.codec.deserialize(reader)?;
        Ok(Box::new(value))
    }
}

/// Binary codecs keyed by the value type they handle.
///
/// A field whose value type has a registered handler is persisted to a sidecar file next
/// to the snapshot envelope, even if it also has a JSON representation.
#[derive(Clone, Default)]
pub struct TypeHandlers {
    handlers: HashMap<TypeId, Arc<dyn ErasedHandler>>,
}

impl TypeHandlers {
    /// Registers `codec` for values of type `T`, replacing any previous handler.
    pub fn register<T, C>(&mut self, codec: C)
    where
        T: FieldValue,
        C: BinaryCodec<T>,
    {
        let handler = Handler {
            codec,
            _value: PhantomData,
        };
        self.handlers.insert(TypeId::of::<T>(), Arc::new(handler));
    }

    pub fn contains(&self, value_type: TypeId) -> bool {
        self.handlers.contains_key(&value_type)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, value_type: TypeId) -> Option<&dyn ErasedHandler> {
        self.handlers.get(&value_type).map(|handler| &**handler)
    }
}

impl fmt::Debug for TypeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.handlers.values().map(|handler| handler.type_name()))
            .finish()
    }
}
