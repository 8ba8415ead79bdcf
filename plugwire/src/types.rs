//! Wire types and the type registry.
//!
//! A wire type names itself and derives its encode/decode strategy from serde.
//! The registry maps wire names to those strategies so a received
//! `{type_name, payload}` pair can be turned back into a typed value.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::codec::{CodecError, ValueCodec};
use crate::error::Error;
use crate::values::AnyValue;

/// A type whose values may cross the process boundary.
///
/// The wire name must be identical on both sides. Trait objects and closures
/// can never implement this, which keeps them off the wire.
pub trait WireType: Serialize + DeserializeOwned + Send + 'static {
    fn wire_name() -> Cow<'static, str>;
}

/// Implement [`WireType`] for record types under a fixed wire name.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Point { x: i32, y: i32 }
///
/// plugwire::wire_type!(Point => "Point");
/// ```
#[macro_export]
macro_rules! wire_type {
    ($($ty:ty => $name:expr),+ $(,)?) => {
        $(
            impl $crate::WireType for $ty {
                fn wire_name() -> ::std::borrow::Cow<'static, str> {
                    ::std::borrow::Cow::Borrowed($name)
                }
            }
        )+
    };
}

wire_type! {
    bool => "bool",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    isize => "isize",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    usize => "usize",
    f32 => "f32",
    f64 => "f64",
    char => "char",
    String => "string",
}

impl<T: WireType> WireType for Vec<T> {
    fn wire_name() -> Cow<'static, str> {
        Cow::Owned(format!("[]{}", T::wire_name()))
    }
}

impl<T: WireType, const N: usize> WireType for [T; N]
where
    [T; N]: Serialize + DeserializeOwned,
{
    fn wire_name() -> Cow<'static, str> {
        Cow::Owned(format!("[{N}]{}", T::wire_name()))
    }
}

/// Complex number with `f32` components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Complex32 {
    pub re: f32,
    pub im: f32,
}

/// Complex number with `f64` components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex32 {
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }
}

impl Complex64 {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

wire_type! {
    Complex32 => "complex32",
    Complex64 => "complex64",
}

type EncodeFn<C> = fn(&C, &dyn Any) -> Result<Vec<u8>, CodecError>;
type DecodeFn<C> = fn(&C, &[u8]) -> Result<AnyValue, CodecError>;

/// Registered type descriptor: wire name plus its encode/decode strategy.
pub struct TypeEntry<C> {
    name: Cow<'static, str>,
    type_id: TypeId,
    rust_name: &'static str,
    encode: EncodeFn<C>,
    decode: DecodeFn<C>,
}

impl<C> Clone for TypeEntry<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            type_id: self.type_id,
            rust_name: self.rust_name,
            encode: self.encode,
            decode: self.decode,
        }
    }
}

impl<C> fmt::Debug for TypeEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeEntry")
            .field("name", &self.name)
            .field("rust_name", &self.rust_name)
            .finish()
    }
}

fn encode_erased<C: ValueCodec, T: WireType>(
    codec: &C,
    value: &dyn Any,
) -> Result<Vec<u8>, CodecError> {
    let value = value.downcast_ref::<T>().ok_or_else(|| {
        CodecError(format!("value is not a {}", std::any::type_name::<T>()))
    })?;
    codec.encode(value)
}

fn decode_erased<C: ValueCodec, T: WireType>(
    codec: &C,
    bytes: &[u8],
) -> Result<AnyValue, CodecError> {
    let value: T = codec.decode(bytes)?;
    Ok(Box::new(value))
}

impl<C: ValueCodec> TypeEntry<C> {
    pub fn of<T: WireType>() -> Self {
        Self {
            name: T::wire_name(),
            type_id: TypeId::of::<T>(),
            rust_name: std::any::type_name::<T>(),
            encode: encode_erased::<C, T>,
            decode: decode_erased::<C, T>,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rust_name(&self) -> &'static str {
        self.rust_name
    }

    pub(crate) fn encode(&self, codec: &C, value: &dyn Any) -> Result<Vec<u8>, Error> {
        (self.encode)(codec, value).map_err(|e| Error::EncodeFailure {
            type_name: self.name.to_string(),
            reason: e.0,
        })
    }

    pub(crate) fn decode(&self, codec: &C, bytes: &[u8]) -> Result<AnyValue, Error> {
        (self.decode)(codec, bytes).map_err(|e| Error::DecodeFailure {
            type_name: self.name.to_string(),
            reason: e.0,
        })
    }
}

/// Wire name → type descriptor.
pub struct TypeRegistry<C> {
    by_name: HashMap<String, TypeEntry<C>>,
    by_id: HashMap<TypeId, String>,
}

impl<C> Default for TypeRegistry<C> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<C> fmt::Debug for TypeRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_name.keys()).finish()
    }
}

impl<C: ValueCodec> TypeRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single type, returning its wire name.
    pub fn register<T: WireType>(&mut self) -> Result<String, Error> {
        let entry = TypeEntry::<C>::of::<T>();
        let name = entry.name().to_string();
        self.insert_all(vec![entry])?;
        Ok(name)
    }

    /// Register a batch of types. Nothing is inserted unless every entry is valid.
    pub fn insert_all(&mut self, entries: Vec<TypeEntry<C>>) -> Result<(), Error> {
        let mut staged: HashMap<&str, TypeId> = HashMap::new();
        for entry in &entries {
            if entry.name.is_empty() {
                return Err(Error::UnsupportedType(format!(
                    "{} has an empty wire name",
                    entry.rust_name
                )));
            }
            let bound = self
                .by_name
                .get(entry.name())
                .map(|existing| existing.type_id)
                .or_else(|| staged.get(entry.name()).copied());
            if let Some(type_id) = bound
                && type_id != entry.type_id
            {
                return Err(Error::InvalidRegistration(format!(
                    "wire name `{}` is already bound to a different type than {}",
                    entry.name, entry.rust_name
                )));
            }
            staged.insert(entry.name(), entry.type_id);
        }

        for entry in entries {
            if self.by_name.contains_key(entry.name()) {
                continue;
            }
            tracing::trace!(name = %entry.name, rust_name = entry.rust_name, "Registered wire type");
            self.by_id.insert(entry.type_id, entry.name.to_string());
            self.by_name.insert(entry.name.to_string(), entry);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeEntry<C>> {
        self.by_name.get(name)
    }

    /// Find the descriptor for a dynamically typed value.
    pub fn lookup_value(&self, value: &dyn Any) -> Option<&TypeEntry<C>> {
        let name = self.by_id.get(&value.type_id())?;
        self.by_name.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Registered wire names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
