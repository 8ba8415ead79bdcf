//! Payload codecs: turn a single value into bytes and back.
//!
//! The codec is a strategy handed to the controller at construction. Any
//! serializer that can round-trip serde types fits.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::{self, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

pub trait ValueCodec: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

impl ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Default codec: compact JSON per value.
///
/// JSON has no spelling for NaN or the infinities; serde_json would write them
/// as `null` and the peer would fail to decode. They are rejected here instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        value.serialize(FiniteFloats)?;
        serde_json::to_vec(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

/// Walks a value without producing output, failing on the first non-finite float.
#[derive(Clone, Copy)]
struct FiniteFloats;

fn finite(value: f64) -> Result<(), CodecError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CodecError(format!("{value} cannot be represented in JSON")))
    }
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = CodecError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), CodecError> {
        finite(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<(), CodecError> {
        finite(v)
    }
    fn serialize_char(self, _: char) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), CodecError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), CodecError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, CodecError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, CodecError> {
        Ok(self)
    }
}

macro_rules! impl_finite_compound {
    ($($trait:ident => $method:ident),+ $(,)?) => {
        $(
            impl ser::$trait for FiniteFloats {
                type Ok = ();
                type Error = CodecError;

                fn $method<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
                    value.serialize(*self)
                }

                fn end(self) -> Result<(), CodecError> {
                    Ok(())
                }
            }
        )+
    };
}

impl_finite_compound! {
    SerializeSeq => serialize_element,
    SerializeTuple => serialize_element,
    SerializeTupleStruct => serialize_field,
    SerializeTupleVariant => serialize_field,
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CodecError> {
        key.serialize(*self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), CodecError> {
        Ok(())
    }
}
