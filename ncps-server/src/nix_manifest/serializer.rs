//! The serializer.
//!
//! This maps the serde data model back into the flat `Key: Value` manifest
//! format, mirroring `deserializer.rs`.

use serde::{ser, Serialize};

use super::{Error, Result};

/// The main serializer.
///
/// Top-level output must be a struct or map: each field becomes one
/// `Key: Value` line, in declaration order, terminated by `\n`.
pub struct Serializer {
    output: String,
}

/// Serializer for a single value, once the key has already been written.
pub struct ValueSerializer<'a> {
    output: &'a mut String,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            output: String::new(),
        }
    }

    pub fn into_output(self) -> String {
        self.output
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = ser::Impossible<(), Error>;
    type SerializeTuple = ser::Impossible<(), Error>;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, _v: bool) -> Result<()> {
        Err(Error::Unsupported("Top-level boolean"))
    }
    fn serialize_i8(self, _v: i8) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_i16(self, _v: i16) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_i32(self, _v: i32) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_i64(self, _v: i64) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_u8(self, _v: u8) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_u16(self, _v: u16) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_u32(self, _v: u32) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_u64(self, _v: u64) -> Result<()> {
        Err(Error::Unsupported("Top-level integer"))
    }
    fn serialize_f32(self, _v: f32) -> Result<()> {
        Err(Error::FloatUnsupported)
    }
    fn serialize_f64(self, _v: f64) -> Result<()> {
        Err(Error::FloatUnsupported)
    }
    fn serialize_char(self, _v: char) -> Result<()> {
        Err(Error::Unsupported("Top-level char"))
    }
    fn serialize_str(self, _v: &str) -> Result<()> {
        Err(Error::Unsupported("Top-level string"))
    }
    fn serialize_bytes(self, _v: &[u8]) -> Result<()> {
        Err(Error::Unsupported("Byte sequence"))
    }
    fn serialize_none(self) -> Result<()> {
        Err(Error::NoneUnsupported)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<()> {
        Err(Error::Unsupported("Unit"))
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        Err(Error::Unsupported("Unit struct"))
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<()> {
        Err(Error::Unsupported("Unit variant"))
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<()> {
        Err(Error::Unsupported("Newtype variant"))
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("Top-level sequence"))
    }
    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("Top-level tuple"))
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("Tuple struct"))
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("Tuple variant"))
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(self)
    }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("Struct variant"))
    }
}

impl<'a> ser::SerializeMap for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
        let mut buf = String::new();
        key.serialize(&mut ValueSerializer { output: &mut buf })?;
        self.output.push_str(&buf);
        self.output.push_str(": ");
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        // Skipped `None` fields never reach here: serde_with / serde's
        // `skip_serializing_if` drops the map entry entirely before
        // `serialize_value` is called.
        value.serialize(&mut ValueSerializer {
            output: &mut self.output,
        })?;
        self.output.push('\n');
        Ok(())
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        // Fields that serialize to `None` are dropped by
        // `#[serde(skip_serializing_if = "Option::is_none")]` on the
        // struct before reaching here.
        self.output.push_str(key);
        self.output.push_str(": ");
        value.serialize(&mut ValueSerializer {
            output: &mut self.output,
        })?;
        self.output.push('\n');
        Ok(())
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a> ser::Serializer for &'a mut ValueSerializer<'a> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = ser::Impossible<(), Error>;
    type SerializeTuple = ser::Impossible<(), Error>;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = ser::Impossible<(), Error>;
    type SerializeStruct = ser::Impossible<(), Error>;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.output.push_str(if v { "1" } else { "0" });
        Ok(())
    }
    fn serialize_i8(self, v: i8) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_i16(self, v: i16) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_i32(self, v: i32) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_i64(self, v: i64) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_u8(self, v: u8) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_u16(self, v: u16) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_u32(self, v: u32) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_u64(self, v: u64) -> Result<()> {
        self.output.push_str(&v.to_string());
        Ok(())
    }
    fn serialize_f32(self, _v: f32) -> Result<()> {
        Err(Error::FloatUnsupported)
    }
    fn serialize_f64(self, _v: f64) -> Result<()> {
        Err(Error::FloatUnsupported)
    }
    fn serialize_char(self, v: char) -> Result<()> {
        self.output.push(v);
        Ok(())
    }
    fn serialize_str(self, v: &str) -> Result<()> {
        if v.contains('\n') {
            return Err(Error::Unsupported("Multi-line value"));
        }
        self.output.push_str(v);
        Ok(())
    }
    fn serialize_bytes(self, _v: &[u8]) -> Result<()> {
        Err(Error::Unsupported("Byte sequence"))
    }
    fn serialize_none(self) -> Result<()> {
        Err(Error::NoneUnsupported)
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<()> {
        Err(Error::Unsupported("Unit"))
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        Err(Error::Unsupported("Unit struct"))
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.output.push_str(variant);
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<()> {
        Err(Error::Unsupported("Newtype variant"))
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("Sequence"))
    }
    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("Tuple"))
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("Tuple struct"))
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("Tuple variant"))
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::NestedMapUnsupported)
    }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Err(Error::NestedMapUnsupported)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("Struct variant"))
    }
}

/// Serializes a space-delimited list value (e.g. `SpaceDelimitedList`), which
/// arrives here already flattened into a single string by `serde_with`.
impl<'a> ValueSerializer<'a> {
    #[allow(dead_code)]
    fn write_raw(&mut self, s: &str) {
        self.output.push_str(s);
    }
}
