use std::os::fd::RawFd;

use serde::ser::{self, Serialize};

use super::error::{Error, Result};
use super::fd::FD_TOKEN;
use super::io::WireWrite;
use super::ByteOrder;

/// Streams a record into a [`WireWrite`] field by field; nothing larger than
/// one scalar is ever buffered.
pub struct Serializer<'a> {
    out: &'a mut dyn WireWrite,
    order: ByteOrder,
    fd_field: bool,
}

macro_rules! put_scalar {
    ($name:ident, $ty:ty) => {
        fn $name(&mut self, value: $ty) -> Result<()> {
            match self.order {
                ByteOrder::Host => self.out.write_all(&value.to_ne_bytes()),
                ByteOrder::Network => self.out.write_all(&value.to_be_bytes()),
            }
        }
    };
}

impl<'a> Serializer<'a> {
    pub fn new(out: &'a mut dyn WireWrite) -> Self {
        Serializer {
            out,
            order: ByteOrder::Host,
            fd_field: false,
        }
    }

    pub(crate) fn with_order(out: &'a mut dyn WireWrite, order: ByteOrder) -> Self {
        Serializer {
            out,
            order,
            fd_field: false,
        }
    }

    put_scalar!(put_u16, u16);
    put_scalar!(put_u32, u32);
    put_scalar!(put_u64, u64);
    put_scalar!(put_u128, u128);
    put_scalar!(put_i16, i16);
    put_scalar!(put_i32, i32);
    put_scalar!(put_i64, i64);
    put_scalar!(put_i128, i128);
    put_scalar!(put_f32, f32);
    put_scalar!(put_f64, f64);

    fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::LengthOverflow)?;
        self.put_u32(len)
    }

    fn put_tag(&mut self, tag: &str) -> Result<()> {
        self.put_len(tag.len())?;
        self.out.write_all(tag.as_bytes())
    }
}

impl<'a, 'b> ser::Serializer for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, value: bool) -> Result<()> {
        self.out.write_all(&[u8::from(value)])
    }

    fn serialize_i8(self, value: i8) -> Result<()> {
        self.out.write_all(&value.to_ne_bytes())
    }

    fn serialize_i16(self, value: i16) -> Result<()> {
        self.put_i16(value)
    }

    fn serialize_i32(self, value: i32) -> Result<()> {
        if self.fd_field {
            self.fd_field = false;
            return self.out.send_fd(value as RawFd);
        }
        self.put_i32(value)
    }

    fn serialize_i64(self, value: i64) -> Result<()> {
        self.put_i64(value)
    }

    fn serialize_i128(self, value: i128) -> Result<()> {
        self.put_i128(value)
    }

    fn serialize_u8(self, value: u8) -> Result<()> {
        self.out.write_all(&[value])
    }

    fn serialize_u16(self, value: u16) -> Result<()> {
        self.put_u16(value)
    }

    fn serialize_u32(self, value: u32) -> Result<()> {
        self.put_u32(value)
    }

    fn serialize_u64(self, value: u64) -> Result<()> {
        self.put_u64(value)
    }

    fn serialize_u128(self, value: u128) -> Result<()> {
        self.put_u128(value)
    }

    fn serialize_f32(self, value: f32) -> Result<()> {
        self.put_f32(value)
    }

    fn serialize_f64(self, value: f64) -> Result<()> {
        self.put_f64(value)
    }

    fn serialize_char(self, value: char) -> Result<()> {
        self.put_u32(value as u32)
    }

    fn serialize_str(self, value: &str) -> Result<()> {
        self.put_len(value.len())?;
        self.out.write_all(value.as_bytes())
    }

    fn serialize_bytes(self, value: &[u8]) -> Result<()> {
        self.put_len(value.len())?;
        self.out.write_all(value)
    }

    fn serialize_none(self) -> Result<()> {
        self.out.write_all(&[0])
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<()> {
        self.out.write_all(&[1])?;
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.put_tag(variant)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<()> {
        if name == FD_TOKEN {
            self.fd_field = true;
        }
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()> {
        self.put_tag(variant)?;
        value.serialize(self)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self> {
        let len = len.ok_or(Error::UnsizedSequence)?;
        self.put_len(len)?;
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self> {
        self.put_tag(variant)?;
        Ok(self)
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self> {
        let len = len.ok_or(Error::UnsizedSequence)?;
        self.put_len(len)?;
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self> {
        self.put_tag(variant)?;
        Ok(self)
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

impl<'a, 'b> ser::SerializeSeq for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeTuple for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeTupleStruct for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeTupleVariant for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeMap for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeStruct for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b> ser::SerializeStructVariant for &'b mut Serializer<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
