//! Typed values over the payload primitives.
//!
//! [`WireValue`] is what hand-written (or generated) stubs implement for
//! their argument and return types. Composites emit members in declaration
//! order; nullable references go through `Option<T>`. The encoding of a
//! value depends only on the value itself, which is what makes responses
//! reproducible across endpoints.

use crate::payload::{Decimal, PayloadReader, PayloadWriter, WireError};

/// A value with a deterministic wire form.
pub trait WireValue: Sized {
    /// Append the value to the payload.
    fn emit(&self, w: &mut PayloadWriter);

    /// Parse the value from the payload.
    fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError>;
}

/// Lifecycle hooks a materialised type may opt into.
///
/// The read pump calls `before_deserialize` right before member parsing and
/// `after_deserialize` right after, single-threaded. The default impls do
/// nothing.
pub trait MaterializeHooks {
    /// Called before the member list is parsed.
    fn before_deserialize(&mut self) {}

    /// Called after the member list has been parsed.
    fn after_deserialize(&mut self) {}
}

macro_rules! primitive_wire_value {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl WireValue for $ty {
                fn emit(&self, w: &mut PayloadWriter) {
                    w.$write(*self);
                }

                fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
                    r.$read()
                }
            }
        )*
    };
}

primitive_wire_value! {
    i8 => write_i8, read_i8;
    u8 => write_u8, read_u8;
    i16 => write_i16, read_i16;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    bool => write_bool, read_bool;
    Decimal => write_decimal, read_decimal;
}

impl WireValue for String {
    fn emit(&self, w: &mut PayloadWriter) {
        // Strings above the u16 prefix cannot exist on the wire; emit the
        // prefix-sized cut rather than corrupting the stream.
        let mut cut = self.len().min(u16::MAX as usize);
        while !self.is_char_boundary(cut) {
            cut -= 1;
        }
        w.write_str(&self[..cut])
            .expect("length capped to prefix range");
    }

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(r.read_str()?.to_owned())
    }
}

impl<T: WireValue> WireValue for Option<T> {
    fn emit(&self, w: &mut PayloadWriter) {
        match self {
            None => w.write_u8(0),
            Some(v) => {
                w.write_u8(1);
                v.emit(w);
            }
        }
    }

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        match r.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::parse(r)?)),
            other => Err(WireError::InvalidNullMarker(other)),
        }
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn emit(&self, w: &mut PayloadWriter) {
        w.write_u32(self.len() as u32);
        for item in self {
            item.emit(w);
        }
    }

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let len = r.read_u32()? as usize;
        // Guard against a hostile length prefix: each element takes at
        // least one byte, so the declared count cannot exceed what's left.
        if len > r.remaining() {
            return Err(WireError::Truncated);
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::parse(r)?);
        }
        Ok(out)
    }
}

impl WireValue for () {
    fn emit(&self, _w: &mut PayloadWriter) {}

    fn parse(_r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        Ok(())
    }
}

macro_rules! tuple_wire_value {
    ($($name:ident),+) => {
        impl<$($name: WireValue),+> WireValue for ($($name,)+) {
            fn emit(&self, w: &mut PayloadWriter) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.emit(w);)+
            }

            fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
                Ok(($($name::parse(r)?,)+))
            }
        }
    };
}

tuple_wire_value!(A);
tuple_wire_value!(A, B);
tuple_wire_value!(A, B, C);
tuple_wire_value!(A, B, C, D);

/// Encode a value into a fresh payload buffer.
pub fn encode_value<T: WireValue>(value: &T) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    value.emit(&mut w);
    w.into_bytes()
}

/// Decode a value from payload bytes, requiring every byte to be consumed.
pub fn decode_value<T: WireValue>(payload: &[u8]) -> Result<T, WireError> {
    let mut r = PayloadReader::new(payload);
    let value = T::parse(&mut r)?;
    if !r.is_exhausted() {
        return Err(WireError::Truncated);
    }
    Ok(value)
}
