use std::fmt::{Debug, Display};
use std::str::FromStr;

use half::f16;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ChunkError;

pub trait NBytes {
    /// Number of bytes in the data type
    fn nbytes(&self) -> usize;

    /// Number of bits in the data type
    fn nbits(&self) -> usize {
        self.nbytes() * 8
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSize {
    b8,
    b16,
    b32,
    b64,
}

impl NBytes for IntSize {
    fn nbytes(&self) -> usize {
        match self {
            Self::b8 => 1,
            Self::b16 => 2,
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

impl TryFrom<usize> for IntSize {
    type Error = &'static str;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Self::b8),
            16 => Ok(Self::b16),
            32 => Ok(Self::b32),
            64 => Ok(Self::b64),
            _ => Err("Invalid integer width"),
        }
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSize {
    b16,
    b32,
    b64,
}

impl NBytes for FloatSize {
    fn nbytes(&self) -> usize {
        match self {
            Self::b16 => 2,
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

impl TryFrom<usize> for FloatSize {
    type Error = &'static str;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            16 => Ok(Self::b16),
            32 => Ok(Self::b32),
            64 => Ok(Self::b64),
            _ => Err("Invalid float width"),
        }
    }
}

/// Element type of a tensor.
///
/// Rendered as `"uint8"`, `"float32"` etc. in metadata; stored as a one-byte
/// code in the chunk header tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int(IntSize),
    UInt(IntSize),
    Float(FloatSize),
}

impl NBytes for DataType {
    fn nbytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int(s) | Self::UInt(s) => s.nbytes(),
            Self::Float(s) => s.nbytes(),
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nbits = self.nbits();
        let s = match self {
            Self::Bool => "bool".into(),
            Self::Int(_) => format!("int{nbits}"),
            Self::UInt(_) => format!("uint{nbits}"),
            Self::Float(_) => format!("float{nbits}"),
        };
        write!(f, "{}", s)
    }
}

fn split_str_num(s: &str) -> (&str, Option<usize>) {
    if let Some(idx) = s.find(|c: char| c.is_ascii_digit()) {
        (&s[0..idx], s[idx..].parse().ok())
    } else {
        (s, None)
    }
}

impl FromStr for DataType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, nbits) = split_str_num(s);
        if let Some(n) = nbits {
            match name {
                "int" => Ok(Self::Int(n.try_into()?)),
                "uint" => Ok(Self::UInt(n.try_into()?)),
                "float" => Ok(Self::Float(n.try_into()?)),
                _ => Err("Unknown data type"),
            }
        } else if name == "bool" {
            Ok(Self::Bool)
        } else {
            Err("Could not parse data type")
        }
    }
}

impl Serialize for DataType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl DataType {
    /// One-byte code used in the chunk wire format.
    pub fn code(&self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::UInt(IntSize::b8) => 1,
            Self::UInt(IntSize::b16) => 2,
            Self::UInt(IntSize::b32) => 3,
            Self::UInt(IntSize::b64) => 4,
            Self::Int(IntSize::b8) => 5,
            Self::Int(IntSize::b16) => 6,
            Self::Int(IntSize::b32) => 7,
            Self::Int(IntSize::b64) => 8,
            Self::Float(FloatSize::b16) => 9,
            Self::Float(FloatSize::b32) => 10,
            Self::Float(FloatSize::b64) => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let dt = match code {
            0 => Self::Bool,
            1 => Self::UInt(IntSize::b8),
            2 => Self::UInt(IntSize::b16),
            3 => Self::UInt(IntSize::b32),
            4 => Self::UInt(IntSize::b64),
            5 => Self::Int(IntSize::b8),
            6 => Self::Int(IntSize::b16),
            7 => Self::Int(IntSize::b32),
            8 => Self::Int(IntSize::b64),
            9 => Self::Float(FloatSize::b16),
            10 => Self::Float(FloatSize::b32),
            11 => Self::Float(FloatSize::b64),
            _ => return None,
        };
        Some(dt)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_) | Self::UInt(_))
    }
}

/// High-level semantic type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Htype {
    Generic,
    Image,
    ClassLabel,
    Text,
    Json,
    List,
}

impl Default for Htype {
    fn default() -> Self {
        Self::Generic
    }
}

impl Htype {
    /// Text-like tensors store serialized text/JSON rather than numeric data.
    pub fn is_text_like(&self) -> bool {
        matches!(self, Self::Text | Self::Json | Self::List)
    }
}

impl Display for Htype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generic => "generic",
            Self::Image => "image",
            Self::ClassLabel => "class_label",
            Self::Text => "text",
            Self::Json => "json",
            Self::List => "list",
        };
        f.write_str(s)
    }
}

/// Trait implemented by primitive types that can live in a tensor.
///
/// Bytes are always little-endian, matching the chunk wire format.
pub trait ReflectedType:
    Send + Sync + Clone + Copy + Default + PartialEq + Debug + 'static
{
    const DTYPE: DataType;

    fn write_le(&self, out: &mut Vec<u8>);

    /// Reads one value from a buffer of exactly `DTYPE.nbytes()` bytes.
    fn read_le(buf: &[u8]) -> Self;
}

macro_rules! reflected_primitive {
    ($t:ty, $dtype:expr) => {
        impl ReflectedType for $t {
            const DTYPE: DataType = $dtype;

            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(buf: &[u8]) -> Self {
                Self::from_le_bytes(buf.try_into().expect("buffer length mismatch"))
            }
        }
    };
}

reflected_primitive!(u8, DataType::UInt(IntSize::b8));
reflected_primitive!(u16, DataType::UInt(IntSize::b16));
reflected_primitive!(u32, DataType::UInt(IntSize::b32));
reflected_primitive!(u64, DataType::UInt(IntSize::b64));
reflected_primitive!(i8, DataType::Int(IntSize::b8));
reflected_primitive!(i16, DataType::Int(IntSize::b16));
reflected_primitive!(i32, DataType::Int(IntSize::b32));
reflected_primitive!(i64, DataType::Int(IntSize::b64));
reflected_primitive!(f32, DataType::Float(FloatSize::b32));
reflected_primitive!(f64, DataType::Float(FloatSize::b64));
reflected_primitive!(f16, DataType::Float(FloatSize::b16));

impl ReflectedType for bool {
    const DTYPE: DataType = DataType::Bool;

    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn read_le(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

/// A single element lifted out of a raw buffer while casting.
#[derive(Debug, Clone, Copy)]
enum CastScalar {
    Int(i128),
    Float(f64),
}

fn read_scalar(buf: &[u8], dtype: DataType) -> CastScalar {
    use num_traits::ToPrimitive;

    let int = |v: Option<i128>| CastScalar::Int(v.expect("integer widening cannot fail"));
    match dtype {
        DataType::Bool => CastScalar::Int((buf[0] != 0) as i128),
        DataType::UInt(IntSize::b8) => int(u8::read_le(buf).to_i128()),
        DataType::UInt(IntSize::b16) => int(u16::read_le(buf).to_i128()),
        DataType::UInt(IntSize::b32) => int(u32::read_le(buf).to_i128()),
        DataType::UInt(IntSize::b64) => int(u64::read_le(buf).to_i128()),
        DataType::Int(IntSize::b8) => int(i8::read_le(buf).to_i128()),
        DataType::Int(IntSize::b16) => int(i16::read_le(buf).to_i128()),
        DataType::Int(IntSize::b32) => int(i32::read_le(buf).to_i128()),
        DataType::Int(IntSize::b64) => int(i64::read_le(buf).to_i128()),
        DataType::Float(FloatSize::b16) => CastScalar::Float(f16::read_le(buf).to_f64()),
        DataType::Float(FloatSize::b32) => CastScalar::Float(f32::read_le(buf) as f64),
        DataType::Float(FloatSize::b64) => CastScalar::Float(f64::read_le(buf)),
    }
}

fn int_range(dtype: DataType) -> (i128, i128) {
    match dtype {
        DataType::Bool => (0, 1),
        DataType::UInt(s) => (0, (1i128 << (s.nbytes() * 8)) - 1),
        DataType::Int(s) => {
            let bits = s.nbytes() as u32 * 8;
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        }
        DataType::Float(_) => unreachable!("float has no integer range"),
    }
}

fn write_scalar(
    out: &mut Vec<u8>,
    value: CastScalar,
    to: DataType,
    from: DataType,
) -> Result<(), ChunkError> {
    let cast_err = || ChunkError::DTypeCast { from, to };
    match (value, to) {
        (CastScalar::Int(v), DataType::Bool)
        | (CastScalar::Int(v), DataType::UInt(_))
        | (CastScalar::Int(v), DataType::Int(_)) => {
            let (lo, hi) = int_range(to);
            if v < lo || v > hi {
                return Err(cast_err());
            }
            let le = (v as u64).to_le_bytes();
            out.extend_from_slice(&le[..to.nbytes()]);
            Ok(())
        }
        (CastScalar::Int(v), DataType::Float(s)) => {
            let f = v as f64;
            match s {
                FloatSize::b16 => f16::from_f64(f).write_le(out),
                FloatSize::b32 => (f as f32).write_le(out),
                FloatSize::b64 => f.write_le(out),
            }
            Ok(())
        }
        (CastScalar::Float(f), DataType::Float(s)) => {
            match s {
                FloatSize::b16 => f16::from_f64(f).write_le(out),
                FloatSize::b32 => (f as f32).write_le(out),
                FloatSize::b64 => f.write_le(out),
            }
            Ok(())
        }
        // float -> integer discards fractional data
        (CastScalar::Float(_), _) => Err(cast_err()),
    }
}

/// Casts a raw little-endian element buffer from one dtype to another.
///
/// Integer narrowing is checked per element; a float source may only land in
/// a float target. Anything else is a refused lossy cast.
pub fn cast_bytes(bytes: &[u8], from: DataType, to: DataType) -> Result<Vec<u8>, ChunkError> {
    if from == to {
        return Ok(bytes.to_vec());
    }
    if from.is_float() && !to.is_float() {
        return Err(ChunkError::DTypeCast { from, to });
    }
    let in_size = from.nbytes();
    debug_assert_eq!(bytes.len() % in_size, 0);
    let count = bytes.len() / in_size;
    let mut out = Vec::with_capacity(count * to.nbytes());
    for i in 0..count {
        let v = read_scalar(&bytes[i * in_size..(i + 1) * in_size], from);
        write_scalar(&mut out, v, to, from)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_name_roundtrip() {
        for dt in [
            DataType::Bool,
            DataType::UInt(IntSize::b8),
            DataType::Int(IntSize::b64),
            DataType::Float(FloatSize::b16),
            DataType::Float(FloatSize::b64),
        ] {
            let parsed: DataType = dt.to_string().parse().unwrap();
            assert_eq!(parsed, dt);
            assert_eq!(DataType::from_code(dt.code()), Some(dt));
        }
    }

    #[test]
    fn cast_widens_ints() {
        let src: Vec<u8> = vec![1, 2, 250];
        let out = cast_bytes(&src, DataType::UInt(IntSize::b8), DataType::Int(IntSize::b32))
            .unwrap();
        let vals: Vec<i32> = out.chunks(4).map(i32::read_le).collect();
        assert_eq!(vals, vec![1, 2, 250]);
    }

    #[test]
    fn cast_checks_range() {
        let mut src = Vec::new();
        300i32.write_le(&mut src);
        let err = cast_bytes(&src, DataType::Int(IntSize::b32), DataType::UInt(IntSize::b8))
            .unwrap_err();
        assert!(matches!(err, ChunkError::DTypeCast { .. }));
    }

    #[test]
    fn cast_refuses_float_to_int() {
        let mut src = Vec::new();
        1.5f32.write_le(&mut src);
        let err = cast_bytes(&src, DataType::Float(FloatSize::b32), DataType::Int(IntSize::b32))
            .unwrap_err();
        assert!(matches!(err, ChunkError::DTypeCast { .. }));
    }

    #[test]
    fn cast_int_to_float() {
        let mut src = Vec::new();
        7u16.write_le(&mut src);
        let out =
            cast_bytes(&src, DataType::UInt(IntSize::b16), DataType::Float(FloatSize::b64))
                .unwrap();
        assert_eq!(f64::read_le(&out), 7.0);
    }
}
