//! Scalar types, scalar values and the widening lattice.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// The closed set of scalar types a tuple field or expression can take.
///
/// `Num` and `Any` are abstract placeholders that only exist while type
/// inference is running: `Num` is "some numeric type, width still unknown"
/// (the type of an unsuffixed integer literal), `Any` is "completely
/// unknown". Neither may survive in a finished schema.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Float,
    String,
    U8,
    U16,
    U32,
    U64,
    U128,
    I8,
    I16,
    I32,
    I64,
    I128,
    Ip4,
    Ip6,
    Cidr4,
    Cidr6,
    Num,
    Any,
}

/// Concrete numeric types ordered so that a linear scan finds the least
/// widening first. Used by [`larger_type`].
const NUMERIC_LADDER: [ScalarType; 11] = [
    ScalarType::U8,
    ScalarType::I8,
    ScalarType::U16,
    ScalarType::I16,
    ScalarType::U32,
    ScalarType::I32,
    ScalarType::U64,
    ScalarType::I64,
    ScalarType::U128,
    ScalarType::I128,
    ScalarType::Float,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("types {0} and {1} are incompatible")]
    Incompatible(ScalarType, ScalarType),
    #[error("nullability of {0} is already known and disagrees")]
    NullabilityConflict(String),
}

impl ScalarType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
                | Self::U128
                | Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::I128
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::I128)
    }

    /// Width in bits of an integer type.
    pub fn int_width(&self) -> Option<u32> {
        match self {
            Self::U8 | Self::I8 => Some(8),
            Self::U16 | Self::I16 => Some(16),
            Self::U32 | Self::I32 => Some(32),
            Self::U64 | Self::I64 => Some(64),
            Self::U128 | Self::I128 => Some(128),
            _ => None,
        }
    }

    /// True for integers, floats and the abstract `Num`.
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Self::Float | Self::Num)
    }

    /// True for the abstract placeholders that must not survive typing.
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Num | Self::Any)
    }
}

/// Reachability in the widening lattice: can a value of type `from` be
/// used where a `to` is expected without loss?
///
/// The numeric rules, spelled out:
/// - `u{a} → u{b}` and `i{a} → i{b}` require `b ≥ a`;
/// - `u{a} → i{b}` requires `b > 2a` (an unsigned value crossing into
///   signed territory always costs a width bump, so `u8 ⊔ i16 = i32`);
/// - signed never widens to unsigned;
/// - `bool` widens to any integer, any number widens to `float`;
/// - `Any` widens to everything, `Num` to every numeric.
pub fn can_cast(from: ScalarType, to: ScalarType) -> bool {
    use ScalarType::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (Any, _) => true,
        (Num, t) => t.is_numeric(),
        (Bool, t) => t.is_numeric(),
        (f, Float) if f.is_integer() => true,
        (f, t) if f.is_integer() && t.is_integer() => {
            let (fw, tw) = (f.int_width().unwrap(), t.int_width().unwrap());
            match (f.is_signed(), t.is_signed()) {
                (false, false) | (true, true) => tw >= fw,
                (false, true) => tw > 2 * fw,
                (true, false) => false,
            }
        }
        _ => false,
    }
}

/// Least common widening of two scalar types, when one exists.
///
/// For numerics this scans the ladder and returns the first type both
/// arguments cast to, so the result is minimal by construction.
pub fn larger_type(a: ScalarType, b: ScalarType) -> Result<ScalarType, TypeError> {
    use ScalarType::*;
    if a == b {
        return Ok(a);
    }
    match (a, b) {
        (Any, t) | (t, Any) => Ok(t),
        (Num, t) | (t, Num) if t.is_numeric() => Ok(t),
        (Bool, t) | (t, Bool) if t.is_numeric() => Ok(t),
        _ if a.is_numeric() && b.is_numeric() => NUMERIC_LADDER
            .iter()
            .copied()
            .find(|&c| can_cast(a, c) && can_cast(b, c))
            .ok_or(TypeError::Incompatible(a, b)),
        _ => Err(TypeError::Incompatible(a, b)),
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bool => "bool",
            Self::Float => "float",
            Self::String => "string",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::U128 => "u128",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::I128 => "i128",
            Self::Ip4 => "ip4",
            Self::Ip6 => "ip6",
            Self::Cidr4 => "cidr4",
            Self::Cidr6 => "cidr6",
            Self::Num => "num",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for ScalarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "bool" => Self::Bool,
            "float" => Self::Float,
            "string" => Self::String,
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "u128" => Self::U128,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "i128" => Self::I128,
            "ip4" => Self::Ip4,
            "ip6" => Self::Ip6,
            "cidr4" => Self::Cidr4,
            "cidr6" => Self::Cidr6,
            _ => return Err(format!("unknown scalar type '{s}'")),
        })
    }
}

/// A scalar value: a concrete value of some scalar type, or the
/// distinguished `Null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Float(f64),
    String(String),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Cidr4 { addr: Ipv4Addr, prefix: u8 },
    Cidr6 { addr: Ipv6Addr, prefix: u8 },
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The type of this value; `None` for `Null`.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => ScalarType::Bool,
            Self::Float(_) => ScalarType::Float,
            Self::String(_) => ScalarType::String,
            Self::U8(_) => ScalarType::U8,
            Self::U16(_) => ScalarType::U16,
            Self::U32(_) => ScalarType::U32,
            Self::U64(_) => ScalarType::U64,
            Self::U128(_) => ScalarType::U128,
            Self::I8(_) => ScalarType::I8,
            Self::I16(_) => ScalarType::I16,
            Self::I32(_) => ScalarType::I32,
            Self::I64(_) => ScalarType::I64,
            Self::I128(_) => ScalarType::I128,
            Self::Ip4(_) => ScalarType::Ip4,
            Self::Ip6(_) => ScalarType::Ip6,
            Self::Cidr4 { .. } => ScalarType::Cidr4,
            Self::Cidr6 { .. } => ScalarType::Cidr6,
        })
    }

    /// Numeric view as `f64` (bools count as 0/1).
    pub fn to_f64(&self) -> Option<f64> {
        Some(match self {
            Self::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Float(f) => *f,
            Self::U8(v) => *v as f64,
            Self::U16(v) => *v as f64,
            Self::U32(v) => *v as f64,
            Self::U64(v) => *v as f64,
            Self::U128(v) => *v as f64,
            Self::I8(v) => *v as f64,
            Self::I16(v) => *v as f64,
            Self::I32(v) => *v as f64,
            Self::I64(v) => *v as f64,
            Self::I128(v) => *v as f64,
            _ => return None,
        })
    }

    /// Integer view as `i128` (bools count as 0/1); floats are excluded.
    pub fn to_i128(&self) -> Option<i128> {
        Some(match self {
            Self::Bool(b) => *b as i128,
            Self::U8(v) => *v as i128,
            Self::U16(v) => *v as i128,
            Self::U32(v) => *v as i128,
            Self::U64(v) => *v as i128,
            Self::U128(v) => *v as i128,
            Self::I8(v) => *v as i128,
            Self::I16(v) => *v as i128,
            Self::I32(v) => *v as i128,
            Self::I64(v) => *v as i128,
            Self::I128(v) => *v,
            _ => return None,
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Build an integer value of type `to` from an `i128`, if it fits.
    pub fn int_of(to: ScalarType, v: i128) -> Option<ScalarValue> {
        Some(match to {
            ScalarType::U8 => Self::U8(u8::try_from(v).ok()?),
            ScalarType::U16 => Self::U16(u16::try_from(v).ok()?),
            ScalarType::U32 => Self::U32(u32::try_from(v).ok()?),
            ScalarType::U64 => Self::U64(u64::try_from(v).ok()?),
            ScalarType::U128 => Self::U128(u128::try_from(v).ok()?),
            ScalarType::I8 => Self::I8(i8::try_from(v).ok()?),
            ScalarType::I16 => Self::I16(i16::try_from(v).ok()?),
            ScalarType::I32 => Self::I32(i32::try_from(v).ok()?),
            ScalarType::I64 => Self::I64(i64::try_from(v).ok()?),
            ScalarType::I128 => Self::I128(v),
            ScalarType::Float => Self::Float(v as f64),
            _ => return None,
        })
    }

    /// Widen this value to type `to`. Identity when already of that type;
    /// `Null` stays `Null` regardless of the target.
    pub fn cast(&self, to: ScalarType) -> Result<ScalarValue, TypeError> {
        if self.is_null() {
            return Ok(Self::Null);
        }
        let from = self.scalar_type().unwrap();
        if from == to {
            return Ok(self.clone());
        }
        if !can_cast(from, to) {
            return Err(TypeError::Incompatible(from, to));
        }
        if to == ScalarType::Float {
            return Ok(Self::Float(self.to_f64().unwrap()));
        }
        // Only integer targets remain: bool → int and int → wider int.
        let v = self.to_i128().ok_or(TypeError::Incompatible(from, to))?;
        Self::int_of(to, v).ok_or(TypeError::Incompatible(from, to))
    }

    /// Order two values of the same scalar type. `None` when the types
    /// differ, for NULL, or for NaN.
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        use ScalarValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => Some(a.cmp(b)),
            (U8(a), U8(b)) => Some(a.cmp(b)),
            (U16(a), U16(b)) => Some(a.cmp(b)),
            (U32(a), U32(b)) => Some(a.cmp(b)),
            (U64(a), U64(b)) => Some(a.cmp(b)),
            (U128(a), U128(b)) => Some(a.cmp(b)),
            (I8(a), I8(b)) => Some(a.cmp(b)),
            (I16(a), I16(b)) => Some(a.cmp(b)),
            (I32(a), I32(b)) => Some(a.cmp(b)),
            (I64(a), I64(b)) => Some(a.cmp(b)),
            (I128(a), I128(b)) => Some(a.cmp(b)),
            (Ip4(a), Ip4(b)) => Some(a.cmp(b)),
            (Ip6(a), Ip6(b)) => Some(a.cmp(b)),
            (Cidr4 { addr: a, prefix: ap }, Cidr4 { addr: b, prefix: bp }) => {
                Some((a, ap).cmp(&(b, bp)))
            }
            (Cidr6 { addr: a, prefix: ap }, Cidr6 { addr: b, prefix: bp }) => {
                Some((a, ap).cmp(&(b, bp)))
            }
            _ => None,
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::U8(v) => write!(f, "{v}u8"),
            Self::U16(v) => write!(f, "{v}u16"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::U64(v) => write!(f, "{v}u64"),
            Self::U128(v) => write!(f, "{v}u128"),
            Self::I8(v) => write!(f, "{v}i8"),
            Self::I16(v) => write!(f, "{v}i16"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::I64(v) => write!(f, "{v}i64"),
            Self::I128(v) => write!(f, "{v}i128"),
            Self::Ip4(a) => write!(f, "ip4 \"{a}\""),
            Self::Ip6(a) => write!(f, "ip6 \"{a}\""),
            Self::Cidr4 { addr, prefix } => write!(f, "cidr4 \"{addr}/{prefix}\""),
            Self::Cidr6 { addr, prefix } => write!(f, "cidr6 \"{addr}/{prefix}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ScalarType::*;

    #[test]
    fn widening_is_reflexive_and_never_narrows() {
        for t in [Bool, Float, String, U8, U64, I8, I128, Ip4, Cidr6] {
            assert!(can_cast(t, t));
        }
        assert!(can_cast(U8, U16));
        assert!(can_cast(U8, I32));
        assert!(!can_cast(U8, I16)); // crossing signedness costs a width bump
        assert!(!can_cast(I16, U32));
        assert!(!can_cast(I32, I16));
        assert!(can_cast(I64, Float));
        assert!(!can_cast(Float, I64));
        assert!(can_cast(Bool, U8));
        assert!(can_cast(Bool, I128));
        assert!(!can_cast(U8, Bool));
        assert!(!can_cast(String, Float));
    }

    #[test]
    fn least_common_widening() {
        assert_eq!(larger_type(U8, I16), Ok(I32));
        assert_eq!(larger_type(I16, U8), Ok(I32));
        assert_eq!(larger_type(U8, U16), Ok(U16));
        assert_eq!(larger_type(I8, I8), Ok(I8));
        assert_eq!(larger_type(U64, I16), Ok(Float));
        assert_eq!(larger_type(Float, I128), Ok(Float));
        assert_eq!(larger_type(Num, I16), Ok(I16));
        assert_eq!(larger_type(Any, String), Ok(String));
        assert_eq!(larger_type(Bool, U32), Ok(U32));
        assert!(larger_type(String, Float).is_err());
        assert!(larger_type(Ip4, Ip6).is_err());
    }

    #[test]
    fn larger_type_result_covers_both_sides() {
        let nums = [U8, U16, U32, U64, U128, I8, I16, I32, I64, I128, Float];
        for a in nums {
            for b in nums {
                let t = larger_type(a, b).unwrap();
                assert!(can_cast(a, t), "{a} !< {t}");
                assert!(can_cast(b, t), "{b} !< {t}");
            }
        }
    }

    #[test]
    fn value_casts() {
        assert_eq!(
            ScalarValue::U8(200).cast(I32).unwrap(),
            ScalarValue::I32(200)
        );
        assert_eq!(
            ScalarValue::Bool(true).cast(U64).unwrap(),
            ScalarValue::U64(1)
        );
        assert_eq!(
            ScalarValue::I16(-3).cast(Float).unwrap(),
            ScalarValue::Float(-3.0)
        );
        assert_eq!(ScalarValue::Null.cast(Float).unwrap(), ScalarValue::Null);
        assert!(ScalarValue::I8(-1).cast(U8).is_err());
    }

    #[test]
    fn scalar_type_parses_back() {
        for t in [Bool, Float, String, U8, U128, I64, Ip4, Ip6, Cidr4, Cidr6] {
            assert_eq!(t.to_string().parse::<ScalarType>().unwrap(), t);
        }
        assert!("i256".parse::<ScalarType>().is_err());
    }
}
