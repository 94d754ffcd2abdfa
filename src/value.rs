//! # Scalar type system
//!
//! Closed set of scalar types, runtime values, and the widening lattice the
//! type inference engine runs on. A value pairs a scalar type with either a
//! concrete payload or the distinguished NULL.
//!
//! Widening is a partial order: numeric types widen by width within a
//! signedness, `float` absorbs every numeric, and `bool` widens into any
//! integer. Mixing signedness jumps to the signed type of twice the larger
//! width, so `u8` unified with `i16` lands on `i32`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Scalar types expressions and tuple fields can take.
///
/// `Num` and `Any` are abstract placeholders used while inference is still
/// narrowing a type; they never appear in a finished schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Float,
    Str,
    I8,
    I16,
    I32,
    I64,
    I128,
    U8,
    U16,
    U32,
    U64,
    U128,
    Ip4,
    Ip6,
    Cidr4,
    Cidr6,
    /// Any numeric type, not yet known
    Num,
    /// Any type at all, not yet known
    Any,
}

impl ScalarType {
    /// Width in bits for integer types, `None` otherwise.
    pub fn int_width(self) -> Option<u32> {
        match self {
            ScalarType::I8 | ScalarType::U8 => Some(8),
            ScalarType::I16 | ScalarType::U16 => Some(16),
            ScalarType::I32 | ScalarType::U32 => Some(32),
            ScalarType::I64 | ScalarType::U64 => Some(64),
            ScalarType::I128 | ScalarType::U128 => Some(128),
            _ => None,
        }
    }

    pub fn is_signed_int(self) -> bool {
        matches!(
            self,
            ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64 | ScalarType::I128
        )
    }

    pub fn is_unsigned_int(self) -> bool {
        matches!(
            self,
            ScalarType::U8 | ScalarType::U16 | ScalarType::U32 | ScalarType::U64 | ScalarType::U128
        )
    }

    pub fn is_int(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn is_numeric(self) -> bool {
        self.is_int() || matches!(self, ScalarType::Float | ScalarType::Num)
    }

    /// True for placeholders that still need narrowing.
    pub fn is_abstract(self) -> bool {
        matches!(self, ScalarType::Num | ScalarType::Any)
    }

    fn signed_of_width(width: u32) -> Option<ScalarType> {
        match width {
            8 => Some(ScalarType::I8),
            16 => Some(ScalarType::I16),
            32 => Some(ScalarType::I32),
            64 => Some(ScalarType::I64),
            128 => Some(ScalarType::I128),
            _ => None,
        }
    }

    /// Parse a type name as written in the query language.
    pub fn parse(name: &str) -> Option<ScalarType> {
        let t = match name.to_ascii_lowercase().as_str() {
            "bool" => ScalarType::Bool,
            "float" => ScalarType::Float,
            "string" => ScalarType::Str,
            "i8" => ScalarType::I8,
            "i16" => ScalarType::I16,
            "i32" => ScalarType::I32,
            "i64" => ScalarType::I64,
            "i128" => ScalarType::I128,
            "u8" => ScalarType::U8,
            "u16" => ScalarType::U16,
            "u32" => ScalarType::U32,
            "u64" => ScalarType::U64,
            "u128" => ScalarType::U128,
            "ip4" => ScalarType::Ip4,
            "ip6" => ScalarType::Ip6,
            "cidr4" => ScalarType::Cidr4,
            "cidr6" => ScalarType::Cidr6,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarType::Bool => "bool",
            ScalarType::Float => "float",
            ScalarType::Str => "string",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::I128 => "i128",
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::U128 => "u128",
            ScalarType::Ip4 => "ip4",
            ScalarType::Ip6 => "ip6",
            ScalarType::Cidr4 => "cidr4",
            ScalarType::Cidr6 => "cidr6",
            ScalarType::Num => "num",
            ScalarType::Any => "any",
        };
        f.write_str(s)
    }
}

/// Can a value of type `from` be used where `to` is required, without loss?
///
/// Reachability in the widening lattice. Note the deliberate asymmetry with
/// [`larger_type`]: a `u8` *value* fits an `i16` slot, but *unifying* the two
/// types lands on `i32`.
pub fn can_cast(from: ScalarType, to: ScalarType) -> bool {
    use ScalarType::{Any, Bool, Float, Num};
    if from == to || from == Any || to == Any {
        return true;
    }
    if to == Num {
        return from.is_numeric() || from == Bool;
    }
    if from == Num {
        return to.is_numeric();
    }
    if from == Bool {
        return to.is_int() || to == Float;
    }
    if to == Float {
        return from.is_numeric();
    }
    match (from.int_width(), to.int_width()) {
        (Some(n), Some(m)) => {
            if from.is_signed_int() == to.is_signed_int() {
                m >= n
            } else if from.is_unsigned_int() {
                // unsigned fits a signed type of at least double the width
                m >= 2 * n
            } else {
                false
            }
        }
        _ => false,
    }
}

/// Least common widening of two types, `None` when they are incompatible.
pub fn larger_type(a: ScalarType, b: ScalarType) -> Option<ScalarType> {
    use ScalarType::{Any, Bool, Float, Num};
    if a == b {
        return Some(a);
    }
    match (a, b) {
        (Any, t) | (t, Any) => Some(t),
        (Num, t) | (t, Num) if t.is_numeric() || t == Bool => Some(if t == Bool { Num } else { t }),
        (Bool, t) | (t, Bool) if t.is_int() || t == Float => Some(t),
        (Float, t) | (t, Float) if t.is_numeric() => Some(Float),
        _ => {
            let (n, m) = (a.int_width()?, b.int_width()?);
            if a.is_signed_int() == b.is_signed_int() {
                Some(if n >= m { a } else { b })
            } else {
                // mixed signedness: signed of twice the larger width
                match ScalarType::signed_of_width(2 * n.max(m)) {
                    Some(t) => Some(t),
                    None => Some(Float),
                }
            }
        }
    }
}

/// A row of values, ordered as its schema orders fields.
pub type Tuple = Vec<Value>;

/// A runtime value: a concrete payload, or NULL tagged with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null(ScalarType),
    Bool(bool),
    Float(f64),
    Str(String),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    I128(i128),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Cidr4 { addr: Ipv4Addr, prefix: u8 },
    Cidr6 { addr: Ipv6Addr, prefix: u8 },
}

impl Value {
    pub fn type_of(&self) -> ScalarType {
        match self {
            Value::Null(t) => *t,
            Value::Bool(_) => ScalarType::Bool,
            Value::Float(_) => ScalarType::Float,
            Value::Str(_) => ScalarType::Str,
            Value::I8(_) => ScalarType::I8,
            Value::I16(_) => ScalarType::I16,
            Value::I32(_) => ScalarType::I32,
            Value::I64(_) => ScalarType::I64,
            Value::I128(_) => ScalarType::I128,
            Value::U8(_) => ScalarType::U8,
            Value::U16(_) => ScalarType::U16,
            Value::U32(_) => ScalarType::U32,
            Value::U64(_) => ScalarType::U64,
            Value::U128(_) => ScalarType::U128,
            Value::Ip4(_) => ScalarType::Ip4,
            Value::Ip6(_) => ScalarType::Ip6,
            Value::Cidr4 { .. } => ScalarType::Cidr4,
            Value::Cidr6 { .. } => ScalarType::Cidr6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// Signed integer view of any integer or bool value.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Bool(b) => Some(i128::from(b)),
            Value::I8(v) => Some(i128::from(v)),
            Value::I16(v) => Some(i128::from(v)),
            Value::I32(v) => Some(i128::from(v)),
            Value::I64(v) => Some(i128::from(v)),
            Value::I128(v) => Some(v),
            Value::U8(v) => Some(i128::from(v)),
            Value::U16(v) => Some(i128::from(v)),
            Value::U32(v) => Some(i128::from(v)),
            Value::U64(v) => Some(i128::from(v)),
            Value::U128(v) => i128::try_from(v).ok(),
            _ => None,
        }
    }

    /// Float view of any numeric or bool value.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::U128(v) => Some(v as f64),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Build an integer value of the given type from a signed view.
    /// Fails when the payload does not fit.
    pub fn int_of(t: ScalarType, v: i128) -> Option<Value> {
        let out = match t {
            ScalarType::Bool => Value::Bool(v != 0),
            ScalarType::I8 => Value::I8(i8::try_from(v).ok()?),
            ScalarType::I16 => Value::I16(i16::try_from(v).ok()?),
            ScalarType::I32 => Value::I32(i32::try_from(v).ok()?),
            ScalarType::I64 => Value::I64(i64::try_from(v).ok()?),
            ScalarType::I128 => Value::I128(v),
            ScalarType::U8 => Value::U8(u8::try_from(v).ok()?),
            ScalarType::U16 => Value::U16(u16::try_from(v).ok()?),
            ScalarType::U32 => Value::U32(u32::try_from(v).ok()?),
            ScalarType::U64 => Value::U64(u64::try_from(v).ok()?),
            ScalarType::U128 => Value::U128(u128::try_from(v).ok()?),
            ScalarType::Float => Value::Float(v as f64),
            _ => return None,
        };
        Some(out)
    }

    /// Cast along the widening lattice. NULLs retag, payloads convert.
    pub fn cast_to(&self, t: ScalarType) -> Option<Value> {
        if self.type_of() == t || t == ScalarType::Any || t == ScalarType::Num {
            return Some(self.clone());
        }
        match self {
            Value::Null(_) => Some(Value::Null(t)),
            Value::Float(v) => match t {
                ScalarType::Float => Some(Value::Float(*v)),
                _ => None,
            },
            _ if t == ScalarType::Float => self.as_f64().map(Value::Float),
            _ => Value::int_of(t, self.as_i128()?),
        }
    }
}

// f64 payloads keep Value from deriving Eq/Hash; group keys hash the raw bits
// and treat NaN as never-equal, which only ever splits a pathological group.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null(t) => t.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::I8(v) => v.hash(state),
            Value::I16(v) => v.hash(state),
            Value::I32(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::I128(v) => v.hash(state),
            Value::U8(v) => v.hash(state),
            Value::U16(v) => v.hash(state),
            Value::U32(v) => v.hash(state),
            Value::U64(v) => v.hash(state),
            Value::U128(v) => v.hash(state),
            Value::Ip4(v) => v.hash(state),
            Value::Ip6(v) => v.hash(state),
            Value::Cidr4 { addr, prefix } => {
                addr.hash(state);
                prefix.hash(state);
            }
            Value::Cidr6 { addr, prefix } => {
                addr.hash(state);
                prefix.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null(_) => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::I128(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::U128(v) => write!(f, "{v}"),
            Value::Ip4(v) => write!(f, "{v}"),
            Value::Ip6(v) => write!(f, "{v}"),
            Value::Cidr4 { addr, prefix } => write!(f, "{addr}/{prefix}"),
            Value::Cidr6 { addr, prefix } => write!(f, "{addr}/{prefix}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_same_signedness_takes_wider() {
        assert_eq!(
            larger_type(ScalarType::U8, ScalarType::U32),
            Some(ScalarType::U32)
        );
        assert_eq!(
            larger_type(ScalarType::I16, ScalarType::I8),
            Some(ScalarType::I16)
        );
    }

    #[test]
    fn widening_mixed_signedness_doubles() {
        assert_eq!(
            larger_type(ScalarType::U8, ScalarType::I16),
            Some(ScalarType::I32)
        );
        assert_eq!(
            larger_type(ScalarType::I8, ScalarType::U32),
            Some(ScalarType::I64)
        );
        // no signed 256-bit type to escape into
        assert_eq!(
            larger_type(ScalarType::U128, ScalarType::I8),
            Some(ScalarType::Float)
        );
    }

    #[test]
    fn float_absorbs_numerics() {
        assert_eq!(
            larger_type(ScalarType::Float, ScalarType::U64),
            Some(ScalarType::Float)
        );
        assert!(can_cast(ScalarType::I128, ScalarType::Float));
    }

    #[test]
    fn bool_widens_into_integers_but_not_back() {
        assert!(can_cast(ScalarType::Bool, ScalarType::U8));
        assert!(can_cast(ScalarType::Bool, ScalarType::I64));
        assert!(!can_cast(ScalarType::U8, ScalarType::Bool));
    }

    #[test]
    fn strings_only_unify_with_themselves() {
        assert_eq!(larger_type(ScalarType::Str, ScalarType::U8), None);
        assert_eq!(
            larger_type(ScalarType::Str, ScalarType::Str),
            Some(ScalarType::Str)
        );
    }

    #[test]
    fn placeholders_unify() {
        assert_eq!(
            larger_type(ScalarType::Num, ScalarType::I32),
            Some(ScalarType::I32)
        );
        assert_eq!(
            larger_type(ScalarType::Any, ScalarType::Str),
            Some(ScalarType::Str)
        );
    }

    #[test]
    fn value_casts_along_lattice() {
        let v = Value::U8(200);
        assert_eq!(v.cast_to(ScalarType::I32), Some(Value::I32(200)));
        assert_eq!(v.cast_to(ScalarType::Float), Some(Value::Float(200.0)));
        assert_eq!(Value::Null(ScalarType::U8).cast_to(ScalarType::I32), Some(Value::Null(ScalarType::I32)));
    }
}
