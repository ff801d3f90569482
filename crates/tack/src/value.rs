//! NaN-boxed value representation.
//!
//! Every Tack value is 64 bits. Any bit pattern that is not a NaN is an
//! IEEE-754 double; everything else carries a type tag in bits 48–51 and a
//! 48-bit payload below it. Payloads are immediates (booleans) or indices
//! into the per-type heap pools, never machine pointers, which keeps this
//! module entirely safe Rust while preserving the layout contract exposed
//! to host embedders.

use strum::{Display, IntoStaticStr};

use crate::intern::StringId;

/// Quiet-NaN prefix: exponent bits all set.
const NAN_BITS: u64 = 0x7ff0 << 48;
/// The tag nibble, bits 48–51.
const TYPE_BITS: u64 = 0xf << 48;
/// Payload mask, bits 0–47.
const PAYLOAD_BITS: u64 = 0x0000_ffff_ffff_ffff;
/// Boolean immediate payload bit.
const BOOLEAN_BIT: u64 = 0x1;
/// Set in a String payload when the index refers to the intern table
/// rather than the transient string pool.
const INTERNED_BIT: u64 = 1 << 47;

const TAG_POINTER: u64 = 0x0 << 48;
const TAG_BOOLEAN: u64 = 0x1 << 48;
/// Canonical tag for arithmetic results that are genuinely NaN. Keeping
/// these out of tag 0x8+ means a computed NaN can never alias a heap value.
const TAG_NAN: u64 = 0x2 << 48;
const TAG_STRING: u64 = 0x8 << 48;
const TAG_OBJECT: u64 = 0x9 << 48;
const TAG_ARRAY: u64 = 0xa << 48;
const TAG_BOX: u64 = 0xb << 48;
const TAG_FUNCTION: u64 = 0xc << 48;
const TAG_CFUNCTION: u64 = 0xd << 48;
const TAG_NULL: u64 = 0xf << 48;

/// A Tack runtime type, as visible to programs and host embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    Null,
    Boolean,
    Number,
    String,
    Object,
    Array,
    Function,
    CFunction,
    Pointer,
    Box,
}

/// Which string pool a String value points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRef {
    /// VM-lifetime interned string.
    Interned(StringId),
    /// GC-managed transient string in the heap's string pool.
    Transient(u32),
}

/// A single NaN-boxed Tack value.
///
/// `Value` is `Copy`; ownership of the heap objects it may refer to is
/// managed by the garbage collector, not by this type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value(u64);

impl Value {
    /// The `null` value: the all-ones bit pattern.
    pub const NULL: Self = Self(u64::MAX);
    pub const TRUE: Self = Self(NAN_BITS | TAG_BOOLEAN | BOOLEAN_BIT);
    pub const FALSE: Self = Self(NAN_BITS | TAG_BOOLEAN);

    #[inline]
    #[must_use]
    pub fn null() -> Self {
        Self::NULL
    }

    #[inline]
    #[must_use]
    pub fn boolean(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// Boxes a double. NaN inputs are re-tagged to the canonical NaN
    /// pattern so they cannot collide with heap tags.
    #[inline]
    #[must_use]
    pub fn number(d: f64) -> Self {
        if d.is_nan() {
            Self(NAN_BITS | TAG_NAN)
        } else {
            Self(d.to_bits())
        }
    }

    #[inline]
    #[must_use]
    pub fn pointer(payload: u64) -> Self {
        Self(NAN_BITS | TAG_POINTER | (payload & PAYLOAD_BITS))
    }

    #[inline]
    #[must_use]
    pub fn interned_string(id: StringId) -> Self {
        Self(NAN_BITS | TAG_STRING | INTERNED_BIT | u64::from(id.index()))
    }

    #[inline]
    #[must_use]
    pub fn transient_string(index: u32) -> Self {
        Self(NAN_BITS | TAG_STRING | u64::from(index))
    }

    #[inline]
    #[must_use]
    pub fn object(index: u32) -> Self {
        Self(NAN_BITS | TAG_OBJECT | u64::from(index))
    }

    #[inline]
    #[must_use]
    pub fn array(index: u32) -> Self {
        Self(NAN_BITS | TAG_ARRAY | u64::from(index))
    }

    #[inline]
    #[must_use]
    pub fn boxed(index: u32) -> Self {
        Self(NAN_BITS | TAG_BOX | u64::from(index))
    }

    #[inline]
    #[must_use]
    pub fn function(index: u32) -> Self {
        Self(NAN_BITS | TAG_FUNCTION | u64::from(index))
    }

    #[inline]
    #[must_use]
    pub fn cfunction(index: u32) -> Self {
        Self(NAN_BITS | TAG_CFUNCTION | u64::from(index))
    }

    /// True when the bit pattern decodes as a plain double.
    #[inline]
    #[must_use]
    pub fn is_number(self) -> bool {
        !f64::from_bits(self.0).is_nan() || self.0 & TYPE_BITS == TAG_NAN
    }

    #[inline]
    fn tag(self) -> u64 {
        self.0 & TYPE_BITS
    }

    /// True when the value is NaN-boxed (i.e. not a plain double).
    #[inline]
    fn is_tagged(self) -> bool {
        f64::from_bits(self.0).is_nan()
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    #[must_use]
    pub fn is_boolean(self) -> bool {
        self.is_tagged() && self.tag() == TAG_BOOLEAN
    }

    #[inline]
    #[must_use]
    pub fn is_string(self) -> bool {
        self.is_tagged() && self.tag() == TAG_STRING
    }

    #[inline]
    #[must_use]
    pub fn is_object(self) -> bool {
        self.is_tagged() && self.tag() == TAG_OBJECT
    }

    #[inline]
    #[must_use]
    pub fn is_array(self) -> bool {
        self.is_tagged() && self.tag() == TAG_ARRAY
    }

    #[inline]
    #[must_use]
    pub fn is_boxed(self) -> bool {
        self.is_tagged() && self.tag() == TAG_BOX
    }

    #[inline]
    #[must_use]
    pub fn is_function(self) -> bool {
        self.is_tagged() && self.tag() == TAG_FUNCTION
    }

    #[inline]
    #[must_use]
    pub fn is_cfunction(self) -> bool {
        self.is_tagged() && self.tag() == TAG_CFUNCTION
    }

    #[inline]
    #[must_use]
    pub fn is_pointer(self) -> bool {
        self.is_tagged() && self.tag() == TAG_POINTER
    }

    /// Returns the runtime type. Exactly one `is_*` predicate holds for any
    /// value, and this is the one.
    #[must_use]
    pub fn type_of(self) -> Type {
        if self.is_number() {
            return Type::Number;
        }
        match self.tag() {
            TAG_NULL => Type::Null,
            TAG_BOOLEAN => Type::Boolean,
            TAG_STRING => Type::String,
            TAG_OBJECT => Type::Object,
            TAG_ARRAY => Type::Array,
            TAG_BOX => Type::Box,
            TAG_FUNCTION => Type::Function,
            TAG_CFUNCTION => Type::CFunction,
            _ => Type::Pointer,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        if self.is_tagged() {
            if self.tag() == TAG_NAN { Some(f64::NAN) } else { None }
        } else {
            Some(f64::from_bits(self.0))
        }
    }

    #[inline]
    #[must_use]
    pub fn as_boolean(self) -> Option<bool> {
        self.is_boolean().then(|| self.0 & BOOLEAN_BIT != 0)
    }

    #[inline]
    #[must_use]
    pub fn as_string(self) -> Option<StringRef> {
        if !self.is_string() {
            return None;
        }
        let payload = self.0 & PAYLOAD_BITS;
        if payload & INTERNED_BIT != 0 {
            Some(StringRef::Interned(StringId::new((payload & !INTERNED_BIT) as u32)))
        } else {
            Some(StringRef::Transient(payload as u32))
        }
    }

    #[inline]
    #[must_use]
    pub fn as_object(self) -> Option<u32> {
        self.is_object().then(|| (self.0 & PAYLOAD_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub fn as_array(self) -> Option<u32> {
        self.is_array().then(|| (self.0 & PAYLOAD_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub fn as_boxed(self) -> Option<u32> {
        self.is_boxed().then(|| (self.0 & PAYLOAD_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub fn as_function(self) -> Option<u32> {
        self.is_function().then(|| (self.0 & PAYLOAD_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub fn as_cfunction(self) -> Option<u32> {
        self.is_cfunction().then(|| (self.0 & PAYLOAD_BITS) as u32)
    }

    #[inline]
    #[must_use]
    pub fn as_pointer(self) -> Option<u64> {
        self.is_pointer().then_some(self.0 & PAYLOAD_BITS)
    }

    /// `null`, `false` and numeric zero are falsy; everything else is
    /// truthy, including empty strings, arrays and objects.
    #[must_use]
    pub fn truthy(self) -> bool {
        if let Some(d) = self.as_number() {
            return d != 0.0;
        }
        self.0 != u64::MAX && self != Self::FALSE
    }

    /// Equality as the `==` operator sees it: numeric comparison between
    /// two numbers, bit identity otherwise. Canonical-NaN values classify
    /// as numbers, so they take the numeric branch and NaN compares
    /// unequal to everything, itself included. Interned strings are
    /// dedup'd, so identity equality doubles as content equality for
    /// them.
    #[must_use]
    pub fn equals(self, other: Self) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            a == b
        } else {
            self.0 == other.0
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.type_of() {
            Type::Null => write!(f, "null"),
            Type::Boolean => write!(f, "{}", self.0 & BOOLEAN_BIT != 0),
            Type::Number => write!(f, "{}", f64::from_bits(self.0)),
            ty => write!(f, "{}({:#x})", ty, self.0 & PAYLOAD_BITS),
        }
    }
}

/// Formats a double the way Tack prints it: integral values without a
/// fractional suffix, everything else in shortest round-trip form.
#[must_use]
pub fn format_number(d: f64) -> String {
    if d.is_nan() {
        return "nan".to_owned();
    }
    if d.is_infinite() {
        return if d < 0.0 { "-inf".to_owned() } else { "inf".to_owned() };
    }
    if d.trunc() == d && d.abs() < 1e15 {
        // Integral doubles print like integers, matching stream output in
        // typical host languages.
        return format!("{}", d as i64);
    }
    ryu::Buffer::new().format(d).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        for d in [0.0, -0.0, 1.5, -123.25, 1e300, f64::MIN_POSITIVE] {
            let v = Value::number(d);
            assert!(v.is_number());
            assert_eq!(v.as_number(), Some(d));
            assert_eq!(v.type_of(), Type::Number);
        }
    }

    #[test]
    fn nan_is_still_a_number() {
        let v = Value::number(f64::NAN);
        assert!(v.is_number());
        assert!(!v.is_string());
        assert!(v.as_number().unwrap().is_nan());
    }

    #[test]
    fn null_is_all_ones() {
        assert_eq!(Value::NULL, Value::null());
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_number());
    }

    #[test]
    fn exactly_one_type_predicate_holds() {
        let samples = [
            Value::NULL,
            Value::TRUE,
            Value::number(3.25),
            Value::number(f64::NAN),
            Value::interned_string(StringId::new(7)),
            Value::transient_string(3),
            Value::object(0),
            Value::array(9),
            Value::boxed(2),
            Value::function(1),
            Value::cfunction(4),
            Value::pointer(0xdead),
        ];
        for v in samples {
            let checks = [
                v.is_null(),
                v.is_boolean(),
                v.is_number(),
                v.is_string(),
                v.is_object(),
                v.is_array(),
                v.is_function(),
                v.is_cfunction(),
                v.is_pointer(),
                v.is_boxed(),
            ];
            assert_eq!(checks.iter().filter(|&&c| c).count(), 1, "value {v:?}");
        }
    }

    #[test]
    fn truthiness() {
        assert!(!Value::NULL.truthy());
        assert!(!Value::FALSE.truthy());
        assert!(!Value::number(0.0).truthy());
        assert!(!Value::number(-0.0).truthy());
        assert!(Value::TRUE.truthy());
        assert!(Value::number(0.5).truthy());
        assert!(Value::array(0).truthy());
        assert!(Value::interned_string(StringId::new(0)).truthy());
    }

    #[test]
    fn string_pools_are_distinguished() {
        let a = Value::interned_string(StringId::new(5));
        let b = Value::transient_string(5);
        assert_ne!(a, b);
        assert_eq!(a.as_string(), Some(StringRef::Interned(StringId::new(5))));
        assert_eq!(b.as_string(), Some(StringRef::Transient(5)));
    }

    #[test]
    fn equality_is_numeric_for_numbers_and_identity_otherwise() {
        assert!(Value::number(1.0).equals(Value::number(1.0)));
        assert!(Value::number(0.0).equals(Value::number(-0.0)));
        assert!(!Value::number(1.0).equals(Value::number(2.0)));
        assert!(Value::array(1).equals(Value::array(1)));
        assert!(!Value::array(1).equals(Value::array(2)));
        assert!(!Value::array(1).equals(Value::object(1)));
    }

    #[test]
    fn nan_never_equals_itself() {
        let nan = Value::number(f64::NAN);
        assert!(!nan.equals(nan));
        assert!(!nan.equals(Value::number(1.0)));
        assert!(!Value::number(1.0).equals(nan));
        // The canonical bit pattern is still identical; only value
        // equality treats NaN specially.
        assert!(nan == nan);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(f64::NAN), "nan");
    }
}
