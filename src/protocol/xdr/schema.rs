//! Declarative XDR type descriptors.
//!
//! Procedure argument and result shapes are only known at registration
//! time, so they are described by [`Descriptor`] values built once at
//! server startup and encoded/decoded against dynamic [`Value`]s. This
//! replaces run-time reflection over language metadata with ordinary
//! composition: a struct is a list of named member descriptors in
//! declaration order, a union is a discriminant descriptor plus the arms
//! selected by it, and so on.
//!
//! Bounds are enforced on both sides of the wire: encoding rejects
//! application data that exceeds a declared limit before producing the
//! offending field, and decoding rejects a peer-claimed length above the
//! limit before allocating anything proportional to the claim.

use std::io::{Read, Write};

use thiserror::Error;

use super::{deserialize, read_padding, write_padding, Deserialize, Serialize};

/// Default bound for variable-length opaque/string/array data, 2^32 - 1.
pub const UNBOUNDED: u32 = u32::MAX;

/// Errors raised by descriptor construction, encoding and decoding.
///
/// The split matters to the dispatch layer: [`XdrError::BadValue`] is an
/// application-side precondition failure that must never reach the wire,
/// while the remaining variants describe untrusted peer input and are
/// translated into `GARBAGE_ARGS` when they occur during argument decoding.
#[derive(Debug, Error)]
pub enum XdrError {
    /// The supplied value does not satisfy the descriptor it is encoded
    /// with, or a descriptor itself is ill-formed.
    #[error("bad value: {0}")]
    BadValue(String),
    /// Peer bytes violate the descriptor: a bound, a shape, or a text
    /// encoding.
    #[error("malformed input: {0}")]
    Malformed(String),
    /// A decoded enum or union discriminant matches no declared code.
    #[error("unknown discriminant {0}")]
    UnknownDiscriminant(i32),
    /// Truncated or otherwise unreadable input.
    #[error("i/o failure: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for XdrError {
    fn from(err: std::io::Error) -> Self {
        // The primitive layer reports shape violations (bad bool, unknown
        // enum code) as InvalidData; keep those distinct from truncation.
        if err.kind() == std::io::ErrorKind::InvalidData {
            XdrError::Malformed(err.to_string())
        } else {
            XdrError::Io(err)
        }
    }
}

fn bad_value(msg: impl Into<String>) -> XdrError {
    XdrError::BadValue(msg.into())
}

fn malformed(msg: impl Into<String>) -> XdrError {
    XdrError::Malformed(msg.into())
}

/// A closed mapping from symbolic name to 32-bit code.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDescriptor {
    variants: Vec<(String, i32)>,
}

impl EnumDescriptor {
    /// Builds an enum descriptor, rejecting duplicate names or codes.
    pub fn new<S: Into<String>>(
        variants: impl IntoIterator<Item = (S, i32)>,
    ) -> Result<Self, XdrError> {
        let variants: Vec<(String, i32)> =
            variants.into_iter().map(|(name, code)| (name.into(), code)).collect();
        if variants.is_empty() {
            return Err(bad_value("enum must declare at least one variant"));
        }
        for (i, (name, code)) in variants.iter().enumerate() {
            for (other_name, other_code) in &variants[..i] {
                if name == other_name {
                    return Err(bad_value(format!("duplicate enum variant name {name:?}")));
                }
                if code == other_code {
                    return Err(bad_value(format!("duplicate enum code {code}")));
                }
            }
        }
        Ok(Self { variants })
    }

    pub fn contains(&self, code: i32) -> bool {
        self.variants.iter().any(|(_, c)| *c == code)
    }

    pub fn code_of(&self, name: &str) -> Option<i32> {
        self.variants.iter().find(|(n, _)| n == name).map(|(_, c)| *c)
    }

    pub fn name_of(&self, code: i32) -> Option<&str> {
        self.variants.iter().find(|(_, c)| *c == code).map(|(n, _)| n.as_str())
    }

    pub fn variants(&self) -> &[(String, i32)] {
        &self.variants
    }
}

/// An ordered, named set of member descriptors. Wire order is declaration
/// order and must be preserved exactly between structurally-equal
/// descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDescriptor {
    members: Vec<(String, Descriptor)>,
}

impl StructDescriptor {
    pub fn new<S: Into<String>>(
        members: impl IntoIterator<Item = (S, Descriptor)>,
    ) -> Result<Self, XdrError> {
        let members: Vec<(String, Descriptor)> =
            members.into_iter().map(|(name, desc)| (name.into(), desc)).collect();
        for (i, (name, _)) in members.iter().enumerate() {
            if members[..i].iter().any(|(n, _)| n == name) {
                return Err(bad_value(format!("duplicate struct member {name:?}")));
            }
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[(String, Descriptor)] {
        &self.members
    }
}

/// One branch of a discriminated union: the discriminant code selecting it
/// plus the named fields that follow the discriminant, in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionArm {
    discriminant: i32,
    fields: Vec<(String, Descriptor)>,
}

impl UnionArm {
    pub fn new<S: Into<String>>(
        discriminant: i32,
        fields: impl IntoIterator<Item = (S, Descriptor)>,
    ) -> Self {
        Self {
            discriminant,
            fields: fields.into_iter().map(|(name, desc)| (name.into(), desc)).collect(),
        }
    }

    /// A branch carrying no fields beyond the discriminant.
    pub fn void(discriminant: i32) -> Self {
        Self { discriminant, fields: Vec::new() }
    }

    pub fn discriminant(&self) -> i32 {
        self.discriminant
    }

    pub fn fields(&self) -> &[(String, Descriptor)] {
        &self.fields
    }
}

/// A discriminated union: an `Enum` or `Bool` discriminant followed by
/// exactly the fields of the arm the discriminant selects. There is no
/// default arm; an undeclared discriminant always fails.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionDescriptor {
    discriminant: Box<Descriptor>,
    arms: Vec<UnionArm>,
}

impl UnionDescriptor {
    pub fn new(discriminant: Descriptor, arms: Vec<UnionArm>) -> Result<Self, XdrError> {
        match &discriminant {
            Descriptor::Enum(desc) => {
                for arm in &arms {
                    if !desc.contains(arm.discriminant) {
                        return Err(bad_value(format!(
                            "union arm {} is not a declared enum code",
                            arm.discriminant
                        )));
                    }
                }
            }
            Descriptor::Bool => {
                for arm in &arms {
                    if arm.discriminant != 0 && arm.discriminant != 1 {
                        return Err(bad_value(format!(
                            "union arm {} is not a bool value",
                            arm.discriminant
                        )));
                    }
                }
            }
            other => {
                return Err(bad_value(format!(
                    "union discriminant must be an enum or bool, got {other:?}"
                )))
            }
        }
        for (i, arm) in arms.iter().enumerate() {
            if arms[..i].iter().any(|a| a.discriminant == arm.discriminant) {
                return Err(bad_value(format!("duplicate union arm {}", arm.discriminant)));
            }
        }
        Ok(Self { discriminant: Box::new(discriminant), arms })
    }

    pub fn discriminant_descriptor(&self) -> &Descriptor {
        &self.discriminant
    }

    pub fn arms(&self) -> &[UnionArm] {
        &self.arms
    }

    fn arm_for(&self, code: i32) -> Option<&UnionArm> {
        self.arms.iter().find(|arm| arm.discriminant == code)
    }
}

/// A reusable, composable description of how one shape of value is
/// encoded and decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// Zero bytes on the wire.
    Void,
    /// Signed 32-bit integer.
    Int,
    /// Unsigned 32-bit integer.
    UnsignedInt,
    /// Signed 64-bit integer.
    Hyper,
    /// Unsigned 64-bit integer.
    UnsignedHyper,
    /// IEEE single precision.
    Float,
    /// IEEE double precision.
    Double,
    /// Encoded as `enum { FALSE = 0, TRUE = 1 }`.
    Bool,
    Enum(EnumDescriptor),
    /// A byte string, fixed (`size`, no length prefix) or variable up to
    /// `max`.
    Opaque { size: Option<u32>, max: u32 },
    /// UTF-8 text, on the wire a length-prefixed byte string bounded by
    /// `max`.
    String { max: u32 },
    /// A sequence of one element shape, fixed (`size`, no count prefix) or
    /// variable with a 32-bit count prefix bounded by `max`.
    Array { element: Box<Descriptor>, size: Option<u32>, max: u32 },
    /// Present/absent encoded as a 0-or-1-element variable array. This is
    /// the sole null/pointer idiom on the wire.
    Optional(Box<Descriptor>),
    Struct(StructDescriptor),
    Union(UnionDescriptor),
}

impl Descriptor {
    pub fn fixed_opaque(size: u32) -> Self {
        Descriptor::Opaque { size: Some(size), max: size }
    }

    pub fn opaque(max: u32) -> Self {
        Descriptor::Opaque { size: None, max }
    }

    pub fn opaque_unbounded() -> Self {
        Self::opaque(UNBOUNDED)
    }

    pub fn string(max: u32) -> Self {
        Descriptor::String { max }
    }

    pub fn string_unbounded() -> Self {
        Self::string(UNBOUNDED)
    }

    pub fn array(element: Descriptor, max: u32) -> Self {
        Descriptor::Array { element: Box::new(element), size: None, max }
    }

    pub fn array_unbounded(element: Descriptor) -> Self {
        Self::array(element, UNBOUNDED)
    }

    pub fn fixed_array(element: Descriptor, size: u32) -> Self {
        Descriptor::Array { element: Box::new(element), size: Some(size), max: size }
    }

    pub fn optional(element: Descriptor) -> Self {
        Descriptor::Optional(Box::new(element))
    }

    /// Encodes `value` into `dest`, failing without touching `dest` for the
    /// offending field if the value does not satisfy this descriptor.
    /// Composite values are written field by field; use [`encode_to_vec`]
    /// when nothing may be emitted on failure.
    ///
    /// [`encode_to_vec`]: Descriptor::encode_to_vec
    pub fn encode<W: Write>(&self, value: &Value, dest: &mut W) -> Result<(), XdrError> {
        match (self, value) {
            (Descriptor::Void, Value::Void) => Ok(()),
            (Descriptor::Int, Value::Int(v)) => Ok(v.serialize(dest)?),
            (Descriptor::UnsignedInt, Value::UnsignedInt(v)) => Ok(v.serialize(dest)?),
            (Descriptor::Hyper, Value::Hyper(v)) => Ok(v.serialize(dest)?),
            (Descriptor::UnsignedHyper, Value::UnsignedHyper(v)) => Ok(v.serialize(dest)?),
            (Descriptor::Float, Value::Float(v)) => Ok(v.serialize(dest)?),
            (Descriptor::Double, Value::Double(v)) => Ok(v.serialize(dest)?),
            (Descriptor::Bool, Value::Bool(v)) => Ok(v.serialize(dest)?),
            (Descriptor::Enum(desc), Value::Enum(code)) => {
                if !desc.contains(*code) {
                    return Err(bad_value(format!("enum code {code} is not declared")));
                }
                Ok(code.serialize(dest)?)
            }
            (Descriptor::Opaque { size: Some(size), .. }, Value::Opaque(bytes)) => {
                if bytes.len() != *size as usize {
                    return Err(bad_value(format!(
                        "fixed opaque expects {size} bytes, got {}",
                        bytes.len()
                    )));
                }
                dest.write_all(bytes)?;
                Ok(write_padding(bytes.len(), dest)?)
            }
            (Descriptor::Opaque { size: None, max }, Value::Opaque(bytes)) => {
                check_bound(bytes.len(), *max, "opaque")?;
                Ok(bytes.as_slice().serialize(dest)?)
            }
            (Descriptor::String { max }, Value::String(text)) => {
                check_bound(text.len(), *max, "string")?;
                Ok(text.as_str().serialize(dest)?)
            }
            (Descriptor::Array { element, size: Some(size), .. }, Value::Array(items)) => {
                if items.len() != *size as usize {
                    return Err(bad_value(format!(
                        "fixed array expects {size} elements, got {}",
                        items.len()
                    )));
                }
                for item in items {
                    element.encode(item, dest)?;
                }
                Ok(())
            }
            (Descriptor::Array { element, size: None, max }, Value::Array(items)) => {
                check_bound(items.len(), *max, "array")?;
                (items.len() as u32).serialize(dest)?;
                for item in items {
                    element.encode(item, dest)?;
                }
                Ok(())
            }
            (Descriptor::Optional(element), Value::Optional(item)) => match item {
                Some(item) => {
                    1u32.serialize(dest)?;
                    element.encode(item, dest)
                }
                None => Ok(0u32.serialize(dest)?),
            },
            (Descriptor::Struct(desc), Value::Struct(fields)) => {
                encode_fields(desc.members(), fields, dest, "struct")
            }
            (Descriptor::Union(desc), Value::Union { discriminant, fields }) => {
                let code = discriminant_code(discriminant).ok_or_else(|| {
                    bad_value("union discriminant value must be an enum or bool")
                })?;
                let arm = desc
                    .arm_for(code)
                    .ok_or_else(|| bad_value(format!("no union arm for discriminant {code}")))?;
                desc.discriminant.encode(discriminant, dest)?;
                encode_fields(arm.fields(), fields, dest, "union arm")
            }
            (descriptor, value) => Err(bad_value(format!(
                "value {value:?} does not match descriptor {descriptor:?}"
            ))),
        }
    }

    /// Encodes `value` into a fresh buffer; on failure no bytes are
    /// produced at all.
    pub fn encode_to_vec(&self, value: &Value) -> Result<Vec<u8>, XdrError> {
        let mut buf = Vec::new();
        self.encode(value, &mut buf)?;
        Ok(buf)
    }

    /// Decodes one value, advancing the shared cursor through all nested
    /// fields so the caller can continue decoding whatever follows.
    pub fn decode<R: Read>(&self, src: &mut R) -> Result<Value, XdrError> {
        match self {
            Descriptor::Void => Ok(Value::Void),
            Descriptor::Int => Ok(Value::Int(deserialize(src)?)),
            Descriptor::UnsignedInt => Ok(Value::UnsignedInt(deserialize(src)?)),
            Descriptor::Hyper => Ok(Value::Hyper(deserialize(src)?)),
            Descriptor::UnsignedHyper => Ok(Value::UnsignedHyper(deserialize(src)?)),
            Descriptor::Float => Ok(Value::Float(deserialize(src)?)),
            Descriptor::Double => Ok(Value::Double(deserialize(src)?)),
            Descriptor::Bool => Ok(Value::Bool(deserialize(src)?)),
            Descriptor::Enum(desc) => {
                let code: i32 = deserialize(src)?;
                if !desc.contains(code) {
                    return Err(XdrError::UnknownDiscriminant(code));
                }
                Ok(Value::Enum(code))
            }
            Descriptor::Opaque { size: Some(size), .. } => {
                let mut bytes = vec![0u8; *size as usize];
                src.read_exact(&mut bytes)?;
                read_padding(bytes.len(), src)?;
                Ok(Value::Opaque(bytes))
            }
            Descriptor::Opaque { size: None, max } => {
                Ok(Value::Opaque(read_bounded_bytes(src, *max, "opaque")?))
            }
            Descriptor::String { max } => {
                let bytes = read_bounded_bytes(src, *max, "string")?;
                match String::from_utf8(bytes) {
                    Ok(text) => Ok(Value::String(text)),
                    Err(_) => Err(malformed("string bytes are not UTF-8")),
                }
            }
            Descriptor::Array { element, size: Some(size), .. } => {
                let mut items = Vec::new();
                for _ in 0..*size {
                    items.push(element.decode(src)?);
                }
                Ok(Value::Array(items))
            }
            Descriptor::Array { element, size: None, max } => {
                let count: u32 = deserialize(src)?;
                if count > *max {
                    return Err(malformed(format!(
                        "array count {count} exceeds bound {max}"
                    )));
                }
                // Grown element by element: allocation tracks decoded
                // input, not the claimed count.
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(element.decode(src)?);
                }
                Ok(Value::Array(items))
            }
            Descriptor::Optional(element) => match deserialize::<u32>(src)? {
                0 => Ok(Value::Optional(None)),
                1 => Ok(Value::Optional(Some(Box::new(element.decode(src)?)))),
                count => Err(malformed(format!("optional count must be 0 or 1, got {count}"))),
            },
            Descriptor::Struct(desc) => {
                let mut fields = Vec::with_capacity(desc.members().len());
                for (name, member) in desc.members() {
                    fields.push((name.clone(), member.decode(src)?));
                }
                Ok(Value::Struct(fields))
            }
            Descriptor::Union(desc) => {
                let discriminant = desc.discriminant.decode(src)?;
                // Enum membership was already checked; an undeclared code
                // can only mean a declared enum code with no arm.
                let code = discriminant_code(&discriminant)
                    .ok_or_else(|| malformed("union discriminant is not an enum or bool"))?;
                let arm = desc.arm_for(code).ok_or(XdrError::UnknownDiscriminant(code))?;
                let mut fields = Vec::with_capacity(arm.fields().len());
                for (name, field) in arm.fields() {
                    fields.push((name.clone(), field.decode(src)?));
                }
                Ok(Value::Union { discriminant: Box::new(discriminant), fields })
            }
        }
    }
}

/// A runtime value shaped by some [`Descriptor`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i32),
    UnsignedInt(u32),
    Hyper(i64),
    UnsignedHyper(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Enum(i32),
    Opaque(Vec<u8>),
    String(String),
    Array(Vec<Value>),
    Optional(Option<Box<Value>>),
    /// Members in declaration order; the order is load-bearing.
    Struct(Vec<(String, Value)>),
    Union { discriminant: Box<Value>, fields: Vec<(String, Value)> },
}

impl Value {
    /// Builds a struct value from `(name, value)` pairs in declaration
    /// order.
    pub fn structure<S: Into<String>>(fields: impl IntoIterator<Item = (S, Value)>) -> Self {
        Value::Struct(fields.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }

    /// Builds a union value from a discriminant and the selected arm's
    /// fields in declared order.
    pub fn union<S: Into<String>>(
        discriminant: Value,
        fields: impl IntoIterator<Item = (S, Value)>,
    ) -> Self {
        Value::Union {
            discriminant: Box::new(discriminant),
            fields: fields.into_iter().map(|(name, value)| (name.into(), value)).collect(),
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Value::UnsignedInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&[u8]> {
        match self {
            Value::Opaque(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Looks up a struct member by name.
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) | Value::Union { fields, .. } => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }
}

fn discriminant_code(value: &Value) -> Option<i32> {
    match value {
        Value::Enum(code) => Some(*code),
        Value::Bool(b) => Some(*b as i32),
        _ => None,
    }
}

fn check_bound(len: usize, max: u32, what: &str) -> Result<(), XdrError> {
    if len as u64 > max as u64 {
        return Err(bad_value(format!("{what} length {len} exceeds bound {max}")));
    }
    Ok(())
}

/// Length-prefixed byte string with the bound checked before any
/// allocation proportional to the claimed length.
fn read_bounded_bytes(src: &mut impl Read, max: u32, what: &str) -> Result<Vec<u8>, XdrError> {
    let length: u32 = deserialize(src)?;
    if length > max {
        return Err(malformed(format!("{what} length {length} exceeds bound {max}")));
    }
    let mut bytes = Vec::new();
    src.take(length as u64).read_to_end(&mut bytes)?;
    if bytes.len() != length as usize {
        return Err(XdrError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    read_padding(bytes.len(), src)?;
    Ok(bytes)
}

/// Fields must match the declared members exactly: same count, same names,
/// same order, encoded in declaration order. Partial construction is
/// rejected.
fn encode_fields<W: Write>(
    declared: &[(String, Descriptor)],
    supplied: &[(String, Value)],
    dest: &mut W,
    what: &str,
) -> Result<(), XdrError> {
    if supplied.len() != declared.len() {
        return Err(bad_value(format!(
            "{what} expects {} members, got {}",
            declared.len(),
            supplied.len()
        )));
    }
    for ((decl_name, member), (name, value)) in declared.iter().zip(supplied) {
        if name != decl_name {
            return Err(bad_value(format!(
                "{what} member {decl_name:?} missing or out of order (got {name:?})"
            )));
        }
        member.encode(value, dest)?;
    }
    Ok(())
}
