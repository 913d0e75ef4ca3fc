use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use speckle_types::ObjectReference;

use crate::base::Base;

/// A property value held by a [`Base`].
///
/// The set of variants is closed. Each has a fixed wire encoding: enums as
/// ordinal integers, timestamps as ISO-8601 strings, matrices as flat arrays of
/// 16 numbers in row-major order.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Ordinal of an enumeration member.
    Enum(i64),
    /// 4x4 transform, row-major.
    Matrix(Box<[f64; 16]>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A nested object. Whether it is inlined or detached depends on the
    /// property it sits under.
    Object(Arc<Base>),
    /// A reference to an object that already lives in a store.
    Reference(ObjectReference),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Enum(_) => "enum",
            Value::Matrix(_) => "matrix",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Reference(_) => "reference",
        }
    }

    /// Build a list from anything convertible into values.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) | Value::Enum(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a float. Integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<Base>> {
        match self {
            Value::Object(base) => Some(base),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectReference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Matrix(a), Value::Matrix(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b) || a.content_eq(b),
            (Value::Reference(a), Value::Reference(b)) => a.referenced_id == b.referenced_id,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<[f64; 16]> for Value {
    fn from(v: [f64; 16]) -> Self {
        Value::Matrix(Box::new(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<Arc<Base>> for Value {
    fn from(v: Arc<Base>) -> Self {
        Value::Object(v)
    }
}

impl From<Base> for Value {
    fn from(v: Base) -> Self {
        Value::Object(Arc::new(v))
    }
}

impl From<ObjectReference> for Value {
    fn from(v: ObjectReference) -> Self {
        Value::Reference(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speckle_types::ObjectId;

    #[test]
    fn conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(3), Value::Int(3));
        assert_eq!(Value::from(2.5), Value::Float(2.5));
        assert_eq!(Value::from("a"), Value::String("a".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::list([1, 2]), Value::List(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::Int(4).as_f64(), Some(4.0));
        assert_eq!(Value::Enum(2).as_i64(), Some(2));
        assert_eq!(Value::from("s").as_str(), Some("s"));
        assert!(Value::Null.is_null());
        assert!(Value::Bool(true).as_list().is_none());
    }

    #[test]
    fn int_and_float_are_distinct() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Int(1).kind(), "int");
    }

    #[test]
    fn references_compare_by_target() {
        let id = ObjectId::from_bytes([1; 16]);
        let a = Value::Reference(ObjectReference::new(id));
        let b = Value::Reference(ObjectReference::with_closure(id, Default::default()));
        assert_eq!(a, b);
    }

    #[test]
    fn objects_compare_by_content() {
        let a = Base::dynamic();
        a.set("x", 1).unwrap();
        let b = Base::dynamic();
        b.set("x", 1).unwrap();
        assert_eq!(Value::from(a), Value::from(b));
    }
}
