//! Typed attribute storage attached to graph operators and lowered nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dtype::DType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttrError {
    #[error("attribute `{0}` is missing")]
    Missing(String),
    #[error("attribute `{name}` has the wrong type, expected {expected}")]
    WrongType { name: String, expected: &'static str },
}

/// A single attribute value. The variants mirror the value families the
/// front end can attach to an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Int32s(Vec<i32>),
    Float(f32),
    Floats(Vec<f32>),
    Doubles(Vec<f64>),
    Bool(bool),
    Str(String),
    Strs(Vec<String>),
    DType(DType),
}

impl AttrValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Ints(_) => "ints",
            AttrValue::Int32s(_) => "int32s",
            AttrValue::Float(_) => "float",
            AttrValue::Floats(_) => "floats",
            AttrValue::Doubles(_) => "doubles",
            AttrValue::Bool(_) => "bool",
            AttrValue::Str(_) => "str",
            AttrValue::Strs(_) => "strs",
            AttrValue::DType(_) => "dtype",
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<Vec<i32>> for AttrValue {
    fn from(v: Vec<i32>) -> Self {
        AttrValue::Int32s(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(v: Vec<f32>) -> Self {
        AttrValue::Floats(v)
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(v: Vec<f64>) -> Self {
        AttrValue::Doubles(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<DType> for AttrValue {
    fn from(v: DType) -> Self {
        AttrValue::DType(v)
    }
}

/// Ordered attribute map. Iteration order is the key order, which keeps
/// serialized programs deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrMap {
    entries: BTreeMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Builder-style insertion, handy when assembling literal maps.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.entries.iter()
    }

    pub fn get_int(&self, name: &str) -> Result<i64, AttrError> {
        match self.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "int",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_int_or(&self, name: &str, default: i64) -> i64 {
        self.get_int(name).unwrap_or(default)
    }

    pub fn opt_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_ints(&self, name: &str) -> Result<Vec<i64>, AttrError> {
        match self.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v.clone()),
            Some(AttrValue::Int32s(v)) => Ok(v.iter().map(|x| *x as i64).collect()),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "ints",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn opt_ints(&self, name: &str) -> Option<Vec<i64>> {
        self.get_ints(name).ok()
    }

    pub fn get_int32s(&self, name: &str) -> Result<Vec<i32>, AttrError> {
        match self.get(name) {
            Some(AttrValue::Int32s(v)) => Ok(v.clone()),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "int32s",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<f32, AttrError> {
        match self.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "float",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_floats(&self, name: &str) -> Result<Vec<f32>, AttrError> {
        match self.get(name) {
            Some(AttrValue::Floats(v)) => Ok(v.clone()),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "floats",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_doubles(&self, name: &str) -> Result<Vec<f64>, AttrError> {
        match self.get(name) {
            Some(AttrValue::Doubles(v)) => Ok(v.clone()),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "doubles",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, AttrError> {
        match self.get(name) {
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "bool",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<String, AttrError> {
        match self.get(name) {
            Some(AttrValue::Str(v)) => Ok(v.clone()),
            Some(_) => Err(AttrError::WrongType {
                name: name.to_string(),
                expected: "str",
            }),
            None => Err(AttrError::Missing(name.to_string())),
        }
    }

    pub fn get_str_or(&self, name: &str, default: &str) -> String {
        self.get_str(name).unwrap_or_else(|_| default.to_string())
    }
}

impl FromIterator<(String, AttrValue)> for AttrMap {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let attrs = AttrMap::new()
            .with("axis", -1i64)
            .with("scale", 2.0f32)
            .with("dims", vec![1i64, 2, 3])
            .with("mode", "max");
        assert_eq!(attrs.get_int("axis").unwrap(), -1);
        assert_eq!(attrs.get_float("scale").unwrap(), 2.0);
        assert_eq!(attrs.get_ints("dims").unwrap(), vec![1, 2, 3]);
        assert_eq!(attrs.get_str("mode").unwrap(), "max");
        assert!(matches!(
            attrs.get_int("missing"),
            Err(AttrError::Missing(_))
        ));
        assert!(matches!(
            attrs.get_int("mode"),
            Err(AttrError::WrongType { .. })
        ));
    }

    #[test]
    fn int32s_widen_to_ints() {
        let attrs = AttrMap::new().with("starts", vec![1i32, 2]);
        assert_eq!(attrs.get_ints("starts").unwrap(), vec![1i64, 2]);
        assert_eq!(attrs.get_int32s("starts").unwrap(), vec![1i32, 2]);
    }
}
