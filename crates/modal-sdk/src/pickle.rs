// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pickle encoding of call arguments and results.
//!
//! Remote functions receive a pickled `(args, kwargs)` tuple and return a
//! pickled value. Scalars, sequences and string-keyed mappings round-trip
//! through [`serde_pickle::Value`]; typed Rust values can be converted with
//! [`to_value`] and [`from_value`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
pub use serde_pickle::{HashableValue, Value};
use serde_pickle::{DeOptions, SerOptions};

use crate::error::Result;

/// Keyword arguments, ordered by name.
pub type Kwargs = BTreeMap<String, Value>;

/// Pickle a single value.
pub fn serialize(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_pickle::value_to_vec(value, SerOptions::new())?)
}

/// Unpickle a single value.
pub fn deserialize(data: &[u8]) -> Result<Value> {
    Ok(serde_pickle::value_from_slice(data, DeOptions::new())?)
}

/// Pickle positional and keyword arguments as an `(args, kwargs)` tuple.
pub fn serialize_args(args: Vec<Value>, kwargs: Kwargs) -> Result<Vec<u8>> {
    let kwargs = kwargs
        .into_iter()
        .map(|(name, value)| (HashableValue::String(name), value))
        .collect();
    serialize(&Value::Tuple(vec![Value::Tuple(args), Value::Dict(kwargs)]))
}

/// Convert any serializable value into a pickle value.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(serde_pickle::to_value(value)?)
}

/// Convert a pickle value into a typed Rust value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_pickle::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        for value in [
            Value::None,
            Value::Bool(true),
            Value::I64(-42),
            Value::F64(1.5),
            Value::String("hello".into()),
            Value::Bytes(vec![0, 159, 146, 150]),
        ] {
            let bytes = serialize(&value).unwrap();
            assert_eq!(deserialize(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_args_tuple_shape() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), Value::I64(2));
        let bytes = serialize_args(vec![Value::String("a".into())], kwargs).unwrap();

        let Value::Tuple(parts) = deserialize(&bytes).unwrap() else {
            panic!("expected tuple");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], Value::Tuple(vec![Value::String("a".into())]));
        match &parts[1] {
            Value::Dict(map) => {
                assert_eq!(map.get(&HashableValue::String("b".into())), Some(&Value::I64(2)));
            }
            other => panic!("expected dict, got {other:?}"),
        }
    }

    #[test]
    fn test_typed_conversion() {
        let value = to_value(&vec![1i64, 2, 3]).unwrap();
        let back: Vec<i64> = from_value(value).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_input_is_serialization_error() {
        let err = deserialize(b"").unwrap_err();
        assert!(matches!(err, crate::SdkError::Serialization(_)));
    }
}
