// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encoding of class constructor parameters.
//!
//! Parameters are encoded as a `ClassParameterSet` whose entries are sorted
//! by name, so the bytes are identical no matter how the caller's map was
//! ordered and match what other client implementations produce.

use std::collections::HashMap;

use modal_protocol::api::{
    self, ParameterType, class_parameter_spec::DefaultOneof, class_parameter_value::ValueOneof,
};
use prost::Message;
use tracing::warn;

use crate::error::{Result, SdkError};

/// A value bound to a class parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(value: Vec<u8>) -> Self {
        ParamValue::Bytes(value)
    }
}

/// Encode `params` against `schema` into serialized `ClassParameterSet` bytes.
pub fn encode_parameter_set(
    schema: &[api::ClassParameterSpec],
    params: &HashMap<String, ParamValue>,
) -> Result<Vec<u8>> {
    for name in params.keys() {
        if !schema.iter().any(|spec| &spec.name == name) {
            warn!(parameter = %name, "ignoring unknown class parameter");
        }
    }

    let mut parameters = schema
        .iter()
        .map(|spec| encode_parameter(spec, params.get(&spec.name)))
        .collect::<Result<Vec<_>>>()?;
    parameters.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(api::ClassParameterSet { parameters }.encode_to_vec())
}

fn encode_parameter(
    spec: &api::ClassParameterSpec,
    value: Option<&ParamValue>,
) -> Result<api::ClassParameterValue> {
    let name = &spec.name;
    let value = match value {
        Some(value) => Some(value.clone()),
        None if spec.has_default => default_value(spec),
        None => None,
    };

    let value_oneof = match (spec.r#type(), value) {
        (ParameterType::String, Some(ParamValue::String(s))) => ValueOneof::StringValue(s),
        (ParameterType::Int, Some(ParamValue::Int(i))) => ValueOneof::IntValue(i),
        (ParameterType::Bool, Some(ParamValue::Bool(b))) => ValueOneof::BoolValue(b),
        (ParameterType::Bytes, Some(ParamValue::Bytes(b))) => ValueOneof::BytesValue(b),
        (
            ParameterType::String | ParameterType::Int | ParameterType::Bool | ParameterType::Bytes,
            None,
        ) => {
            return Err(SdkError::Invalid(format!("missing required parameter '{name}'")));
        }
        (
            ty @ (ParameterType::String
            | ParameterType::Int
            | ParameterType::Bool
            | ParameterType::Bytes),
            Some(_),
        ) => {
            return Err(SdkError::Invalid(format!(
                "parameter '{name}' must be of type {}",
                type_name(ty)
            )));
        }
        (other, _) => {
            return Err(SdkError::Invalid(format!(
                "unsupported parameter type {other:?} for '{name}'"
            )));
        }
    };

    Ok(api::ClassParameterValue {
        name: name.clone(),
        r#type: spec.r#type,
        value_oneof: Some(value_oneof),
    })
}

fn default_value(spec: &api::ClassParameterSpec) -> Option<ParamValue> {
    match (&spec.default_oneof, spec.r#type()) {
        (Some(DefaultOneof::StringDefault(s)), _) => Some(ParamValue::String(s.clone())),
        (Some(DefaultOneof::IntDefault(i)), _) => Some(ParamValue::Int(*i)),
        (Some(DefaultOneof::BoolDefault(b)), _) => Some(ParamValue::Bool(*b)),
        (Some(DefaultOneof::BytesDefault(b)), _) => Some(ParamValue::Bytes(b.clone())),
        (Some(DefaultOneof::PickleDefault(_)), _) => None,
        // An unset default is the zero value of the declared type.
        (None, ParameterType::String) => Some(ParamValue::String(String::new())),
        (None, ParameterType::Int) => Some(ParamValue::Int(0)),
        (None, ParameterType::Bool) => Some(ParamValue::Bool(false)),
        (None, ParameterType::Bytes) => Some(ParamValue::Bytes(Vec::new())),
        (None, _) => None,
    }
}

fn type_name(ty: ParameterType) -> &'static str {
    match ty {
        ParameterType::String => "string",
        ParameterType::Int => "integer",
        ParameterType::Bool => "boolean",
        ParameterType::Bytes => "bytes",
        _ => "unknown",
    }
}
