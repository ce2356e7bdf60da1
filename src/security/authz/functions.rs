//! Helper functions visible inside policy matcher expressions.
//!
//! Casbin evaluates matchers with rhai built for 32-bit integers and no
//! floats, so claim values pass through [`EngineValue`] on their way in:
//! JSON numbers holding a whole value in `INT` range become `INT`, any
//! other number is carried as a `{"$number": "<text>"}` map. `mapValue` and
//! `authValue` reject such a number with a helper error.
//! A helper given arguments of the wrong type logs the failure and
//! evaluates to `()`, which never compares equal to a claim value.

use casbin::function_map::OperatorFunction;
use casbin::{CoreApi, Enforcer};
use rhai::{Array, Dynamic, Map, INT};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Number, Value};

use crate::http::canonical_header_key;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HelperError {
    #[error("{func}: argument {index} must be {expected}, got {got}")]
    Type {
        func: &'static str,
        index: usize,
        expected: &'static str,
        got: String,
    },
    #[error("{func}: {path:?} holds {value}, which is not a whole number in integer range")]
    Number {
        func: &'static str,
        path: String,
        value: String,
    },
}

/// Map key marking a JSON number the engine cannot represent.
pub const NUMBER_TAG: &str = "$number";

/// Serializes a JSON value into the shape the rhai engine accepts.
pub struct EngineValue<'a>(pub &'a Value);

fn engine_int(n: &Number) -> Option<INT> {
    n.as_i64()
        .and_then(|i| INT::try_from(i).ok())
        .or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= INT::MIN as f64 && *f <= INT::MAX as f64)
                .map(|f| f as INT)
        })
}

impl Serialize for EngineValue<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => s.serialize_unit(),
            Value::Bool(b) => s.serialize_bool(*b),
            Value::Number(n) => match engine_int(n) {
                Some(i) => i.serialize(s),
                None => {
                    let mut map = s.serialize_map(Some(1))?;
                    map.serialize_entry(NUMBER_TAG, &n.to_string())?;
                    map.end()
                }
            },
            Value::String(v) => s.serialize_str(v),
            Value::Array(items) => s.collect_seq(items.iter().map(EngineValue)),
            Value::Object(fields) => s.collect_map(fields.iter().map(|(k, v)| (k, EngineValue(v)))),
        }
    }
}

/// `serialize_with` adapter for claim fields.
pub fn serialize_engine_value<S: Serializer>(value: &Value, s: S) -> Result<S::Ok, S::Error> {
    EngineValue(value).serialize(s)
}

type HelperResult = Result<Dynamic, HelperError>;

fn type_error(func: &'static str, index: usize, expected: &'static str, got: &Dynamic) -> HelperError {
    HelperError::Type {
        func,
        index,
        expected,
        got: got.type_name().to_string(),
    }
}

fn as_map(func: &'static str, index: usize, value: &Dynamic) -> Result<Map, HelperError> {
    value
        .clone()
        .try_cast::<Map>()
        .ok_or_else(|| type_error(func, index, "a map", value))
}

fn as_str(func: &'static str, index: usize, value: &Dynamic) -> Result<String, HelperError> {
    value
        .clone()
        .into_string()
        .map_err(|_| type_error(func, index, "a string", value))
}

fn as_array(func: &'static str, index: usize, value: &Dynamic) -> Result<Array, HelperError> {
    value
        .clone()
        .into_array()
        .map_err(|_| type_error(func, index, "an array", value))
}

fn unrepresentable(value: &Dynamic) -> Option<String> {
    let map = value.read_lock::<Map>()?;
    if map.len() != 1 {
        return None;
    }
    map.get(NUMBER_TAG)?.clone().into_string().ok()
}

fn lookup(func: &'static str, map: &Map, path: &str) -> HelperResult {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Ok(Dynamic::UNIT);
    };
    let mut current = match map.get(first) {
        Some(v) => v.clone(),
        None => return Ok(Dynamic::UNIT),
    };
    for segment in segments {
        current = match current.try_cast::<Map>().and_then(|m| m.get(segment).cloned()) {
            Some(v) => v,
            None => return Ok(Dynamic::UNIT),
        };
    }
    match unrepresentable(&current) {
        Some(value) => Err(HelperError::Number {
            func,
            path: path.to_string(),
            value,
        }),
        None => Ok(current),
    }
}

/// `mapValue(map, "a.b.c")`: nested lookup, `()` when absent.
pub fn map_value(map: &Dynamic, path: &Dynamic) -> HelperResult {
    let map = as_map("mapValue", 0, map)?;
    let path = as_str("mapValue", 1, path)?;
    lookup("mapValue", &map, &path)
}

/// `authValue(r.sub, "attrs.role")`: lookup inside the authentication claims.
pub fn auth_value(claims: &Dynamic, path: &Dynamic) -> HelperResult {
    let claims = as_map("authValue", 0, claims)?;
    let path = as_str("authValue", 1, path)?;
    match claims.get("auth").and_then(|a| a.clone().try_cast::<Map>()) {
        Some(auth) => lookup("authValue", &auth, &path),
        None => Ok(Dynamic::UNIT),
    }
}

fn values_of(func: &'static str, claims: &Dynamic, field: &str, name: &str) -> Result<Array, HelperError> {
    let claims = as_map(func, 0, claims)?;
    let values = claims
        .get(field)
        .and_then(|f| f.clone().try_cast::<Map>())
        .and_then(|m| m.get(name).cloned());
    match values {
        Some(v) => as_array(func, 0, &v),
        None => Ok(Array::new()),
    }
}

fn first_or_empty(values: Array) -> Dynamic {
    values.into_iter().next().unwrap_or_else(|| Dynamic::from(String::new()))
}

pub fn query_value(claims: &Dynamic, name: &Dynamic) -> HelperResult {
    let name = as_str("queryValue", 1, name)?;
    Ok(first_or_empty(values_of("queryValue", claims, "query", &name)?))
}

pub fn query_values(claims: &Dynamic, name: &Dynamic) -> HelperResult {
    let name = as_str("queryValues", 1, name)?;
    Ok(Dynamic::from_array(values_of("queryValues", claims, "query", &name)?))
}

pub fn header_value(claims: &Dynamic, name: &Dynamic) -> HelperResult {
    let name = canonical_header_key(&as_str("headerValue", 1, name)?);
    Ok(first_or_empty(values_of("headerValue", claims, "header", &name)?))
}

pub fn header_values(claims: &Dynamic, name: &Dynamic) -> HelperResult {
    let name = canonical_header_key(&as_str("headerValues", 1, name)?);
    Ok(Dynamic::from_array(values_of("headerValues", claims, "header", &name)?))
}

pub fn contains_string(list: &Dynamic, want: &Dynamic) -> HelperResult {
    let list = as_array("containsString", 0, list)?;
    let want = as_str("containsString", 1, want)?;
    Ok(Dynamic::from(
        list.iter()
            .any(|v| v.clone().into_string().is_ok_and(|s| s == want)),
    ))
}

fn to_int(value: &Dynamic) -> Option<INT> {
    value.as_int().ok()
}

pub fn contains_int(list: &Dynamic, want: &Dynamic) -> HelperResult {
    let list = as_array("containsInt", 0, list)?;
    let want = to_int(want).ok_or_else(|| type_error("containsInt", 1, "an integer", want))?;
    Ok(Dynamic::from(list.iter().any(|v| to_int(v) == Some(want))))
}

pub fn as_string_slice(value: &Dynamic) -> HelperResult {
    let list = as_array("asStringSlice", 0, value)?;
    let mut out = Array::with_capacity(list.len());
    for v in &list {
        out.push(Dynamic::from(as_str("asStringSlice", 0, v)?));
    }
    Ok(Dynamic::from_array(out))
}

pub fn as_int_slice(value: &Dynamic) -> HelperResult {
    let list = as_array("asIntSlice", 0, value)?;
    let mut out = Array::with_capacity(list.len());
    for v in &list {
        let i = to_int(v).ok_or_else(|| type_error("asIntSlice", 0, "an array of integers", value))?;
        out.push(Dynamic::from_int(i));
    }
    Ok(Dynamic::from_array(out))
}

fn settle(result: HelperResult) -> Dynamic {
    result.unwrap_or_else(|e| {
        tracing::debug!(target: "audit", error = %e, "Policy helper failed");
        Dynamic::UNIT
    })
}

/// Register every helper on `enforcer`.
pub fn register(enforcer: &mut Enforcer) {
    enforcer.add_function("mapValue", OperatorFunction::Arg2(|a, b| settle(map_value(&a, &b))));
    enforcer.add_function("authValue", OperatorFunction::Arg2(|a, b| settle(auth_value(&a, &b))));
    enforcer.add_function("queryValue", OperatorFunction::Arg2(|a, b| settle(query_value(&a, &b))));
    enforcer.add_function("queryValues", OperatorFunction::Arg2(|a, b| settle(query_values(&a, &b))));
    enforcer.add_function("headerValue", OperatorFunction::Arg2(|a, b| settle(header_value(&a, &b))));
    enforcer.add_function("headerValues", OperatorFunction::Arg2(|a, b| settle(header_values(&a, &b))));
    enforcer.add_function("containsString", OperatorFunction::Arg2(|a, b| settle(contains_string(&a, &b))));
    enforcer.add_function("containsInt", OperatorFunction::Arg2(|a, b| settle(contains_int(&a, &b))));
    enforcer.add_function("asStringSlice", OperatorFunction::Arg1(|a| settle(as_string_slice(&a))));
    enforcer.add_function("asIntSlice", OperatorFunction::Arg1(|a| settle(as_int_slice(&a))));
}
