// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structural marshalling between script values and host JSON (§4.5).
//!
//! A table whose keys are exactly `1..=N` becomes a JSON array; any other
//! table becomes a JSON object, and every key in it must be a string.
//! Lua has one number type for our purposes here: everything round-trips
//! through `f64`.

use mlua::{Lua, Table, Value};
use serde_json::{Map, Value as Json};
use thiserror::Error;

/// Errors converting between script values and JSON.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// A table mixed non-string keys with non-sequence use, or a
    /// non-sequence table had a non-string key.
    #[error("table keys must be strings (sequences use 1..N integer keys)")]
    NonStringKey,
    /// A value of a type with no JSON equivalent (function, userdata, thread).
    #[error("value of type {0} cannot be marshalled to JSON")]
    UnsupportedType(&'static str),
    /// mlua reported an error while iterating or reading a value.
    #[error("lua error during marshalling: {0}")]
    Lua(String),
}

/// Convert a script value into JSON per the rules above.
pub fn value_to_json(value: Value) -> Result<Json, MarshalError> {
    match value {
        Value::Nil => Ok(Json::Null),
        Value::Boolean(b) => Ok(Json::Bool(b)),
        Value::Integer(i) => Ok(json_number(i as f64)),
        Value::Number(n) => Ok(json_number(n)),
        Value::String(s) => Ok(Json::String(
            s.to_str().map_err(|e| MarshalError::Lua(e.to_string()))?.to_owned(),
        )),
        Value::Table(t) => table_to_json(t),
        Value::Function(_) => Err(MarshalError::UnsupportedType("function")),
        Value::Thread(_) => Err(MarshalError::UnsupportedType("thread")),
        Value::UserData(_) | Value::LightUserData(_) => {
            Err(MarshalError::UnsupportedType("userdata"))
        }
        Value::Error(e) => Err(MarshalError::Lua(e.to_string())),
    }
}

fn json_number(n: f64) -> Json {
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

fn table_to_json(table: Table) -> Result<Json, MarshalError> {
    let mut entries: Vec<(Value, Value)> = Vec::new();
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair.map_err(|e| MarshalError::Lua(e.to_string()))?;
        entries.push((k, v));
    }

    if entries.is_empty() {
        return Ok(Json::Object(Map::new()));
    }

    let all_integer_keys = entries
        .iter()
        .all(|(k, _)| matches!(k, Value::Integer(_)));

    if all_integer_keys {
        let mut indices: Vec<i64> = entries
            .iter()
            .map(|(k, _)| match k {
                Value::Integer(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        indices.sort_unstable();
        let is_sequence = indices[0] == 1 && indices.windows(2).all(|w| w[1] == w[0] + 1);
        if is_sequence {
            let mut array = vec![Json::Null; indices.len()];
            for (k, v) in entries {
                if let Value::Integer(i) = k {
                    array[(i - 1) as usize] = value_to_json(v)?;
                }
            }
            return Ok(Json::Array(array));
        }
    }

    let mut map = Map::new();
    for (k, v) in entries {
        let key = match k {
            Value::String(s) => s.to_str().map_err(|e| MarshalError::Lua(e.to_string()))?.to_owned(),
            _ => return Err(MarshalError::NonStringKey),
        };
        map.insert(key, value_to_json(v)?);
    }
    Ok(Json::Object(map))
}

/// Convert JSON into a script value for `lua`, the inverse of
/// [`value_to_json`].
pub fn json_to_value<'lua>(lua: &'lua Lua, json: &Json) -> mlua::Result<Value<'lua>> {
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        Json::String(s) => Value::String(lua.create_string(s)?),
        Json::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.set((i + 1) as i64, json_to_value(lua, item)?)?;
            }
            Value::Table(table)
        }
        Json::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_value(lua, v)?)?;
            }
            Value::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_round_trips_as_array() {
        let lua = Lua::new();
        let v = json_to_value(&lua, &json!([1.0, "two", true])).unwrap();
        let back = value_to_json(v).unwrap();
        assert_eq!(back, json!([1.0, "two", true]));
    }

    #[test]
    fn mapping_round_trips_as_object() {
        let lua = Lua::new();
        let v = json_to_value(&lua, &json!({"a": 1.0, "b": {"c": 2.0}})).unwrap();
        let back = value_to_json(v).unwrap();
        assert_eq!(back, json!({"a": 1.0, "b": {"c": 2.0}}));
    }

    #[test]
    fn non_contiguous_integer_keys_are_not_a_sequence() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        table.set(1, "a").unwrap();
        table.set(3, "b").unwrap();
        let err = table_to_json(table).unwrap_err();
        assert!(matches!(err, MarshalError::NonStringKey));
    }

    #[test]
    fn empty_table_marshals_to_empty_object() {
        let lua = Lua::new();
        let table = lua.create_table().unwrap();
        assert_eq!(table_to_json(table).unwrap(), json!({}));
    }

    #[test]
    fn function_values_are_unsupported() {
        let lua = Lua::new();
        let f = lua.create_function(|_, ()| Ok(())).unwrap();
        let err = value_to_json(Value::Function(f)).unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedType("function")));
    }
}
