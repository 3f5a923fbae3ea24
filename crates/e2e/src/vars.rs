//! Per-case variables and `${name}` interpolation

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{E2eError, E2eResult};
use crate::identity::random_suffix;

/// Variables visible to one case
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    /// A scope seeded with `unique` and `uuid`, both stable for the case
    pub fn for_case() -> Self {
        let mut scope = Self::default();
        scope.set("unique", Value::String(random_suffix()));
        scope.set("uuid", Value::String(uuid::Uuid::new_v4().to_string()));
        scope
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn extend(&mut self, vars: BTreeMap<String, Value>) {
        self.vars.extend(vars);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn lookup(&self, name: &str) -> E2eResult<&Value> {
        self.vars
            .get(name)
            .ok_or_else(|| E2eError::UnknownVariable(name.to_string()))
    }

    /// Replace every `${name}` in `input`
    pub fn interpolate_str(&self, input: &str) -> E2eResult<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                E2eError::SpecParse(format!("unterminated placeholder in '{}'", input))
            })?;
            let name = after[..end].trim();
            match self.lookup(name)? {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Interpolate every string in a JSON document. A string that is exactly
    /// one placeholder is replaced by the variable's value, keeping its type.
    pub fn interpolate_json(&self, value: &Value) -> E2eResult<Value> {
        match value {
            Value::String(s) => match sole_placeholder(s) {
                Some(name) => self.lookup(name).cloned(),
                None => Ok(Value::String(self.interpolate_str(s)?)),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| self.interpolate_json(v))
                .collect::<E2eResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(self.interpolate_str(k)?, self.interpolate_json(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        None
    } else {
        Some(inner.trim())
    }
}

/// Names referenced by `${...}` in a string, in order
pub fn placeholders(input: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                names.push(after[..end].trim().to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Names referenced anywhere in a JSON document
pub fn json_placeholders(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => placeholders(s),
        Value::Array(items) => items.iter().flat_map(json_placeholders).collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(k, v)| {
                let mut names = placeholders(k);
                names.extend(json_placeholders(v));
                names
            })
            .collect(),
        _ => Vec::new(),
    }
}
