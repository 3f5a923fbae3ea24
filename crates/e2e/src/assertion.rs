//! Assertion layer - status-code sets and structural body checks
//!
//! Acceptable outcomes are sets, not single codes. Where the target API's
//! contract is ambiguous the suites list every code that is acceptable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::client::Captured;
use crate::error::{E2eError, E2eResult};
use crate::vars::Scope;

/// A set of acceptable status codes. YAML accepts `201` or `[200, 201]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<u16>", into = "Vec<u16>")]
pub struct StatusSet(Vec<u16>);

impl StatusSet {
    pub fn new(codes: &[u16]) -> Self {
        Self(codes.to_vec())
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn codes(&self) -> &[u16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<StatusSet> for Vec<u16> {
    fn from(set: StatusSet) -> Self {
        set.0
    }
}

impl From<OneOrMany<u16>> for StatusSet {
    fn from(v: OneOrMany<u16>) -> Self {
        Self(v.into_vec())
    }
}

impl fmt::Display for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes: Vec<String> = self.0.iter().map(u16::to_string).collect();
        write!(f, "{{{}}}", codes.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonKind {
    Array,
    Object,
    ArrayOrObject,
    String,
}

impl JsonKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
            JsonKind::ArrayOrObject => value.is_array() || value.is_object(),
            JsonKind::String => value.is_string(),
        }
    }
}

/// A structural assertion on the response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    /// Whole body must be this JSON kind
    JsonType(JsonKind),

    /// Pointer resolves to a non-null value
    JsonHas(String),

    /// At least one pointer resolves to a non-null value
    JsonHasAny(Vec<String>),

    JsonEq { pointer: String, value: Value },

    /// Pointer resolves to a string starting with `prefix`
    JsonStartsWith { pointer: String, prefix: String },

    /// Pointer resolves to a string containing `text`
    JsonContains { pointer: String, text: String },

    /// Raw body contains every string (case-sensitive)
    BodyContains(OneOrMany<String>),

    /// Raw body contains at least one string (case-insensitive)
    BodyContainsAny(Vec<String>),
}

impl Check {
    /// Substitute variables inside expected values
    pub fn resolve(&self, scope: &Scope) -> E2eResult<Self> {
        Ok(match self {
            Check::JsonEq { pointer, value } => Check::JsonEq {
                pointer: pointer.clone(),
                value: scope.interpolate_json(value)?,
            },
            Check::JsonStartsWith { pointer, prefix } => Check::JsonStartsWith {
                pointer: pointer.clone(),
                prefix: scope.interpolate_str(prefix)?,
            },
            Check::JsonContains { pointer, text } => Check::JsonContains {
                pointer: pointer.clone(),
                text: scope.interpolate_str(text)?,
            },
            Check::BodyContains(items) => Check::BodyContains(OneOrMany::Many(
                items
                    .clone()
                    .into_vec()
                    .iter()
                    .map(|s| scope.interpolate_str(s))
                    .collect::<E2eResult<Vec<_>>>()?,
            )),
            other => other.clone(),
        })
    }

    /// `Ok(())` when satisfied, otherwise the reason it is not
    pub fn evaluate(&self, resp: &Captured) -> Result<(), String> {
        let json = || {
            resp.json
                .as_ref()
                .ok_or_else(|| format!("body is not JSON: {}", resp.body_snippet()))
        };
        let pointed = |pointer: &str| -> Result<Value, String> {
            json()?
                .pointer(pointer)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| format!("missing {} in {}", pointer, resp.body_snippet()))
        };

        match self {
            Check::JsonType(kind) => {
                let value = json()?;
                if kind.matches(value) {
                    Ok(())
                } else {
                    Err(format!("expected JSON {:?}, got {}", kind, resp.body_snippet()))
                }
            }
            Check::JsonHas(pointer) => pointed(pointer).map(|_| ()),
            Check::JsonHasAny(pointers) => {
                if pointers.iter().any(|p| pointed(p).is_ok()) {
                    Ok(())
                } else {
                    Err(format!("none of {:?} present in {}", pointers, resp.body_snippet()))
                }
            }
            Check::JsonEq { pointer, value } => {
                let actual = pointed(pointer)?;
                if &actual == value {
                    Ok(())
                } else {
                    Err(format!("{} is {}, expected {}", pointer, actual, value))
                }
            }
            Check::JsonStartsWith { pointer, prefix } => {
                let actual = pointed(pointer)?;
                match actual.as_str() {
                    Some(s) if s.starts_with(prefix.as_str()) => Ok(()),
                    _ => Err(format!("{} is {}, expected prefix '{}'", pointer, actual, prefix)),
                }
            }
            Check::JsonContains { pointer, text } => {
                let actual = pointed(pointer)?;
                let haystack = match &actual {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if haystack.contains(text.as_str()) {
                    Ok(())
                } else {
                    Err(format!("{} is {}, expected it to contain '{}'", pointer, actual, text))
                }
            }
            Check::BodyContains(items) => {
                let missing: Vec<String> = items
                    .clone()
                    .into_vec()
                    .into_iter()
                    .filter(|s| !resp.body.contains(s.as_str()))
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("body lacks {:?}: {}", missing, resp.body_snippet()))
                }
            }
            Check::BodyContainsAny(items) => {
                let body = resp.body.to_lowercase();
                if items.iter().any(|s| body.contains(&s.to_lowercase())) {
                    Ok(())
                } else {
                    Err(format!("body contains none of {:?}: {}", items, resp.body_snippet()))
                }
            }
        }
    }
}

/// Expected outcome of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expect {
    pub status: StatusSet,

    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub checks: Vec<Check>,

    /// Run `checks` only when the status is in this set
    #[serde(default)]
    pub only_when: Option<StatusSet>,
}

impl Expect {
    pub fn status(codes: &[u16]) -> Self {
        Self {
            status: StatusSet::new(codes),
            checks: Vec::new(),
            only_when: None,
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    /// Compare a response against this expectation
    pub fn verify(&self, scenario: &str, resp: &Captured, scope: &Scope) -> E2eResult<()> {
        if !self.status.contains(resp.status) {
            return Err(E2eError::ContractViolation {
                scenario: scenario.to_string(),
                expected: self.status.to_string(),
                actual: resp.status,
                body: resp.body_snippet(),
            });
        }

        if let Some(gate) = &self.only_when {
            if !gate.contains(resp.status) {
                return Ok(());
            }
        }

        for check in &self.checks {
            check
                .resolve(scope)?
                .evaluate(resp)
                .map_err(|reason| E2eError::CheckFailed {
                    scenario: scenario.to_string(),
                    reason,
                })?;
        }
        Ok(())
    }
}

/// First non-null value among candidate pointers
pub fn first_pointer(resp: &Captured, pointers: &[String]) -> Option<Value> {
    let json = resp.json.as_ref()?;
    pointers
        .iter()
        .filter_map(|p| json.pointer(p))
        .find(|v| !v.is_null())
        .cloned()
}
