//! Declarative YAML endpoint modules
//!
//! One file per resource area. A suite lists cases; a case is a sequence of
//! requests, each with an optional expectation. Cases never rely on each
//! other: anything a case needs, it creates in its own setup steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::assertion::{Expect, OneOrMany};
use crate::client::{Body, Method};
use crate::error::{E2eError, E2eResult};
use crate::identity::{Principal, Slot};
use crate::vars::{json_placeholders, placeholders};

/// One endpoint module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    /// Unique name for this suite
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering
    #[serde(default)]
    pub tags: Vec<String>,

    /// Natural keys deleted before and after every case
    #[serde(default)]
    pub cleanup: Option<Cleanup>,

    pub cases: Vec<Case>,
}

/// Known natural keys to clear so repeated runs do not collide
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cleanup {
    /// Path template; `{key}` is replaced by each key
    pub path: String,

    #[serde(
        default = "default_cleanup_principal",
        rename = "as",
        with = "serde_yaml::with::singleton_map"
    )]
    pub principal: Principal,

    pub keys: Vec<String>,
}

fn default_cleanup_principal() -> Principal {
    Principal::Admin
}

impl Cleanup {
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.keys.iter().map(|k| self.path.replace("{key}", k))
    }
}

/// One independent check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Known contract bug in the target; a failure is reported, not counted
    #[serde(default)]
    pub known_issue: Option<String>,

    pub steps: Vec<TestStep>,
}

/// A single step in a case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TestStep {
    /// Issue an HTTP request
    Request(RequestStep),

    /// Log a message (for debugging)
    Log { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    #[serde(
        rename = "as",
        default = "default_principal",
        with = "serde_yaml::with::singleton_map"
    )]
    pub principal: Principal,

    pub method: Method,

    pub path: String,

    /// JSON body
    #[serde(default)]
    pub json: Option<Value>,

    /// Verbatim body, for malformed-input cases
    #[serde(default)]
    pub raw: Option<String>,

    #[serde(default)]
    pub content_type: Option<String>,

    /// `None` means fire-and-forget: any status is accepted
    #[serde(default)]
    pub expect: Option<Expect>,

    /// Variable name -> candidate JSON pointers; first non-null wins
    #[serde(default)]
    pub save: BTreeMap<String, OneOrMany<String>>,

    /// Failure here is an environment problem, not a contract violation
    #[serde(default)]
    pub setup: bool,

    /// Runs even after an earlier step failed; its own failure is only logged
    #[serde(default)]
    pub teardown: bool,
}

fn default_principal() -> Principal {
    Principal::Anonymous
}

impl RequestStep {
    pub fn label(&self) -> String {
        format!("{} {} as {}", self.method.as_str(), self.path, self.principal.label())
    }

    /// Body before interpolation
    pub fn body_template(&self) -> Body {
        match (&self.json, &self.raw) {
            (Some(v), _) => Body::Json(v.clone()),
            (None, Some(text)) => Body::Raw {
                text: text.clone(),
                content_type: self.content_type.clone(),
            },
            (None, None) => Body::Empty,
        }
    }
}

impl TestStep {
    pub fn name(&self) -> String {
        match self {
            TestStep::Request(r) => r.label(),
            TestStep::Log { message } => format!("log: {}", message),
        }
    }
}

/// Identities a case needs before it can run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub slots: BTreeSet<Slot>,
    pub fresh: bool,
}

impl Requirements {
    fn note_principal(&mut self, principal: &Principal) {
        if let Some(slot) = principal.slot() {
            self.slots.insert(slot);
        }
        if *principal == Principal::Fresh {
            self.fresh = true;
        }
    }

    fn note_var(&mut self, name: &str) {
        let Some((prefix, _)) = name.split_once('.') else {
            return;
        };
        if let Some(slot) = Slot::ALL.iter().find(|s| s.var_prefix() == prefix) {
            self.slots.insert(*slot);
        }
        if prefix == "fresh" {
            self.fresh = true;
        }
    }
}

impl Case {
    /// Identities used as principals or referenced as `${slot.field}`
    pub fn requirements(&self, cleanup: Option<&Cleanup>) -> Requirements {
        let mut req = Requirements::default();
        if let Some(c) = cleanup {
            req.note_principal(&c.principal);
        }
        for step in &self.steps {
            let r = match step {
                TestStep::Request(r) => r,
                TestStep::Log { message } => {
                    for name in placeholders(message) {
                        req.note_var(&name);
                    }
                    continue;
                }
            };
            req.note_principal(&r.principal);
            let mut names = placeholders(&r.path);
            if let Some(json) = &r.json {
                names.extend(json_placeholders(json));
            }
            if let Some(raw) = &r.raw {
                names.extend(placeholders(raw));
            }
            if let Some(expect) = &r.expect {
                for check in &expect.checks {
                    if let Ok(v) = serde_json::to_value(check) {
                        names.extend(json_placeholders(&v));
                    }
                }
            }
            for name in names {
                req.note_var(&name);
            }
        }
        req
    }
}

impl Suite {
    /// Parse a suite from YAML string
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let suite: Self = serde_yaml::from_str(yaml)?;
        suite.validate()?;
        Ok(suite)
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load all suites from a directory, sorted by name
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        if !dir.is_dir() {
            return Err(E2eError::SpecParse(format!(
                "specs directory not found: {}",
                dir.display()
            )));
        }

        let mut suites = Vec::new();
        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            suites.push(Self::from_file(entry.path())?);
        }

        suites.sort_by(|a, b| a.name.cmp(&b.name));
        let mut seen = BTreeSet::new();
        for suite in &suites {
            if !seen.insert(suite.name.as_str()) {
                return Err(E2eError::SpecParse(format!("duplicate suite name: {}", suite.name)));
            }
        }
        Ok(suites)
    }

    fn validate(&self) -> E2eResult<()> {
        if self.cases.is_empty() {
            return Err(E2eError::SpecParse(format!("suite '{}' has no cases", self.name)));
        }
        let mut names = BTreeSet::new();
        for case in &self.cases {
            if !names.insert(case.name.as_str()) {
                return Err(E2eError::SpecParse(format!(
                    "suite '{}' has duplicate case '{}'",
                    self.name, case.name
                )));
            }
            for step in &case.steps {
                if let TestStep::Request(r) = step {
                    if r.json.is_some() && r.raw.is_some() {
                        return Err(E2eError::SpecParse(format!(
                            "{}/{}: step '{}' has both json and raw bodies",
                            self.name,
                            case.name,
                            r.label()
                        )));
                    }
                    if let Some(e) = &r.expect {
                        if e.status.is_empty() {
                            return Err(E2eError::SpecParse(format!(
                                "{}/{}: empty status set",
                                self.name, case.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Which suites and cases to run
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub suite: Option<String>,
    pub tag: Option<String>,
    /// Substring of the case name
    pub case: Option<String>,
}

impl Filter {
    pub fn suite_selected(&self, suite: &Suite) -> bool {
        self.suite.as_ref().map_or(true, |s| &suite.name == s)
            && self.tag.as_ref().map_or(true, |t| suite.tags.contains(t))
    }

    pub fn case_selected(&self, case: &Case) -> bool {
        self.case.as_ref().map_or(true, |c| case.name.contains(c.as_str()))
    }
}
