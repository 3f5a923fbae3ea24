//! Identity provider - registering, logging in and handing out credentials
//!
//! Session identities (`user`, `user_b`, `admin`) are acquired once and cached
//! for the whole run, failures included: a login that returns no token aborts
//! every case that needs that identity instead of being retried per case.
//! `fresh` identities are created per case and never cached.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::client::{ApiClient, Captured, Method, RequestSpec};
use crate::config::{AuthConfig, HarnessConfig};
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

/// Which field identifies the account at login
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginField {
    #[default]
    Username,
    Email,
}

/// The session-scoped identity slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    User,
    UserB,
    Admin,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::User, Slot::UserB, Slot::Admin];

    /// Variable prefix, e.g. `${user_b.username}`
    pub fn var_prefix(&self) -> &'static str {
        match self {
            Slot::User => "user",
            Slot::UserB => "user_b",
            Slot::Admin => "admin",
        }
    }
}

/// Who a request is sent as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// No Authorization header
    Anonymous,
    User,
    UserB,
    Admin,
    /// A user registered for this case only
    Fresh,
    /// The configured garbage token
    Garbage,
    /// A literal Authorization value
    Token(String),
}

impl Principal {
    pub fn slot(&self) -> Option<Slot> {
        match self {
            Principal::User => Some(Slot::User),
            Principal::UserB => Some(Slot::UserB),
            Principal::Admin => Some(Slot::Admin),
            _ => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Principal::Anonymous => "anonymous",
            Principal::User => "user",
            Principal::UserB => "user_b",
            Principal::Admin => "admin",
            Principal::Fresh => "fresh",
            Principal::Garbage => "garbage",
            Principal::Token(_) => "token",
        }
    }
}

/// Credentials and profile fields of one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySpec {
    pub username: String,
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,

    #[serde(default)]
    pub login_with: LoginField,

    /// Self-register before logging in; a rejected registration is tolerated
    #[serde(default = "default_register")]
    pub register: bool,

    /// Append a random suffix to username and email on every run
    #[serde(default)]
    pub unique_suffix: bool,
}

fn default_register() -> bool {
    true
}

impl IdentitySpec {
    /// Apply the unique suffix, if requested. The result is what gets registered.
    pub fn realize(&self) -> Self {
        if self.unique_suffix {
            self.with_suffix(&random_suffix())
        } else {
            self.clone()
        }
    }

    pub fn with_suffix(&self, suffix: &str) -> Self {
        let email = match self.email.split_once('@') {
            Some((local, domain)) => format!("{}+{}@{}", local, suffix, domain),
            None => format!("{}+{}", self.email, suffix),
        };
        Self {
            username: format!("{}.{}", self.username, suffix),
            email,
            unique_suffix: false,
            ..self.clone()
        }
    }

    /// A throwaway user with a collision-resistant username
    pub fn fresh_user() -> Self {
        Self {
            username: "fresh.user".to_string(),
            email: "fresh@example.com".to_string(),
            password: "FreshPass123!".to_string(),
            name: "Fresh User".to_string(),
            role: Role::User,
            login_with: LoginField::Username,
            register: true,
            unique_suffix: true,
        }
        .realize()
    }

    pub fn registration_body(&self) -> Value {
        json!({
            "username": self.username,
            "email": self.email,
            "password": self.password,
            "name": self.name,
            "role": self.role.as_str(),
        })
    }

    pub fn login_body(&self) -> Value {
        match self.login_with {
            LoginField::Username => json!({ "username": self.username, "password": self.password }),
            LoginField::Email => json!({ "email": self.email, "password": self.password }),
        }
    }

    /// Variables exposed to spec interpolation under `prefix`
    pub fn vars(&self, prefix: &str) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        vars.insert(format!("{}.username", prefix), json!(self.username));
        vars.insert(format!("{}.email", prefix), json!(self.email));
        vars.insert(format!("{}.name", prefix), json!(self.name));
        vars.insert(format!("{}.role", prefix), json!(self.role.as_str()));
        vars
    }
}

/// 8 hex chars; enough to keep repeated runs apart
pub fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token returned by a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub token_type: String,
}

impl Credential {
    /// Value for the Authorization header
    pub fn authorization(&self) -> String {
        if self.token_type.is_empty() {
            self.token.clone()
        } else {
            format!("{} {}", self.token_type, self.token)
        }
    }
}

/// Pull the token out of a login response, trying each configured key
pub fn extract_credential(body: &Value, auth: &AuthConfig) -> Option<Credential> {
    let token = auth
        .token_keys
        .iter()
        .filter_map(|k| body.get(k).and_then(Value::as_str))
        .find(|t| !t.is_empty())?;
    let token_type = auth
        .token_type_keys
        .iter()
        .filter_map(|k| body.get(k).and_then(Value::as_str))
        .find(|t| !t.is_empty())
        .unwrap_or(auth.default_scheme.as_str());
    Some(Credential {
        token: token.to_string(),
        token_type: token_type.to_string(),
    })
}

/// An authenticated identity
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: IdentitySpec,
    pub credential: Credential,
}

impl Session {
    pub fn authorization(&self) -> String {
        self.credential.authorization()
    }
}

/// Registers and logs in identities against the running server
pub struct IdentityProvider {
    client: ApiClient,
    auth: AuthConfig,
    specs: BTreeMap<Slot, IdentitySpec>,
    sessions: BTreeMap<Slot, OnceCell<Result<Arc<Session>, String>>>,
}

impl IdentityProvider {
    pub fn new(client: ApiClient, config: &HarnessConfig) -> Self {
        let specs: BTreeMap<Slot, IdentitySpec> = Slot::ALL
            .iter()
            .map(|slot| (*slot, config.identity(*slot).clone()))
            .collect();
        let sessions = Slot::ALL.iter().map(|slot| (*slot, OnceCell::new())).collect();
        Self {
            client,
            auth: config.auth.clone(),
            specs,
            sessions,
        }
    }

    /// POST /register. Any status is returned, not judged: the identity may already exist.
    pub async fn register(&self, identity: &IdentitySpec) -> E2eResult<Captured> {
        let resp = self
            .client
            .send(&RequestSpec::new(Method::Post, "/register").json(identity.registration_body()))
            .await?;
        if resp.is_success() {
            debug!("Registered {}", identity.username);
        } else {
            warn!(
                "Registration of {} returned {}, continuing with login",
                identity.username, resp.status
            );
        }
        Ok(resp)
    }

    /// POST /login. No token in the answer is a fixture failure.
    pub async fn login(&self, identity: &IdentitySpec) -> E2eResult<Credential> {
        let resp = self
            .client
            .send(&RequestSpec::new(Method::Post, "/login").json(identity.login_body()))
            .await?;

        let fixture = format!("login {}", identity.username);
        if !resp.is_success() {
            return Err(E2eError::Fixture {
                fixture,
                reason: format!("status {}: {}", resp.status, resp.body_snippet()),
            });
        }
        let body = resp.json.as_ref().ok_or_else(|| E2eError::Fixture {
            fixture: fixture.clone(),
            reason: format!("login body is not JSON: {}", resp.body_snippet()),
        })?;
        extract_credential(body, &self.auth).ok_or_else(|| E2eError::Fixture {
            fixture,
            reason: "Login failed: no token returned".to_string(),
        })
    }

    /// Register (when configured) and log in
    pub async fn acquire(&self, identity: &IdentitySpec) -> E2eResult<Session> {
        if identity.register {
            self.register(identity).await?;
        }
        let credential = self.login(identity).await?;
        info!("Authenticated {} as {}", identity.username, identity.role.as_str());
        Ok(Session {
            identity: identity.clone(),
            credential,
        })
    }

    /// Session-scoped identity, acquired on first use
    pub async fn session(&self, slot: Slot) -> E2eResult<Arc<Session>> {
        let (cell, spec) = match (self.sessions.get(&slot), self.specs.get(&slot)) {
            (Some(cell), Some(spec)) => (cell, spec),
            _ => {
                return Err(E2eError::Config(format!(
                    "no identity configured for {}",
                    slot.var_prefix()
                )))
            }
        };

        let cached = cell
            .get_or_init(|| async {
                self.acquire(&spec.realize())
                    .await
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .await;

        cached.clone().map_err(|reason| E2eError::Fixture {
            fixture: slot.var_prefix().to_string(),
            reason,
        })
    }

    /// Function-scoped user, registered just for the calling case
    pub async fn fresh(&self) -> E2eResult<Session> {
        self.acquire(&IdentitySpec::fresh_user()).await
    }
}

/// Identities resolved for one case
#[derive(Debug, Clone, Default)]
pub struct CaseIdentities {
    pub slots: BTreeMap<Slot, Arc<Session>>,
    pub fresh: Option<Session>,
    pub garbage: String,
}

impl CaseIdentities {
    /// Authorization header for a principal; `None` for anonymous
    pub fn authorization(&self, principal: &Principal) -> E2eResult<Option<String>> {
        let missing = |label: &str| E2eError::Fixture {
            fixture: label.to_string(),
            reason: "identity was not acquired for this case".to_string(),
        };
        match principal {
            Principal::Anonymous => Ok(None),
            Principal::Garbage => Ok(Some(self.garbage.clone())),
            Principal::Token(token) => Ok(Some(token.clone())),
            Principal::Fresh => self
                .fresh
                .as_ref()
                .map(|s| Some(s.authorization()))
                .ok_or_else(|| missing("fresh")),
            other => {
                let slot = other.slot().ok_or_else(|| missing(other.label()))?;
                self.slots
                    .get(&slot)
                    .map(|s| Some(s.authorization()))
                    .ok_or_else(|| missing(slot.var_prefix()))
            }
        }
    }

    /// All identity variables for interpolation
    pub fn vars(&self) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        for (slot, session) in &self.slots {
            vars.extend(session.identity.vars(slot.var_prefix()));
        }
        if let Some(fresh) = &self.fresh {
            vars.extend(fresh.identity.vars("fresh"));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn auth() -> AuthConfig {
        AuthConfig::default()
    }

    #[test_case(json!({"accessToken": "abc", "tokenType": "Bearer"}), "Bearer abc" ; "camel case")]
    #[test_case(json!({"accesstoken": "abc", "tokentype": "Bearer"}), "Bearer abc" ; "lower case")]
    #[test_case(json!({"token": "abc"}), "Bearer abc" ; "default scheme")]
    #[test_case(json!({"session_token": "abc", "token_type": "Session"}), "Session abc" ; "session token")]
    #[test_case(json!({"accessToken": "", "token": "xyz"}), "Bearer xyz" ; "skips empty token")]
    fn extracts_authorization(body: Value, expected: &str) {
        let cred = extract_credential(&body, &auth()).unwrap();
        assert_eq!(cred.authorization(), expected);
    }

    #[test_case(json!({}) ; "empty object")]
    #[test_case(json!({"accessToken": ""}) ; "empty token")]
    #[test_case(json!({"accessToken": 42}) ; "non string token")]
    #[test_case(json!(["accessToken"]) ; "array body")]
    fn no_token_no_credential(body: Value) {
        assert!(extract_credential(&body, &auth()).is_none());
    }

    #[test]
    fn empty_scheme_sends_bare_token() {
        let cred = Credential {
            token: "userToken123".to_string(),
            token_type: String::new(),
        };
        assert_eq!(cred.authorization(), "userToken123");
    }

    #[test]
    fn suffix_applies_to_username_and_email() {
        let spec = HarnessConfig::default().identities.user;
        let realized = spec.with_suffix("1a2b3c4d");
        assert_eq!(realized.username, "regular.user.1a2b3c4d");
        assert_eq!(realized.email, "user+1a2b3c4d@example.com");
        assert!(!realized.unique_suffix);
        assert_eq!(realized.password, spec.password);
    }

    #[test]
    fn realize_is_collision_resistant() {
        let spec = HarnessConfig::default().identities.user;
        assert_ne!(spec.realize().username, spec.realize().username);
    }

    #[test]
    fn fixed_identity_is_not_renamed() {
        let admin = HarnessConfig::default().identities.admin;
        assert_eq!(admin.realize(), admin);
    }

    #[test]
    fn login_body_uses_configured_field() {
        let admin = HarnessConfig::default().identities.admin;
        assert_eq!(
            admin.login_body(),
            json!({"email": "admin@test.com", "password": "Admin123!"})
        );
        let user = HarnessConfig::default().identities.user;
        assert!(user.login_body().get("username").is_some());
    }

    #[test]
    fn principal_parses_from_yaml() {
        let p: Principal = serde_yaml::from_str("user_b").unwrap();
        assert_eq!(p, Principal::UserB);
        let p: Principal = serde_yaml::with::singleton_map::deserialize(
            serde_yaml::Deserializer::from_str("token: Bearer invalid"),
        )
        .unwrap();
        assert_eq!(p, Principal::Token("Bearer invalid".to_string()));
    }

    #[test]
    fn case_identities_resolve_headers() {
        let session = Session {
            identity: HarnessConfig::default().identities.user,
            credential: Credential {
                token: "t".to_string(),
                token_type: "Bearer".to_string(),
            },
        };
        let mut ids = CaseIdentities {
            garbage: "invalid-token".to_string(),
            ..Default::default()
        };
        ids.slots.insert(Slot::User, Arc::new(session));

        assert_eq!(ids.authorization(&Principal::Anonymous).unwrap(), None);
        assert_eq!(
            ids.authorization(&Principal::User).unwrap().as_deref(),
            Some("Bearer t")
        );
        assert_eq!(
            ids.authorization(&Principal::Garbage).unwrap().as_deref(),
            Some("invalid-token")
        );
        assert!(matches!(
            ids.authorization(&Principal::Admin),
            Err(E2eError::Fixture { .. })
        ));
        assert_eq!(
            ids.vars().get("user.username"),
            Some(&json!("regular.user"))
        );
    }
}
