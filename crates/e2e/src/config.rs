//! Harness configuration
//!
//! Layering: built-in defaults, then an optional TOML file, then environment
//! variables. The runner binary applies CLI flags last.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::identity::{IdentitySpec, LoginField, Role, Slot};

pub const ENV_CONFIG: &str = "PARKCHECK_CONFIG";
pub const ENV_BASE_URL: &str = "PARKCHECK_BASE_URL";
pub const ENV_EXTERNAL: &str = "PARKCHECK_EXTERNAL";

/// Complete harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub identities: IdentitiesConfig,

    /// Directory holding the endpoint modules (YAML)
    pub specs_dir: PathBuf,

    /// Where the JSON report is written
    pub output_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            auth: AuthConfig::default(),
            identities: IdentitiesConfig::default(),
            specs_dir: PathBuf::from("crates/e2e/specs"),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

/// How to build, launch and reach the system under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Use a server that is already running; no build, spawn or teardown
    pub external: bool,

    /// Optional compile step run once before launch
    pub build: Option<CommandSpec>,

    /// Launch command; `{host}`, `{port}` and `{base_url}` are substituted in args
    pub run: CommandSpec,

    /// Appended to both build and run args to select the test configuration
    pub test_mode_flag: Option<String>,

    /// Poll this path for readiness; `None` waits for a TCP accept instead
    pub health_path: Option<String>,

    /// Extra wait after readiness
    pub settle_delay_ms: u64,

    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and a forced kill
    pub shutdown_timeout_secs: u64,

    /// Let the server write to this process' stdout/stderr
    pub inherit_output: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            external: false,
            build: Some(CommandSpec {
                program: "dotnet".to_string(),
                args: vec!["build".to_string()],
                working_dir: Some(PathBuf::from("v2")),
                env: BTreeMap::new(),
            }),
            run: CommandSpec {
                program: "dotnet".to_string(),
                args: vec![
                    "run".to_string(),
                    "--urls".to_string(),
                    "{base_url}".to_string(),
                ],
                working_dir: Some(PathBuf::from("v2")),
                env: BTreeMap::new(),
            },
            test_mode_flag: Some("-p:DefineConstants=TEST".to_string()),
            health_path: None,
            settle_delay_ms: 0,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            inherit_output: false,
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// A subprocess invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Args with placeholders substituted and the test-mode flag appended.
    pub fn resolved_args(&self, server: &ServerConfig) -> Vec<String> {
        let base_url = server.base_url();
        let port = server.port.to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{base_url}", &base_url)
                    .replace("{host}", &server.host)
                    .replace("{port}", &port)
            })
            .collect();
        if let Some(flag) = &server.test_mode_flag {
            args.push(flag.clone());
        }
        args
    }

    /// Human-readable command line, for logs and error messages
    pub fn display(&self, server: &ServerConfig) -> String {
        let mut line = self.program.clone();
        for arg in self.resolved_args(server) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_secs: u64,

    /// Authorization value sent by the `garbage` principal
    pub garbage_token: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            garbage_token: "invalid-token".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where to find the credential in a login response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_keys: Vec<String>,
    pub token_type_keys: Vec<String>,

    /// Scheme used when the login body carries no token type
    pub default_scheme: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_keys: ["accessToken", "token", "accesstoken", "access_token", "session_token"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            token_type_keys: ["tokenType", "tokentype", "token_type"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            default_scheme: "Bearer".to_string(),
        }
    }
}

/// The role-tagged identities shared across a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitiesConfig {
    pub user: IdentitySpec,
    pub user_b: IdentitySpec,
    pub admin: IdentitySpec,
}

impl Default for IdentitiesConfig {
    fn default() -> Self {
        Self {
            user: IdentitySpec {
                username: "regular.user".to_string(),
                email: "user@example.com".to_string(),
                password: "UserPass123!".to_string(),
                name: "Regular User".to_string(),
                role: Role::User,
                login_with: LoginField::Username,
                register: true,
                unique_suffix: true,
            },
            user_b: IdentitySpec {
                username: "user.two".to_string(),
                email: "user2@example.com".to_string(),
                password: "User2Pass123!".to_string(),
                name: "Second User".to_string(),
                role: Role::User,
                login_with: LoginField::Username,
                register: true,
                unique_suffix: true,
            },
            admin: IdentitySpec {
                username: "admin@test.com".to_string(),
                email: "admin@test.com".to_string(),
                password: "Admin123!".to_string(),
                name: "Admin User".to_string(),
                role: Role::Admin,
                login_with: LoginField::Email,
                register: false,
                unique_suffix: false,
            },
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Err(E2eError::Config(format!(
                "config file not found: {}",
                path.display()
            )))
        }
    }

    /// Defaults, then `$PARKCHECK_CONFIG` (or `path`), then env overrides
    pub fn discover(path: Option<&Path>) -> E2eResult<Self> {
        let from_env = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> E2eResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.set_base_url(&url)?;
        }
        if let Some(flag) = lookup(ENV_EXTERNAL) {
            self.server.external = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self.validate()
    }

    /// Point the harness at `http://host:port`
    pub fn set_base_url(&mut self, url: &str) -> E2eResult<()> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| E2eError::Config(format!("invalid base url '{}': {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| E2eError::Config(format!("base url '{}' has no host", url)))?;
        self.server.host = host.to_string();
        self.server.port = parsed.port_or_known_default().unwrap_or(80);
        Ok(())
    }

    pub fn validate(&self) -> E2eResult<()> {
        if self.server.port == 0 {
            return Err(E2eError::Config("server.port must be fixed and non-zero".to_string()));
        }
        if !self.server.external && self.server.run.program.is_empty() {
            return Err(E2eError::Config("server.run.program is empty".to_string()));
        }
        if self.auth.token_keys.is_empty() {
            return Err(E2eError::Config("auth.token_keys is empty".to_string()));
        }
        if self.identities.admin.role != Role::Admin {
            return Err(E2eError::Config("identities.admin must have role 'admin'".to_string()));
        }
        Ok(())
    }

    /// Resolve relative directories against `root`
    pub fn rooted(mut self, root: &Path) -> Self {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };
        join(&mut self.specs_dir);
        join(&mut self.output_dir);
        if let Some(dir) = self.server.run.working_dir.as_mut() {
            join(dir);
        }
        if let Some(dir) = self.server.build.as_mut().and_then(|b| b.working_dir.as_mut()) {
            join(dir);
        }
        self
    }

    pub fn identity(&self, slot: Slot) -> &IdentitySpec {
        match slot {
            Slot::User => &self.identities.user,
            Slot::UserB => &self.identities.user_b,
            Slot::Admin => &self.identities.admin,
        }
    }
}
