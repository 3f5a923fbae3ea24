// ============================================================================
// TEST UTILITIES - in-process stand-in for the parking API
// ============================================================================

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use parkcheck_e2e::HarnessConfig;

pub const ADMIN_EMAIL: &str = "admin@test.com";
pub const ADMIN_PASSWORD: &str = "Admin123!";

pub struct StubUser {
    pub email: String,
    pub password: String,
    pub admin: bool,
}

pub struct StubVehicle {
    pub id: usize,
    pub name: String,
    pub owner: String,
}

/// Everything the stub remembers between requests
pub struct StubState {
    pub users: HashMap<String, StubUser>,
    pub tokens: HashMap<String, String>,
    pub vehicles: BTreeMap<String, StubVehicle>,
    pub register_calls: usize,
    pub login_calls: usize,
    /// Answer logins with 200 but no token
    pub omit_token: bool,
}

impl StubState {
    /// Empty store with the pre-provisioned admin
    pub fn new() -> Self {
        let mut users = HashMap::new();
        users.insert(
            ADMIN_EMAIL.to_string(),
            StubUser {
                email: ADMIN_EMAIL.to_string(),
                password: ADMIN_PASSWORD.to_string(),
                admin: true,
            },
        );
        Self {
            users,
            tokens: HashMap::new(),
            vehicles: BTreeMap::new(),
            register_calls: 0,
            login_calls: 0,
            omit_token: false,
        }
    }

    pub fn without_tokens() -> Self {
        Self {
            omit_token: true,
            ..Self::new()
        }
    }

    /// Username and admin flag for the Authorization header, if valid
    fn caller(&self, headers: &HeaderMap) -> Option<(String, bool)> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ").unwrap_or(value);
        let username = self.tokens.get(token)?;
        let admin = self.users.get(username).map_or(false, |u| u.admin);
        Some((username.clone(), admin))
    }
}

type Shared = Arc<Mutex<StubState>>;
type Reply = (StatusCode, Json<Value>);

pub struct StubApi {
    pub addr: SocketAddr,
    pub state: Shared,
}

impl StubApi {
    /// Harness configuration that attaches to this stub
    pub fn config(&self) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.server.external = true;
        config.server.host = self.addr.ip().to_string();
        config.server.port = self.addr.port();
        config.server.startup_timeout_secs = 2;
        config.http.request_timeout_secs = 5;
        config
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn login_calls(&self) -> usize {
        self.state.lock().unwrap().login_calls
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().unwrap().register_calls
    }
}

// Spawn the stub on a free port
pub async fn spawn_stub(state: StubState) -> StubApi {
    let shared: Shared = Arc::new(Mutex::new(state));
    let app = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/vehicles", get(list_vehicles).post(create_vehicle))
        .route("/vehicles/:plate", delete(delete_vehicle))
        .with_state(shared.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to a port");
    let addr = listener.local_addr().expect("Failed to get local address");

    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Failed to start stub server");
    });

    StubApi { addr, state: shared }
}

fn field(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| body.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn unauthorized() -> Reply {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized: Invalid or missing session token" })),
    )
}

async fn register(State(state): State<Shared>, Json(body): Json<Value>) -> Reply {
    let mut s = state.lock().unwrap();
    s.register_calls += 1;

    let (Some(username), Some(password)) = (field(&body, &["username"]), field(&body, &["password"])) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "username and password are required" })),
        );
    };
    if s.users.contains_key(&username) {
        return (StatusCode::CONFLICT, Json(json!({ "error": "User already exists" })));
    }
    s.users.insert(
        username,
        StubUser {
            email: field(&body, &["email"]).unwrap_or_default(),
            password,
            admin: false,
        },
    );
    (StatusCode::CREATED, Json(json!({ "message": "User created" })))
}

async fn login(State(state): State<Shared>, Json(body): Json<Value>) -> Reply {
    let mut s = state.lock().unwrap();
    s.login_calls += 1;

    let id = field(&body, &["username", "email"]);
    let password = field(&body, &["password"]);
    let found = s
        .users
        .iter()
        .find(|(name, user)| {
            id.as_deref() == Some(name.as_str()) || id.as_deref() == Some(user.email.as_str())
        })
        .filter(|(_, user)| password.as_deref() == Some(user.password.as_str()))
        .map(|(name, _)| name.clone());

    let Some(username) = found else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid credentials" })));
    };
    if s.omit_token {
        return (StatusCode::OK, Json(json!({ "message": "Logged in" })));
    }
    let token = format!("tok-{}", s.tokens.len() + 1);
    s.tokens.insert(token.clone(), username);
    (
        StatusCode::OK,
        Json(json!({ "accessToken": token, "tokenType": "Bearer" })),
    )
}

async fn list_vehicles(State(state): State<Shared>, headers: HeaderMap) -> Reply {
    let s = state.lock().unwrap();
    let Some((username, admin)) = s.caller(&headers) else {
        return unauthorized();
    };
    let vehicles: Vec<Value> = s
        .vehicles
        .iter()
        .filter(|(_, v)| admin || v.owner == username)
        .map(|(plate, v)| json!({ "id": v.id, "licensePlate": plate, "name": v.name }))
        .collect();
    (StatusCode::OK, Json(Value::Array(vehicles)))
}

async fn create_vehicle(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    let mut s = state.lock().unwrap();
    let Some((username, _)) = s.caller(&headers) else {
        return unauthorized();
    };
    let Some(plate) = field(&body, &["licensePlate", "LicensePlate"]) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": { "$": ["JSON deserialization for type 'CreateVehicleDto' was missing required properties, including: 'licensePlate'."] } })),
        );
    };
    if s.vehicles.contains_key(&plate) {
        return (StatusCode::CONFLICT, Json(json!({ "error": "Vehicle already exists" })));
    }
    let id = s.vehicles.len() + 1;
    let name = field(&body, &["name"]).unwrap_or_default();
    s.vehicles.insert(
        plate.clone(),
        StubVehicle {
            id,
            name: name.clone(),
            owner: username,
        },
    );
    (
        StatusCode::CREATED,
        Json(json!({ "status": "Success", "vehicle": { "id": id, "licensePlate": plate, "name": name } })),
    )
}

async fn delete_vehicle(State(state): State<Shared>, headers: HeaderMap, Path(plate): Path<String>) -> Reply {
    let mut s = state.lock().unwrap();
    let Some((username, admin)) = s.caller(&headers) else {
        return unauthorized();
    };
    let owned = s
        .vehicles
        .get(&plate)
        .map_or(false, |v| admin || v.owner == username);
    if !owned {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "Vehicle not found" })));
    }
    s.vehicles.remove(&plate);
    (StatusCode::OK, Json(json!({ "status": "Deleted" })))
}
