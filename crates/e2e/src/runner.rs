//! Main test runner that orchestrates the server, identities and endpoint modules

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assertion::first_pointer;
use crate::client::{ApiClient, Body, Method, RequestSpec};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::identity::{CaseIdentities, IdentityProvider};
use crate::server::ServerHandle;
use crate::spec::{Case, Cleanup, Filter, RequestStep, Requirements, Suite, TestStep};
use crate::vars::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// The API broke the contract (or could not be reached)
    Failed,
    /// The harness could not set the case up
    Errored,
    /// A case marked as a known issue failed, as expected
    KnownIssue,
    /// A case marked as a known issue passed
    UnexpectedPass,
    /// Filtered out
    Skipped,
}

impl Outcome {
    /// Decide the outcome of a finished case
    pub fn classify(known_issue: Option<&str>, result: &E2eResult<()>) -> Self {
        let failed = |e: &E2eError| {
            e.is_contract_violation() || matches!(e, E2eError::Connectivity { .. })
        };
        match (result, known_issue) {
            (Ok(()), None) => Outcome::Passed,
            (Ok(()), Some(_)) => Outcome::UnexpectedPass,
            (Err(e), Some(_)) if failed(e) => Outcome::KnownIssue,
            (Err(e), None) if failed(e) => Outcome::Failed,
            (Err(_), _) => Outcome::Errored,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Errored)
    }
}

/// Result of executing one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running a single case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub suite: String,
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub known_issue: Option<String>,
    pub error: Option<String>,
}

/// Result of running all selected suites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub base_url: String,
    pub started_at: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub known_issues: usize,
    pub unexpected_passes: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn from_results(base_url: &str, started_at: String, duration_ms: u64, results: Vec<TestResult>) -> Self {
        let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            base_url: base_url.to_string(),
            started_at,
            total: results.len(),
            passed: count(Outcome::Passed),
            failed: count(Outcome::Failed),
            errored: count(Outcome::Errored),
            known_issues: count(Outcome::KnownIssue),
            unexpected_passes: count(Outcome::UnexpectedPass),
            skipped: count(Outcome::Skipped),
            duration_ms,
            results,
        }
    }

    /// No case failed or errored
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

/// Main contract test runner
pub struct TestRunner {
    config: HarnessConfig,

    /// Running server handle (if any)
    server: Option<ServerHandle>,

    client: ApiClient,

    identities: IdentityProvider,

    filter: Filter,
}

impl TestRunner {
    /// Create a test runner with custom configuration
    pub fn with_config(config: HarnessConfig) -> E2eResult<Self> {
        config.validate()?;
        let client = ApiClient::new(config.server.base_url(), config.http.request_timeout())?;
        let identities = IdentityProvider::new(client.clone(), &config);
        Ok(Self {
            config,
            server: None,
            client,
            identities,
            filter: Filter::default(),
        })
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityProvider {
        &self.identities
    }

    /// Start the server
    pub async fn start_server(&mut self) -> E2eResult<()> {
        if self.server.is_some() {
            return Ok(()); // Already running
        }
        let server = ServerHandle::spawn(self.config.server.clone()).await?;
        self.server = Some(server);
        Ok(())
    }

    /// Stop the server
    pub fn stop_server(&mut self) -> E2eResult<()> {
        if let Some(mut server) = self.server.take() {
            server.stop()?;
        }
        Ok(())
    }

    /// Run every suite in the specs directory
    pub async fn run_all(&mut self) -> E2eResult<TestSuiteResult> {
        let suites = Suite::load_all(&self.config.specs_dir)?;
        self.run_suites(&suites).await
    }

    /// Run a list of suites, one case at a time
    pub async fn run_suites(&mut self, suites: &[Suite]) -> E2eResult<TestSuiteResult> {
        let start = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let mut results = Vec::new();

        // Ensure server is running
        self.start_server().await?;

        let selected: usize = suites
            .iter()
            .filter(|s| self.filter.suite_selected(s))
            .map(|s| s.cases.iter().filter(|c| self.filter.case_selected(c)).count())
            .sum();
        info!("Running {} case(s) against {}...", selected, self.client.base_url());

        for suite in suites {
            let suite_selected = self.filter.suite_selected(suite);
            if suite_selected {
                info!("Suite: {}", suite.name);
            }

            for case in &suite.cases {
                if !suite_selected || !self.filter.case_selected(case) {
                    results.push(skipped(suite, case));
                    continue;
                }

                self.ensure_server_alive()?;

                let result = self.run_case(suite, case).await;
                match result.outcome {
                    Outcome::Passed => info!("✓ {}::{} ({} ms)", suite.name, case.name, result.duration_ms),
                    Outcome::KnownIssue => info!(
                        "✗ {}::{} - known issue: {}",
                        suite.name,
                        case.name,
                        result.known_issue.as_deref().unwrap_or_default()
                    ),
                    Outcome::UnexpectedPass => warn!(
                        "! {}::{} passed but is marked as a known issue",
                        suite.name, case.name
                    ),
                    _ => error!(
                        "✗ {}::{} - {}",
                        suite.name,
                        case.name,
                        result.error.as_deref().unwrap_or("unknown error")
                    ),
                }
                results.push(result);
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = TestSuiteResult::from_results(self.client.base_url(), started_at, duration_ms, results);

        info!("");
        info!(
            "Test Results: {} passed, {} failed, {} errored, {} known issue(s), {} unexpected pass(es), {} skipped ({} ms)",
            summary.passed,
            summary.failed,
            summary.errored,
            summary.known_issues,
            summary.unexpected_passes,
            summary.skipped,
            duration_ms
        );

        Ok(summary)
    }

    /// A spawned server that died mid-session ends the session
    fn ensure_server_alive(&mut self) -> E2eResult<()> {
        if let Some(server) = self.server.as_mut() {
            if server.pid().is_some() && !server.is_running() {
                return Err(E2eError::ServerStartup(
                    "server exited during the session".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Run a single case, including fixture resolution and cleanup
    pub async fn run_case(&self, suite: &Suite, case: &Case) -> TestResult {
        let start = Instant::now();
        debug!("Running case: {}::{}", suite.name, case.name);

        let mut steps = Vec::new();
        let result = self.execute_case(suite, case, &mut steps).await;
        let outcome = Outcome::classify(case.known_issue.as_deref(), &result);

        TestResult {
            suite: suite.name.clone(),
            name: case.name.clone(),
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
            known_issue: case.known_issue.clone(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    async fn execute_case(&self, suite: &Suite, case: &Case, records: &mut Vec<StepResult>) -> E2eResult<()> {
        let requirements = case.requirements(suite.cleanup.as_ref());
        let ids = self.resolve_identities(&requirements).await?;

        let mut scope = Scope::for_case();
        scope.extend(ids.vars());

        if let Some(cleanup) = &suite.cleanup {
            self.cleanup(cleanup, &ids).await?;
        }

        let result = self.execute_steps(case, &mut scope, &ids, records).await;

        if let Some(cleanup) = &suite.cleanup {
            if let Err(e) = self.cleanup(cleanup, &ids).await {
                warn!("Cleanup after {}::{} failed: {}", suite.name, case.name, e);
            }
        }

        result
    }

    /// Acquire every identity the case uses, before any step runs
    async fn resolve_identities(&self, requirements: &Requirements) -> E2eResult<CaseIdentities> {
        let mut ids = CaseIdentities {
            garbage: self.config.http.garbage_token.clone(),
            ..Default::default()
        };
        for slot in &requirements.slots {
            ids.slots.insert(*slot, self.identities.session(*slot).await?);
        }
        if requirements.fresh {
            ids.fresh = Some(self.identities.fresh().await?);
        }
        Ok(ids)
    }

    /// Delete the suite's known natural keys; statuses are ignored
    async fn cleanup(&self, cleanup: &Cleanup, ids: &CaseIdentities) -> E2eResult<()> {
        let authorization = ids.authorization(&cleanup.principal)?;
        for path in cleanup.paths() {
            let req = RequestSpec::new(Method::Delete, path.as_str()).authorization(authorization.clone());
            let resp = self
                .client
                .send(&req)
                .await
                .map_err(|e| E2eError::Setup(format!("cleanup {}: {}", path, e)))?;
            debug!("cleanup DELETE {} -> {}", path, resp.status);
        }
        Ok(())
    }

    async fn execute_steps(
        &self,
        case: &Case,
        scope: &mut Scope,
        ids: &CaseIdentities,
        records: &mut Vec<StepResult>,
    ) -> E2eResult<()> {
        let mut outcome = Ok(());
        for step in &case.steps {
            match step {
                TestStep::Log { message } => {
                    if outcome.is_ok() {
                        match scope.interpolate_str(message) {
                            Ok(m) => info!("  {}", m),
                            Err(e) => outcome = Err(e),
                        }
                    }
                }
                TestStep::Request(request) => {
                    // After a failure only teardown steps run
                    if outcome.is_err() && !request.teardown {
                        continue;
                    }
                    let start = Instant::now();
                    let mut record = StepResult {
                        step_name: step.name(),
                        status: None,
                        duration_ms: 0,
                        error: None,
                    };
                    let result = self.execute_request(case, request, scope, ids, &mut record).await;
                    record.duration_ms = start.elapsed().as_millis() as u64;
                    if let Err(e) = &result {
                        record.error = Some(e.to_string());
                    }
                    records.push(record);
                    match result {
                        Err(e) if request.teardown => {
                            warn!("  teardown {} failed: {}", request.label(), e);
                        }
                        Err(e) => outcome = Err(e),
                        Ok(()) => {}
                    }
                }
            }
        }
        outcome
    }

    async fn execute_request(
        &self,
        case: &Case,
        step: &RequestStep,
        scope: &mut Scope,
        ids: &CaseIdentities,
        record: &mut StepResult,
    ) -> E2eResult<()> {
        let path = scope.interpolate_str(&step.path)?;
        let body = match step.body_template() {
            Body::Json(value) => Body::Json(scope.interpolate_json(&value)?),
            Body::Raw { text, content_type } => Body::Raw {
                text: scope.interpolate_str(&text)?,
                content_type,
            },
            Body::Empty => Body::Empty,
        };
        let scenario = format!(
            "{} ({} {} as {})",
            case.name,
            step.method.as_str(),
            path,
            step.principal.label()
        );
        record.step_name = scenario.clone();

        let as_setup = |e: E2eError| {
            if step.setup {
                E2eError::Setup(e.to_string())
            } else {
                e
            }
        };

        let req = RequestSpec {
            method: step.method,
            path,
            authorization: ids.authorization(&step.principal)?,
            body,
        };
        let resp = self.client.send(&req).await.map_err(as_setup)?;
        record.status = Some(resp.status);

        if let Some(expect) = &step.expect {
            expect.verify(&scenario, &resp, scope).map_err(as_setup)?;
        }

        for (var, pointers) in &step.save {
            let pointers = pointers.clone().into_vec();
            let value = first_pointer(&resp, &pointers).ok_or_else(|| {
                as_setup(E2eError::CheckFailed {
                    scenario: scenario.clone(),
                    reason: format!(
                        "cannot save '{}': none of {:?} in {}",
                        var,
                        pointers,
                        resp.body_snippet()
                    ),
                })
            })?;
            scope.set(var.clone(), value);
        }
        Ok(())
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        let _ = self.stop_server();
    }
}

/// Signals that end a session early. Installed before the run starts so the
/// server is stopped instead of orphaned when the harness is interrupted.
pub struct Interruption {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Interruption {
    #[cfg(unix)]
    pub fn install() -> E2eResult<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> E2eResult<Self> {
        Ok(Self {})
    }

    /// Resolves with the name of the signal received
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl-C",
            Err(_) => std::future::pending().await,
        }
    }
}

fn skipped(suite: &Suite, case: &Case) -> TestResult {
    TestResult {
        suite: suite.name.clone(),
        name: case.name.clone(),
        outcome: Outcome::Skipped,
        duration_ms: 0,
        steps: Vec::new(),
        known_issue: case.known_issue.clone(),
        error: None,
    }
}
