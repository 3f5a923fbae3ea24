//! Server management - building, spawning and readiness-checking the API under test

use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{CommandSpec, ServerConfig};
use crate::error::{E2eError, E2eResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to the server for the whole session.
///
/// Dropping the handle stops a spawned server, so teardown also happens when a
/// run panics or is interrupted.
pub struct ServerHandle {
    child: Option<Child>,
    pub base_url: String,
    config: ServerConfig,
}

impl ServerHandle {
    /// Build (if configured), spawn and wait for readiness
    pub async fn spawn(config: ServerConfig) -> E2eResult<Self> {
        if config.external {
            return Self::attach(config).await;
        }

        if let Some(build) = &config.build {
            run_build(build, &config)?;
        }

        let base_url = config.base_url();
        info!("Spawning server on {}", base_url);

        let mut cmd = command(&config.run, &config);
        // Own process group, so teardown reaches whatever the launcher forks
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        if config.inherit_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!(
                "Failed to spawn {}: {}",
                config.run.display(&config),
                e
            ))
        })?;

        let mut handle = ServerHandle {
            child: Some(child),
            base_url: base_url.clone(),
            config,
        };

        // Wait for server to be ready; the handle is dropped (and the child killed) on error
        handle.wait_for_ready().await?;

        info!("Server is ready at {}", base_url);
        Ok(handle)
    }

    /// Use a server started elsewhere; only readiness is checked
    pub async fn attach(config: ServerConfig) -> E2eResult<Self> {
        let mut handle = ServerHandle {
            child: None,
            base_url: config.base_url(),
            config,
        };
        handle.wait_for_ready().await?;
        info!("Attached to external server at {}", handle.base_url);
        Ok(handle)
    }

    /// Poll until the server accepts connections (or answers the health path)
    async fn wait_for_ready(&mut self) -> E2eResult<()> {
        let timeout = self.config.startup_timeout();
        let addr = self.config.addr();
        let health_url = self
            .config
            .health_path
            .as_ref()
            .map(|p| format!("{}{}", self.base_url, p));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout {
            attempts += 1;

            if let Some(status) = self.exit_status()? {
                return Err(E2eError::ServerStartup(format!(
                    "server exited during startup with {}",
                    status
                )));
            }

            let ready = match &health_url {
                Some(url) => match client.get(url).send().await {
                    Ok(resp) if resp.status().is_success() => true,
                    Ok(resp) => {
                        warn!("Health check returned {}", resp.status());
                        false
                    }
                    Err(e) => {
                        // Connection refused is expected while server is starting
                        if !e.is_connect() {
                            warn!("Health check error: {}", e);
                        }
                        false
                    }
                },
                None => matches!(
                    tokio::time::timeout(POLL_INTERVAL * 10, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                ),
            };

            if ready {
                let settle = self.config.settle_delay();
                if !settle.is_zero() {
                    debug!("Settling for {:?}", settle);
                    sleep(settle).await;
                }
                return Ok(());
            }

            if attempts == 1 {
                info!("Waiting for server to accept connections on {}...", addr);
            }
            sleep(POLL_INTERVAL).await;
        }

        Err(E2eError::ServerHealthCheck { addr, attempts })
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Process id of a spawned server
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// True while a spawned server has not exited
    pub fn is_running(&mut self) -> bool {
        matches!(self.exit_status(), Ok(None)) && self.child.is_some()
    }

    fn exit_status(&mut self) -> E2eResult<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Stop the server: SIGTERM to its process group, wait up to the shutdown
    /// timeout, then SIGKILL whatever is left. Safe to call more than once.
    pub fn stop(&mut self) -> E2eResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        info!("Stopping server (pid: {})", child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(child.id() as i32);
            if group_alive(&mut child, pgid)? && killpg(pgid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + self.config.shutdown_timeout();
                while Instant::now() < deadline && group_alive(&mut child, pgid)? {
                    std::thread::sleep(POLL_INTERVAL);
                }
                if group_alive(&mut child, pgid)? {
                    warn!(
                        "Server did not exit within {:?}, killing",
                        self.config.shutdown_timeout()
                    );
                }
            }
            // ESRCH once the group is empty
            let _ = killpg(pgid, Signal::SIGKILL);
        }

        // Force kill if still running
        if child.try_wait()?.is_none() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        debug!("Server exited with {}", status);
        Ok(())
    }
}

/// True while any process in the server's group exists. The leader is reaped
/// first so its zombie does not count.
#[cfg(unix)]
fn group_alive(child: &mut Child, pgid: nix::unistd::Pid) -> E2eResult<bool> {
    child.try_wait()?;
    Ok(nix::sys::signal::killpg(pgid, None).is_ok())
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn command(spec: &CommandSpec, server: &ServerConfig) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(spec.resolved_args(server));
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(&spec.env);
    cmd
}

/// Run the build step to completion; any failure aborts the session
fn run_build(build: &CommandSpec, server: &ServerConfig) -> E2eResult<()> {
    let line = build.display(server);
    info!("Building system under test: {}", line);

    let status = command(build, server)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| E2eError::Build(format!("{}: {}", line, e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(E2eError::Build(format!("{} exited with {}", line, status)))
    }
}
