//! Engine backed by an external translator process.
//!
//! Spawns a tun2proxy-style binary that inherits the interface descriptor
//! and is told where to send flows through an argument template. The child
//! exiting on its own is reported as an engine exit.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{EngineEvents, EngineStartParams, TunnelEngine};
use crate::error::{EngineError, Result};
use crate::tun::InterfaceFd;

/// External translator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Translator binary, looked up in `PATH` when it has no directory part.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Argument template. Placeholders: `{fd}`, `{host}`, `{port}`,
    /// `{mtu}`, `{rcode}`, `{dns}` (`forward` or `local`).
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// MTU reported to the manager.
    #[serde(default = "default_mtu")]
    pub mtu: i32,

    /// How long to wait for the child after SIGTERM before killing it.
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_args() -> Vec<String> {
    ["--tun-fd", "{fd}", "--proxy", "http://{host}:{port}"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_mtu() -> i32 {
    crate::DEFAULT_MTU
}
fn default_stop_timeout() -> Duration {
    Duration::from_secs(3)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_args(),
            mtu: default_mtu(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

impl EngineConfig {
    /// Expand the argument template for one start.
    pub fn render_args(&self, params: &EngineStartParams) -> Vec<String> {
        let dns = if params.forward_dns { "forward" } else { "local" };
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{fd}", &params.fd.to_string())
                    .replace("{host}", &params.proxy_host)
                    .replace("{port}", &params.proxy_port.to_string())
                    .replace("{mtu}", &self.mtu.to_string())
                    .replace("{rcode}", &params.rcode.to_string())
                    .replace("{dns}", dns)
            })
            .collect()
    }
}

struct RunningChild {
    fd: InterfaceFd,
    child: Arc<Mutex<Child>>,
    stopping: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

/// [`TunnelEngine`] that runs an external translator process per session.
pub struct CommandEngine {
    config: EngineConfig,
    program: Option<PathBuf>,
    events: Option<EngineEvents>,
    running: Option<RunningChild>,
}

impl CommandEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            program: None,
            events: None,
            running: None,
        }
    }

    /// Resolved program path, available after `init`.
    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    fn spawn(&self, program: &Path, params: &EngineStartParams) -> std::io::Result<Child> {
        let mut cmd = Command::new(program);
        cmd.args(self.config.render_args(params))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            let fd = params.fd;
            // The interface descriptor must survive exec.
            unsafe {
                cmd.pre_exec(move || {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        cmd.spawn()
    }
}

impl TunnelEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn init(&mut self, events: EngineEvents) -> Result<()> {
        let program = self
            .config
            .program
            .as_deref()
            .ok_or_else(|| EngineError::Unavailable("no translator program configured".into()))?;

        let resolved = find_program(program).ok_or_else(|| {
            EngineError::Unavailable(format!("translator not found: {}", program.display()))
        })?;

        debug!(program = %resolved.display(), "Command engine initialized");
        self.program = Some(resolved);
        self.events = Some(events);
        Ok(())
    }

    fn mtu(&self) -> i32 {
        self.config.mtu
    }

    fn start(&mut self, params: &EngineStartParams) -> Result<()> {
        let program = self.program.clone().ok_or(EngineError::NotInitialized)?;
        let events = self.events.clone().ok_or(EngineError::NotInitialized)?;

        if let Some(running) = &self.running {
            let fd = running.fd;
            self.stop(fd)?;
        }

        let mut child = self
            .spawn(&program, params)
            .map_err(|e| EngineError::StartFailed(format!("{}: {e}", program.display())))?;

        let pid = child.id();
        info!(
            pid,
            fd = params.fd,
            endpoint = %format!("{}:{}", params.proxy_host, params.proxy_port),
            "Translator started"
        );

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                    debug!(pid, "translator: {}", line);
                }
            });
        }

        let child = Arc::new(Mutex::new(child));
        let stopping = Arc::new(AtomicBool::new(false));
        let watcher = {
            let child = Arc::clone(&child);
            let stopping = Arc::clone(&stopping);
            std::thread::spawn(move || watch_child(&child, &stopping, &events))
        };

        self.running = Some(RunningChild {
            fd: params.fd,
            child,
            stopping,
            watcher: Some(watcher),
        });
        Ok(())
    }

    fn stop(&mut self, fd: InterfaceFd) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        if running.fd != fd {
            warn!(requested = fd, running = running.fd, "Stopping translator for a different fd");
        }

        running.stopping.store(true, Ordering::SeqCst);
        let result = terminate(&running.child, self.config.stop_timeout);

        if let Some(watcher) = running.watcher.take() {
            let _ = watcher.join();
        }
        result
    }

    fn teardown(&mut self) {
        if let Some(fd) = self.running.as_ref().map(|r| r.fd) {
            if let Err(e) = self.stop(fd) {
                warn!(error = %e, "Translator stop failed during teardown");
            }
        }
        self.events = None;
        self.program = None;
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn watch_child(child: &Mutex<Child>, stopping: &AtomicBool, events: &EngineEvents) {
    loop {
        if stopping.load(Ordering::SeqCst) {
            return;
        }
        let status = child.lock().try_wait();
        match status {
            Ok(Some(status)) => {
                if !stopping.load(Ordering::SeqCst) {
                    events.exit(format!("translator exited: {status}"));
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                events.error(e.raw_os_error().unwrap_or(-1), e.to_string());
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
fn terminate(child: &Mutex<Child>, timeout: Duration) -> Result<()> {
    let mut child = child.lock();
    if matches!(child.try_wait(), Ok(Some(_))) {
        return Ok(());
    }

    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(child.id()) {
            unsafe { libc::kill(pid, libc::SIGTERM) };
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    #[cfg(not(unix))]
    let _ = (timeout, Instant::now());

    child
        .kill()
        .map_err(|e| EngineError::StopFailed(e.to_string()))?;
    let _ = child.wait();
    Ok(())
}

/// Resolve a program name against `PATH`.
fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EngineStartParams {
        EngineStartParams {
            fd: 7,
            forward_dns: false,
            rcode: 3,
            proxy_host: "127.0.0.1".into(),
            proxy_port: 8888,
        }
    }

    #[test]
    fn test_render_default_args() {
        let config = EngineConfig::default();
        assert_eq!(
            config.render_args(&params()),
            vec!["--tun-fd", "7", "--proxy", "http://127.0.0.1:8888"]
        );
    }

    #[test]
    fn test_render_all_placeholders() {
        let config = EngineConfig {
            args: vec!["{mtu}/{rcode}/{dns}".into()],
            ..Default::default()
        };
        assert_eq!(config.render_args(&params()), vec!["1500/3/local"]);
    }

    #[test]
    fn test_init_without_program() {
        let mut engine = CommandEngine::new(EngineConfig::default());
        assert!(engine.init(EngineEvents::discard()).is_err());
    }

    #[test]
    fn test_start_before_init() {
        let mut engine = CommandEngine::new(EngineConfig::default());
        assert!(engine.start(&params()).is_err());
        assert!(engine.stop(7).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_reported() {
        use parking_lot::Mutex as PlMutex;

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut engine = CommandEngine::new(EngineConfig {
            program: Some(PathBuf::from("true")),
            args: vec![],
            ..Default::default()
        });
        engine
            .init(EngineEvents::new(move |event| sink.lock().push(event)))
            .unwrap();

        use std::os::unix::io::AsRawFd;
        let null = std::fs::File::open("/dev/null").unwrap();
        let mut start = params();
        start.fd = null.as_raw_fd();
        engine.start(&start).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(matches!(seen.lock().first(), Some(super::super::EngineEvent::Exit { .. })));
        engine.teardown();
    }
}
