//! Launches and supervises the three shell processes.
//!
//! Shells start in a fixed order and each waits for the previous one to
//! register, so the status bar, OSK and launcher always receive participant
//! ids 2, 3 and 4. The session lives as long as the status bar does.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{ShellPaths, RUNTIME_DIR_ENV, WORLD_ENV};
use crate::error::{MaestroError, Result};
use crate::registry::PopulationWatch;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    StatusBar,
    Osk,
    Launcher,
}

impl Shell {
    pub const LAUNCH_ORDER: [Shell; 3] = [Shell::StatusBar, Shell::Osk, Shell::Launcher];

    pub fn name(self) -> &'static str {
        match self {
            Shell::StatusBar => "status bar",
            Shell::Osk => "OSK",
            Shell::Launcher => "launcher",
        }
    }

    pub fn path(self, paths: &ShellPaths) -> &Path {
        match self {
            Shell::StatusBar => &paths.status_bar,
            Shell::Osk => &paths.osk,
            Shell::Launcher => &paths.launcher,
        }
    }

    /// Registry population that must be reached before the next shell starts.
    fn registered_population(self) -> Option<usize> {
        match self {
            Shell::StatusBar => Some(1),
            Shell::Osk => Some(2),
            Shell::Launcher => None,
        }
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Normal,
    Abnormal(i32),
    Signal(i32),
    Unknown,
}

impl ExitClass {
    pub fn classify(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitClass::Normal,
            (Some(code), _) => ExitClass::Abnormal(code),
            (None, Some(signal)) => ExitClass::Signal(signal),
            (None, None) => ExitClass::Unknown,
        }
    }
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClass::Normal => write!(f, "exited normally"),
            ExitClass::Abnormal(code) => write!(f, "exited with status {}", code),
            ExitClass::Signal(signal) => write!(f, "killed by signal {}", signal),
            ExitClass::Unknown => write!(f, "exit status unavailable"),
        }
    }
}

/// One-way latch raised when the session should wind down.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn request(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for up to `timeout`, waking early if shutdown is requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

pub struct ProcessSupervisor {
    paths: ShellPaths,
    population: PopulationWatch,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    env: Vec<(&'static str, OsString)>,
    children: Vec<(Shell, Child)>,
}

impl ProcessSupervisor {
    pub fn new(paths: ShellPaths, population: PopulationWatch, shutdown: ShutdownSignal) -> Self {
        Self {
            paths,
            population,
            shutdown,
            poll_interval: DEFAULT_POLL_INTERVAL,
            env: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Points every shell process at this session's world and runtime
    /// directory.
    pub fn with_session_env(mut self, world_index: u32, runtime_dir: &Path) -> Self {
        self.env = vec![
            (WORLD_ENV, OsString::from(world_index.to_string())),
            (RUNTIME_DIR_ENV, runtime_dir.as_os_str().to_os_string()),
        ];
        self
    }

    pub fn spawn(path: &Path) -> Result<Child> {
        Self::spawn_with_env(path, &[])
    }

    fn spawn_with_env(path: &Path, env: &[(&'static str, OsString)]) -> Result<Child> {
        Command::new(path)
            .envs(env.iter().map(|(key, value)| (*key, value)))
            .spawn()
            .map_err(|source| MaestroError::Spawn {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Starts the status bar, OSK and launcher in order, waiting for each of
    /// the first two to register before starting the next.
    pub fn launch_shell(&mut self) -> Result<()> {
        for shell in Shell::LAUNCH_ORDER {
            if self.shutdown.is_requested() {
                break;
            }
            let path = shell.path(&self.paths).to_path_buf();
            let child = Self::spawn_with_env(&path, &self.env)?;
            info!(shell = shell.name(), pid = child.id(), path = %path.display(), "Spawned shell process");
            self.children.push((shell, child));

            if let Some(population) = shell.registered_population() {
                self.await_registration(shell, population)?;
            }
        }
        Ok(())
    }

    fn await_registration(&mut self, shell: Shell, population: usize) -> Result<()> {
        loop {
            if self
                .population
                .wait_until(self.poll_interval, |current| current >= population)
                .is_ok()
            {
                debug!(shell = shell.name(), population, "Shell registered");
                return Ok(());
            }
            if self.shutdown.is_requested() {
                return Ok(());
            }
            let Some(child) = self.child_mut(shell) else {
                return Ok(());
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(MaestroError::ShellExited {
                        shell: shell.name(),
                        exit: ExitClass::classify(status).to_string(),
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(shell = shell.name(), error = %err, "Failed to poll shell"),
            }
        }
    }

    /// Blocks until the status bar exits. Once shutdown has been requested,
    /// the status bar gets `grace` to leave before it is killed.
    pub fn wait_for_status_bar(&mut self, grace: Duration) -> ExitClass {
        let poll_interval = self.poll_interval;
        let shutdown = self.shutdown.clone();
        let Some(child) = self.child_mut(Shell::StatusBar) else {
            return ExitClass::Unknown;
        };
        let mut kill_at: Option<Instant> = None;

        let exit = loop {
            match child.try_wait() {
                Ok(Some(status)) => break ExitClass::classify(status),
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "Failed to poll status bar");
                    break ExitClass::Unknown;
                }
            }
            if kill_at.is_none() && shutdown.is_requested() {
                kill_at = Some(Instant::now() + grace);
            }
            if kill_at.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Status bar ignored shutdown; killing it");
                let _ = child.kill();
                kill_at = None;
            }
            shutdown.wait_timeout(poll_interval);
        };

        match exit {
            ExitClass::Normal => info!(%exit, "Status bar exited"),
            _ => warn!(%exit, "Status bar exited"),
        }
        exit
    }

    /// Runs `broadcast`, then waits up to `grace` for the registry to empty.
    /// Children still running afterwards are killed. Returns whether every
    /// app unregistered on its own.
    pub fn drain<F>(&mut self, broadcast: F, grace: Duration) -> bool
    where
        F: FnOnce(),
    {
        self.shutdown.request();
        broadcast();
        let drained = match self.population.wait_until(grace, |current| current == 0) {
            Ok(_) => true,
            Err(remaining) => {
                warn!(remaining, "Apps still registered after shutdown grace period");
                false
            }
        };
        self.reap_children(!drained);
        drained
    }

    fn reap_children(&mut self, force: bool) {
        for (shell, mut child) in self.children.drain(..) {
            if force {
                let _ = child.kill();
            }
            let deadline = Instant::now() + CHILD_EXIT_GRACE;
            let exit = loop {
                match child.try_wait() {
                    Ok(Some(status)) => break ExitClass::classify(status),
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Ok(None) => {
                        warn!(shell = shell.name(), pid = child.id(), "Killing lingering shell process");
                        let _ = child.kill();
                        break child.wait().map(ExitClass::classify).unwrap_or(ExitClass::Unknown);
                    }
                    Err(_) => break ExitClass::Unknown,
                }
            };
            debug!(shell = shell.name(), %exit, "Shell process reaped");
        }
    }

    fn child_mut(&mut self, shell: Shell) -> Option<&mut Child> {
        self.children
            .iter_mut()
            .find(|(kind, _)| *kind == shell)
            .map(|(_, child)| child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn exit_classes() {
        assert_eq!(ExitClass::classify(ExitStatus::from_raw(0)), ExitClass::Normal);
        assert_eq!(
            ExitClass::classify(ExitStatus::from_raw(3 << 8)),
            ExitClass::Abnormal(3)
        );
        assert_eq!(
            ExitClass::classify(ExitStatus::from_raw(libc::SIGKILL)),
            ExitClass::Signal(libc::SIGKILL)
        );
        assert_eq!(ExitClass::Abnormal(3).to_string(), "exited with status 3");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = ProcessSupervisor::spawn(Path::new("/nonexistent/maestro-shell"))
            .expect_err("missing binary");
        assert!(matches!(err, MaestroError::Spawn { .. }));
    }

    #[test]
    fn shell_that_never_registers_fails_launch() {
        let paths = ShellPaths {
            status_bar: PathBuf::from("/bin/true"),
            osk: PathBuf::from("/bin/true"),
            launcher: PathBuf::from("/bin/true"),
        };
        let mut supervisor = ProcessSupervisor::new(
            paths,
            PopulationWatch::default(),
            ShutdownSignal::default(),
        )
        .with_poll_interval(Duration::from_millis(10));

        let err = supervisor.launch_shell().expect_err("status bar exits");
        assert!(matches!(
            err,
            MaestroError::ShellExited {
                shell: "status bar",
                ..
            }
        ));
        supervisor.reap_children(true);
    }

    #[test]
    fn shutdown_signal_wakes_sleepers() {
        let signal = ShutdownSignal::default();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        let remote = signal.clone();
        let waker = std::thread::spawn(move || remote.request());
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        waker.join().expect("join");
        assert!(signal.is_requested());
    }
}
