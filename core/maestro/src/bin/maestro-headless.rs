//! maestro-headless: a shell process with no UI.
//!
//! Joins the running session, announces itself the way the real status bar,
//! OSK, launcher or app would for its role, and stays until the coordinator
//! tells it to terminate. Useful for bringing a session up on a machine
//! without a display, and for exercising the coordinator end to end.

use std::env;
use std::path::Path;

use app_base::{AppBase, AppDelegate, JoinOptions};
use maestro_protocol::{AppMode, ParticipantId, Role};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct LoggingDelegate;

impl AppDelegate for LoggingDelegate {
    fn on_mode_change(&self, mode: AppMode) {
        info!(%mode, "Mode changed");
    }

    fn on_notification(&self, mode: AppMode, app_id: Option<ParticipantId>) {
        info!(%mode, app = ?app_id, "Notification");
    }
}

fn init_logging() {
    let debug_enabled = env::var("MAESTRO_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn title() -> String {
    env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "maestro-headless".to_string())
}

fn run() -> app_base::Result<()> {
    let app = AppBase::join(JoinOptions::new(title()), LoggingDelegate)?;
    info!(participant = %app.participant_id(), role = ?app.role(), "Headless shell joined");

    app.set_app_mode(AppMode::Ready)?;
    match app.role() {
        // The coordinator keeps the OSK hidden until someone asks for it.
        Role::Osk => app.set_app_mode(AppMode::Visible)?,
        Role::Launcher | Role::Application => app.request_visible()?,
        Role::StatusBar | Role::Maestro => {}
    }

    app.wait_for_termination(None);
    info!(participant = %app.participant_id(), "Termination requested; leaving");
    app.leave()
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        error!(error = %err, "maestro-headless failed");
        std::process::exit(1);
    }
}
