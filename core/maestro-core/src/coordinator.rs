//! Session routing policy.
//!
//! The coordinator is the only subscriber on channel 0. Every request a shell
//! process makes arrives here as an envelope, is routed by the sender's role,
//! and turns into registry updates plus messages on private channels. Two
//! rules hold after every routed message:
//!
//! - at most one foreground-capable app is `Visible`, and it is `foreground`;
//! - the previous foreground app is told to hide before the next one is told
//!   to show.
//!
//! The status bar and the OSK are overlays and sit outside the first rule.

use std::path::Path;
use std::sync::Arc;

use maestro_protocol::{
    AppMode, AppRecordSnapshot, Channel, DispatchReport, Envelope, Message, ParticipantId,
    Reaction, RecordQuery, Role, SessionSnapshot, Welcome,
};
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::bus::MessageBus;
use crate::config::ShellPaths;
use crate::error::{MaestroError, Result};
use crate::registry::AppRecord;

const STATUS_BAR: ParticipantId = ParticipantId::STATUS_BAR;
const OSK: ParticipantId = ParticipantId::OSK;
const LAUNCHER: ParticipantId = ParticipantId::LAUNCHER;

/// What a process tells the coordinator about itself when registering.
#[derive(Debug, Clone)]
pub struct Registration {
    pub pid: u32,
    pub proc_started: Option<u64>,
    pub title: String,
    pub process_path: String,
}

pub struct SessionCoordinator {
    arena: Arena,
    bus: Arc<MessageBus>,
    foreground: Option<ParticipantId>,
    /// The OSK starts hidden; its first "I am visible" is swallowed.
    osk_announced: bool,
    shutting_down: bool,
    next_participant: u32,
    /// When set, ids 2 to 4 only go to the configured shell executables.
    shell_paths: Option<ShellPaths>,
}

impl SessionCoordinator {
    pub fn new(arena: Arena, bus: Arc<MessageBus>) -> Self {
        Self {
            arena,
            bus,
            foreground: None,
            osk_announced: false,
            shutting_down: false,
            next_participant: ParticipantId::FIRST_ASSIGNABLE.0,
            shell_paths: None,
        }
    }

    /// Reserves the status bar, OSK and launcher ids for the executables in
    /// `paths`.
    pub fn reserve_shell_ids(&mut self, paths: ShellPaths) {
        self.shell_paths = Some(paths);
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn into_arena(self) -> Arena {
        self.arena
    }

    pub fn foreground(&self) -> Option<ParticipantId> {
        self.foreground
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn is_registered(&self, id: ParticipantId) -> bool {
        self.arena.registry().contains(id)
    }

    pub fn mode_of(&self, id: ParticipantId) -> Option<AppMode> {
        self.arena.registry().get(id).map(|record| record.mode)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration and session state
    // ─────────────────────────────────────────────────────────────────────

    /// Assigns the next participant id and admits the app's record. Ids are
    /// handed out in registration order and never reused.
    pub fn register(&mut self, registration: Registration) -> Result<Welcome> {
        let id = ParticipantId(self.next_participant);
        self.check_shell_identity(id, &registration.process_path)?;
        let mut record = AppRecord::new(
            id,
            registration.pid,
            registration.title,
            registration.process_path,
        );
        record.proc_started = registration.proc_started;
        let pid = record.pid;
        let index = self.arena.admit(record)?;
        self.next_participant += 1;

        info!(
            participant = %id,
            role = ?id.role(),
            index,
            pid,
            "Registered app"
        );
        Ok(self.arena.welcome(id))
    }

    fn check_shell_identity(&self, id: ParticipantId, process_path: &str) -> Result<()> {
        let Some(paths) = &self.shell_paths else {
            return Ok(());
        };
        let (expected, action) = match id {
            STATUS_BAR => (&paths.status_bar, "register as the status bar"),
            OSK => (&paths.osk, "register as the OSK"),
            LAUNCHER => (&paths.launcher, "register as the launcher"),
            _ => return Ok(()),
        };
        if same_executable(expected, Path::new(process_path)) {
            return Ok(());
        }
        warn!(
            participant = %id,
            process_path,
            expected = %expected.display(),
            "Refusing shell id to an unexpected executable"
        );
        Err(MaestroError::Forbidden {
            participant: id,
            action,
        })
    }

    pub fn welcome(&self, id: ParticipantId) -> Result<Welcome> {
        self.require(id)?;
        Ok(self.arena.welcome(id))
    }

    pub fn set_title(&mut self, id: ParticipantId, title: &str) -> Result<()> {
        self.arena.retitle(id, title)?;
        debug!(participant = %id, title, "Updated app title");
        Ok(())
    }

    pub fn set_osk_text(&mut self, id: ParticipantId, text: &str) -> Result<()> {
        self.require(id)?;
        if id != OSK {
            return Err(MaestroError::Forbidden {
                participant: id,
                action: "set the OSK text",
            });
        }
        self.arena.session_mut().set_osk_text(text)
    }

    pub fn set_status_bar_height(&mut self, id: ParticipantId, height: u32) -> Result<()> {
        self.require(id)?;
        if id != STATUS_BAR {
            return Err(MaestroError::Forbidden {
                participant: id,
                action: "set the status bar height",
            });
        }
        self.arena.session_mut().set_status_bar_height(height);
        info!(height, "Status bar height changed");
        Ok(())
    }

    pub fn record(&self, query: &RecordQuery) -> Option<AppRecordSnapshot> {
        let registry = self.arena.registry();
        let id = match query {
            RecordQuery::Id(id) => *id,
            RecordQuery::Path(path) => registry.find_by_path(path)?.participant_id,
        };
        let index = registry.index_of(id)?;
        registry.at(index).map(|record| record.snapshot(index))
    }

    pub fn records(&self) -> Vec<AppRecordSnapshot> {
        self.arena.registry().snapshot()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.arena.snapshot(self.foreground)
    }

    fn require(&self, id: ParticipantId) -> Result<&AppRecord> {
        self.arena
            .registry()
            .get(id)
            .ok_or(MaestroError::NotRegistered(id))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────

    /// Handles one envelope addressed to the coordinator.
    pub fn route(&mut self, envelope: &Envelope) -> Reaction {
        let sender = envelope.sender;
        if !self.is_registered(sender) {
            warn!(
                sender = %sender,
                kind = envelope.message.kind_name(),
                "Dropping message from unregistered participant"
            );
            return Reaction::Drop;
        }

        let reaction = match sender.role() {
            Role::StatusBar => self.route_status_bar(&envelope.message),
            Role::Osk => self.route_osk(&envelope.message),
            Role::Launcher | Role::Application => {
                self.route_application(sender, &envelope.message)
            }
            Role::Maestro => Reaction::Drop,
        };

        debug!(
            sender = %sender,
            kind = envelope.message.kind_name(),
            mode = %envelope.message.mode(),
            ?reaction,
            foreground = ?self.foreground.map(|id| id.0),
            "Routed message"
        );
        debug_assert!(self.visible_apps() <= 1);
        reaction
    }

    fn route_status_bar(&mut self, message: &Message) -> Reaction {
        match *message {
            Message::ModeRequest {
                mode,
                target: Some(target),
            } => match mode {
                AppMode::Visible => self.show(target, true),
                AppMode::Hidden => self.hide_and_hand_off(target, true),
                AppMode::Terminated => self.request_termination(target),
                _ => Reaction::Drop,
            },
            Message::Notification { mode, .. } => self.apply_lifecycle(STATUS_BAR, mode),
            _ => Reaction::Drop,
        }
    }

    fn route_osk(&mut self, message: &Message) -> Reaction {
        match *message {
            Message::ModeRequest { mode, target } if target.map_or(true, |id| id == OSK) => {
                match mode {
                    AppMode::Visible => self.osk_visible(true),
                    AppMode::Hidden => self.set_overlay_mode(OSK, AppMode::Hidden, true),
                    AppMode::Terminated => self.request_termination(OSK),
                    _ => Reaction::Drop,
                }
            }
            Message::Notification {
                mode: AppMode::Visible,
                ..
            } => self.osk_visible(false),
            Message::Notification { mode, .. } => self.apply_lifecycle(OSK, mode),
            Message::OskEvent {
                mode: AppMode::Ready,
            } => match self.foreground {
                Some(foreground) => {
                    self.send(foreground.private_channel(), message.clone());
                    Reaction::Keep
                }
                None => Reaction::Drop,
            },
            _ => Reaction::Drop,
        }
    }

    fn route_application(&mut self, sender: ParticipantId, message: &Message) -> Reaction {
        match *message {
            Message::ModeRequest { mode, target } => {
                if target.is_some_and(|target| target != sender) {
                    warn!(
                        sender = %sender,
                        target = ?target.map(|id| id.0),
                        "App may only request mode changes for itself"
                    );
                    return Reaction::Drop;
                }
                match mode {
                    AppMode::Visible => self.show(sender, true),
                    AppMode::Hidden => self.hide_and_hand_off(sender, true),
                    _ => Reaction::Drop,
                }
            }
            Message::SwitchMode {
                mode: AppMode::Visible,
                target: Some(target),
            } if sender == LAUNCHER && target != LAUNCHER => self.switch_from_launcher(target),
            Message::SwitchMode { .. } => {
                warn!(sender = %sender, "Only the launcher may switch other apps");
                Reaction::Drop
            }
            Message::Notification { mode, .. } => self.apply_lifecycle(sender, mode),
            Message::OskEvent {
                mode: AppMode::Visible | AppMode::Hidden,
            } if self.foreground == Some(sender) => {
                self.send(OSK.private_channel(), message.clone());
                Reaction::Keep
            }
            Message::OskEvent { .. } => Reaction::Drop,
        }
    }

    /// A participant reporting its own lifecycle.
    fn apply_lifecycle(&mut self, sender: ParticipantId, mode: AppMode) -> Reaction {
        let foreground_capable = sender.role().can_hold_foreground();
        match mode {
            AppMode::None => Reaction::Drop,
            AppMode::Terminated => {
                self.retire(sender);
                Reaction::Keep
            }
            AppMode::Visible if foreground_capable => self.show(sender, false),
            AppMode::Hidden if foreground_capable => self.hide_and_hand_off(sender, false),
            mode => self.set_own_mode(sender, mode),
        }
    }

    fn osk_visible(&mut self, switch: bool) -> Reaction {
        if !self.osk_announced {
            self.osk_announced = true;
            info!("OSK starts hidden; ignoring its first visibility announcement");
            return self.set_overlay_mode(OSK, AppMode::Hidden, true);
        }
        self.set_overlay_mode(OSK, AppMode::Visible, switch)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mode changes
    // ─────────────────────────────────────────────────────────────────────

    /// Makes `target` the foreground app, hiding the previous one first.
    fn show(&mut self, target: ParticipantId, switch: bool) -> Reaction {
        let Some(record) = self.arena.registry().get(target) else {
            debug!(target = %target, "Cannot show unknown participant");
            return Reaction::Drop;
        };
        if !record.role.can_hold_foreground() {
            return Reaction::Drop;
        }
        let mode = record.mode;
        if self.foreground == Some(target) && mode == AppMode::Visible {
            return Reaction::Keep;
        }
        if mode != AppMode::Visible && !mode.can_advance_to(AppMode::Visible) {
            debug!(target = %target, %mode, "App cannot become visible");
            return Reaction::Drop;
        }

        if let Some(previous) = self.foreground.filter(|previous| *previous != target) {
            self.hide_record(previous, true);
        }
        if let Some(record) = self.arena.registry_mut().get_mut(target) {
            record.mode = AppMode::Visible;
        }
        self.foreground = Some(target);
        info!(foreground = %target, "Foreground changed");

        if switch {
            self.send(
                target.private_channel(),
                Message::SwitchMode {
                    mode: AppMode::Visible,
                    target: Some(target),
                },
            );
        }
        self.notify_status_bar(AppMode::Visible, Some(target));
        Reaction::Keep
    }

    /// The launcher picked an app: the app comes forward and the launcher
    /// steps back, whether or not it held the foreground.
    fn switch_from_launcher(&mut self, target: ParticipantId) -> Reaction {
        let reaction = self.show(target, true);
        if reaction == Reaction::Keep && self.foreground == Some(target) {
            self.hide_record(LAUNCHER, true);
        }
        reaction
    }

    /// Hides `target`; if it held the foreground, the launcher takes over.
    fn hide_and_hand_off(&mut self, target: ParticipantId, switch: bool) -> Reaction {
        let Some(record) = self.arena.registry().get(target) else {
            return Reaction::Drop;
        };
        if record.mode == AppMode::Hidden {
            return Reaction::Keep;
        }
        if !record.mode.can_advance_to(AppMode::Hidden) {
            return Reaction::Drop;
        }
        let was_foreground = self.foreground == Some(target);
        self.hide_record(target, switch);
        if was_foreground && target != LAUNCHER {
            self.restore_launcher();
        }
        Reaction::Keep
    }

    fn hide_record(&mut self, id: ParticipantId, switch: bool) {
        let Some(record) = self.arena.registry_mut().get_mut(id) else {
            return;
        };
        if record.mode == AppMode::Hidden || !record.mode.can_advance_to(AppMode::Hidden) {
            return;
        }
        record.mode = AppMode::Hidden;
        if self.foreground == Some(id) {
            self.foreground = None;
        }
        if switch {
            self.send(
                id.private_channel(),
                Message::SwitchMode {
                    mode: AppMode::Hidden,
                    target: Some(id),
                },
            );
        }
    }

    fn set_overlay_mode(&mut self, id: ParticipantId, mode: AppMode, switch: bool) -> Reaction {
        let Some(record) = self.arena.registry_mut().get_mut(id) else {
            return Reaction::Drop;
        };
        if record.mode == mode {
            return Reaction::Keep;
        }
        if !record.mode.can_advance_to(mode) {
            return Reaction::Drop;
        }
        record.mode = mode;
        if switch {
            self.send(
                id.private_channel(),
                Message::SwitchMode {
                    mode,
                    target: Some(id),
                },
            );
        }
        Reaction::Keep
    }

    fn set_own_mode(&mut self, id: ParticipantId, mode: AppMode) -> Reaction {
        let Some(record) = self.arena.registry_mut().get_mut(id) else {
            return Reaction::Drop;
        };
        if record.mode == mode {
            return Reaction::Keep;
        }
        if !record.mode.can_advance_to(mode) {
            debug!(participant = %id, from = %record.mode, to = %mode, "Ignoring invalid transition");
            return Reaction::Drop;
        }
        record.mode = mode;
        if self.foreground == Some(id) {
            self.foreground = None;
            if id != LAUNCHER {
                self.restore_launcher();
            }
        }
        Reaction::Keep
    }

    fn request_termination(&mut self, target: ParticipantId) -> Reaction {
        if !self.is_registered(target) {
            return Reaction::Drop;
        }
        info!(target = %target, "Requesting app termination");
        self.send(
            target.private_channel(),
            Message::SwitchMode {
                mode: AppMode::Terminated,
                target: Some(target),
            },
        );
        Reaction::Keep
    }

    fn restore_launcher(&mut self) {
        if self.shutting_down || !self.is_registered(LAUNCHER) {
            return;
        }
        self.show(LAUNCHER, true);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Departures
    // ─────────────────────────────────────────────────────────────────────

    /// Removes a departed app: its record, its bus attachments and, if it was
    /// in front, its claim on the foreground.
    fn retire(&mut self, id: ParticipantId) -> bool {
        let Some(record) = self.arena.evict(id) else {
            return false;
        };
        self.bus.detach_owner(id);
        let was_foreground = self.foreground == Some(id);
        if was_foreground {
            self.foreground = None;
        }
        info!(
            participant = %id,
            title = %record.title,
            remaining = self.arena.registry().len(),
            "App left the session"
        );

        if id != STATUS_BAR {
            self.notify_status_bar(AppMode::Terminated, Some(id));
        }
        if was_foreground && id != LAUNCHER && self.arena.registry().len() >= 2 {
            self.restore_launcher();
        }
        true
    }

    /// Treats a participant whose connection or process vanished as if it had
    /// announced its own termination.
    pub fn participant_gone(&mut self, id: ParticipantId) -> bool {
        if !self.is_registered(id) {
            return false;
        }
        warn!(participant = %id, "Participant went away without unregistering");
        self.retire(id)
    }

    /// Retires every record whose process `is_alive` rejects.
    pub fn reap<F>(&mut self, is_alive: F) -> Vec<ParticipantId>
    where
        F: Fn(&AppRecord) -> bool,
    {
        let dead: Vec<(ParticipantId, u32)> = self
            .arena
            .registry()
            .iter()
            .filter(|record| !is_alive(record))
            .map(|record| (record.participant_id, record.pid))
            .collect();
        for (id, pid) in &dead {
            warn!(participant = %id, pid, "Reaping app whose process exited");
            self.retire(*id);
        }
        dead.into_iter().map(|(id, _)| id).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Asks the status bar to terminate, which starts a session shutdown.
    pub fn request_shutdown(&mut self) -> bool {
        if !self.is_registered(STATUS_BAR) {
            return false;
        }
        self.request_termination(STATUS_BAR);
        true
    }

    /// Tells every app on the broadcast channel that the session is over.
    pub fn broadcast_terminated(&mut self) -> DispatchReport {
        self.shutting_down = true;
        info!(
            population = self.arena.registry().len(),
            "Broadcasting session termination"
        );
        self.bus.dispatch(
            Envelope {
                sender: ParticipantId::MAESTRO,
                channel: Channel::BROADCAST,
                message: Message::Notification {
                    mode: AppMode::Terminated,
                    app_id: None,
                },
            },
            true,
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    fn notify_status_bar(&self, mode: AppMode, app_id: Option<ParticipantId>) {
        if !self.is_registered(STATUS_BAR) {
            return;
        }
        self.send(STATUS_BAR.private_channel(), Message::Notification { mode, app_id });
    }

    fn send(&self, channel: Channel, message: Message) -> DispatchReport {
        let kind = message.kind_name();
        let report = self.bus.dispatch(
            Envelope {
                sender: ParticipantId::MAESTRO,
                channel,
                message,
            },
            true,
        );
        debug!(%channel, kind, delivered = report.delivered, "Coordinator dispatch");
        report
    }

    fn visible_apps(&self) -> usize {
        self.arena
            .registry()
            .iter()
            .filter(|record| record.role.can_hold_foreground() && record.mode == AppMode::Visible)
            .count()
    }
}

fn same_executable(expected: &Path, actual: &Path) -> bool {
    if expected == actual {
        return true;
    }
    match (fs_err::canonicalize(expected), fs_err::canonicalize(actual)) {
        (Ok(expected), Ok(actual)) => expected == actual,
        _ => false,
    }
}
