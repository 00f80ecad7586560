//! How a shell process reacts to what maestro sends it.

use std::sync::{Mutex, PoisonError};

use maestro_protocol::{AppMode, Envelope, Message, ParticipantId, Reaction};
use tracing::{debug, warn};

/// Callbacks a shell process implements to follow the session.
///
/// Callbacks run on the reactor thread. They may post fire-and-forget
/// requests such as [`crate::AppBase::call_maestro`] but must not block on
/// maestro.
pub trait AppDelegate: Send + Sync {
    /// The coordinator changed this app's mode.
    fn on_mode_change(&self, _mode: AppMode) {}

    /// Session news: another app changed mode (status bar only).
    fn on_notification(&self, _mode: AppMode, _app_id: Option<ParticipantId>) {}

    fn on_osk_event(&self, _mode: AppMode) {}
}

/// Delegate that ignores everything.
pub struct NoopDelegate;

impl AppDelegate for NoopDelegate {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub reaction: Reaction,
    pub terminate: bool,
}

impl Verdict {
    fn keep() -> Self {
        Verdict {
            reaction: Reaction::Keep,
            terminate: false,
        }
    }

    fn with(reaction: Reaction) -> Self {
        Verdict {
            reaction,
            terminate: false,
        }
    }
}

/// Applies one delivery to the app's local state and decides the reaction
/// sent back to maestro.
pub fn react(
    own_id: ParticipantId,
    mode: &Mutex<AppMode>,
    delegate: &dyn AppDelegate,
    envelope: &Envelope,
) -> Verdict {
    if envelope.sender != ParticipantId::MAESTRO {
        warn!(sender = %envelope.sender, "Delivery not stamped by maestro; detaching");
        return Verdict::with(Reaction::Remove);
    }

    match envelope.message {
        Message::SwitchMode { mode: next, target } => {
            if target.is_some_and(|target| target != own_id) {
                debug!(target = ?target.map(|id| id.0), "Switch addressed to another app");
                return Verdict::with(Reaction::Drop);
            }
            if update_mode(mode, next) {
                delegate.on_mode_change(next);
            }
            Verdict {
                reaction: Reaction::Keep,
                terminate: next == AppMode::Terminated,
            }
        }
        Message::Notification {
            mode: AppMode::Terminated,
            app_id: None,
        } => {
            if update_mode(mode, AppMode::Terminated) {
                delegate.on_mode_change(AppMode::Terminated);
            }
            Verdict {
                reaction: Reaction::Keep,
                terminate: true,
            }
        }
        Message::Notification {
            mode: changed,
            app_id,
        } => {
            delegate.on_notification(changed, app_id);
            Verdict::keep()
        }
        Message::OskEvent { mode: event } => {
            delegate.on_osk_event(event);
            Verdict::keep()
        }
        Message::ModeRequest { .. } => Verdict::with(Reaction::Drop),
    }
}

fn update_mode(mode: &Mutex<AppMode>, next: AppMode) -> bool {
    let mut current = mode.lock().unwrap_or_else(PoisonError::into_inner);
    if *current == next {
        return false;
    }
    *current = next;
    true
}
