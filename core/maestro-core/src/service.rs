//! Authorised entry point into a running session.
//!
//! The socket server never touches the coordinator or the bus directly; it
//! goes through [`SessionService`], which checks that the caller is
//! registered and only uses the channels it is entitled to. Participants may
//! dispatch only to the coordinator and may attach only to their own private
//! channel or the broadcast channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use maestro_protocol::{
    AppRecordSnapshot, Channel, DispatchReport, Envelope, Message, ParticipantId, RecordQuery,
    SessionSnapshot, Welcome,
};
use tracing::warn;

use crate::arena::Arena;
use crate::bus::{AttachmentId, Delivered, MessageBus, Subscriber};
use crate::config::ShellPaths;
use crate::coordinator::{Registration, SessionCoordinator};
use crate::error::{MaestroError, Result};
use crate::registry::{AppRecord, PopulationWatch};

/// Channel 0 subscriber that feeds envelopes to the coordinator.
struct CoordinatorEndpoint {
    coordinator: Arc<Mutex<SessionCoordinator>>,
}

impl Subscriber for CoordinatorEndpoint {
    fn deliver(&self, envelope: &Envelope) -> Delivered {
        Delivered::Done(lock(&self.coordinator).route(envelope))
    }
}

fn lock(coordinator: &Mutex<SessionCoordinator>) -> MutexGuard<'_, SessionCoordinator> {
    coordinator.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionService {
    bus: Arc<MessageBus>,
    coordinator: Arc<Mutex<SessionCoordinator>>,
    population: PopulationWatch,
}

impl SessionService {
    pub fn new(arena: Arena, ack_timeout: Option<Duration>) -> Self {
        let bus = Arc::new(MessageBus::new(ack_timeout));
        let population = arena.registry().population();
        let coordinator = Arc::new(Mutex::new(SessionCoordinator::new(
            arena,
            Arc::clone(&bus),
        )));
        bus.attach(
            Channel::COORDINATOR,
            ParticipantId::MAESTRO,
            Arc::new(CoordinatorEndpoint {
                coordinator: Arc::clone(&coordinator),
            }),
        );
        Self {
            bus,
            coordinator,
            population,
        }
    }

    /// Only the configured shell executables may take ids 2 to 4.
    pub fn reserve_shell_ids(&self, paths: ShellPaths) {
        lock(&self.coordinator).reserve_shell_ids(paths);
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn population(&self) -> PopulationWatch {
        self.population.clone()
    }

    pub fn register(&self, registration: Registration) -> Result<Welcome> {
        lock(&self.coordinator).register(registration)
    }

    pub fn attach(
        &self,
        participant: ParticipantId,
        channel: Channel,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<AttachmentId> {
        self.ensure_registered(participant)?;
        if channel != Channel::BROADCAST && channel != participant.private_channel() {
            return Err(MaestroError::ForbiddenChannel {
                participant,
                channel,
            });
        }
        Ok(self.bus.attach(channel, participant, subscriber))
    }

    pub fn detach(&self, participant: ParticipantId, channel: Channel) -> usize {
        self.bus.detach_owner_from(channel, participant)
    }

    /// Sends `message` from `participant` to the coordinator.
    pub fn dispatch(
        &self,
        participant: ParticipantId,
        channel: Channel,
        message: Message,
        want_ack: bool,
    ) -> Result<DispatchReport> {
        self.ensure_registered(participant)?;
        if channel != Channel::COORDINATOR {
            return Err(MaestroError::ForbiddenChannel {
                participant,
                channel,
            });
        }
        Ok(self.bus.dispatch(
            Envelope {
                sender: participant,
                channel,
                message,
            },
            want_ack,
        ))
    }

    pub fn set_title(&self, participant: ParticipantId, title: &str) -> Result<()> {
        lock(&self.coordinator).set_title(participant, title)
    }

    pub fn set_osk_text(&self, participant: ParticipantId, text: &str) -> Result<()> {
        lock(&self.coordinator).set_osk_text(participant, text)
    }

    pub fn set_status_bar_height(&self, participant: ParticipantId, height: u32) -> Result<()> {
        lock(&self.coordinator).set_status_bar_height(participant, height)
    }

    pub fn record(&self, query: &RecordQuery) -> Result<AppRecordSnapshot> {
        lock(&self.coordinator)
            .record(query)
            .ok_or_else(|| MaestroError::RecordNotFound(format!("{:?}", query)))
    }

    pub fn records(&self) -> Vec<AppRecordSnapshot> {
        lock(&self.coordinator).records()
    }

    pub fn session(&self) -> SessionSnapshot {
        lock(&self.coordinator).session()
    }

    pub fn foreground(&self) -> Option<ParticipantId> {
        lock(&self.coordinator).foreground()
    }

    pub fn request_shutdown(&self) -> bool {
        lock(&self.coordinator).request_shutdown()
    }

    pub fn broadcast_terminated(&self) -> DispatchReport {
        lock(&self.coordinator).broadcast_terminated()
    }

    /// A participant's connection closed. Whatever it left behind is cleaned
    /// up as if it had terminated.
    pub fn disconnected(&self, participant: ParticipantId) {
        lock(&self.coordinator).participant_gone(participant);
        self.bus.detach_owner(participant);
    }

    pub fn reap<F>(&self, is_alive: F) -> Vec<ParticipantId>
    where
        F: Fn(&AppRecord) -> bool,
    {
        lock(&self.coordinator).reap(is_alive)
    }

    /// Unhooks the coordinator from the bus and hands back the arena.
    pub fn into_arena(self) -> Option<Arena> {
        self.bus.detach_owner(ParticipantId::MAESTRO);
        match Arc::try_unwrap(self.coordinator) {
            Ok(coordinator) => Some(
                coordinator
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .into_arena(),
            ),
            Err(_) => {
                warn!("Coordinator still shared at teardown; skipping arena leave");
                None
            }
        }
    }

    fn ensure_registered(&self, participant: ParticipantId) -> Result<()> {
        if lock(&self.coordinator).is_registered(participant) {
            Ok(())
        } else {
            Err(MaestroError::NotRegistered(participant))
        }
    }
}
