//! Channel-addressed message bus.
//!
//! Subscribers attach to numbered channels; dispatching an envelope hands it
//! to every attachment on its channel. Local subscribers react inline. Remote
//! subscribers return a ticket that resolves when the peer acknowledges the
//! delivery, and the dispatcher either waits for every ticket (`want_ack`) or
//! parks them and settles them on a later bus operation.
//!
//! The attachment table lock is never held while a subscriber runs, so a
//! subscriber may attach, detach or dispatch from inside its own handler.

use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use maestro_protocol::{Channel, DispatchReport, Envelope, ParticipantId, Reaction};
use tracing::{debug, warn};

/// Outcome of handing an envelope to one subscriber.
pub enum Delivered {
    /// The subscriber reacted synchronously.
    Done(Reaction),
    /// The reaction arrives later on this receiver.
    Pending(mpsc::Receiver<Reaction>),
    /// The subscriber is gone; nothing was delivered.
    Lost,
}

pub trait Subscriber: Send + Sync {
    fn deliver(&self, envelope: &Envelope) -> Delivered;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentId(u64);

struct Attachment {
    id: AttachmentId,
    owner: ParticipantId,
    subscriber: Arc<dyn Subscriber>,
}

struct Deferred {
    channel: Channel,
    attachment: AttachmentId,
    ticket: mpsc::Receiver<Reaction>,
}

#[derive(Default)]
struct BusInner {
    channels: BTreeMap<Channel, Vec<Attachment>>,
    deferred: Vec<Deferred>,
    next_attachment: u64,
}

impl BusInner {
    fn remove_attachment(&mut self, channel: Channel, attachment: AttachmentId) -> bool {
        let Some(attachments) = self.channels.get_mut(&channel) else {
            return false;
        };
        let before = attachments.len();
        attachments.retain(|entry| entry.id != attachment);
        let removed = attachments.len() != before;
        if attachments.is_empty() {
            self.channels.remove(&channel);
        }
        removed
    }

    /// Settles parked tickets whose reactions have arrived.
    fn settle_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for entry in deferred {
            match entry.ticket.try_recv() {
                Ok(Reaction::Remove) => {
                    debug!(channel = %entry.channel, "Deferred reaction detached subscriber");
                    self.remove_attachment(entry.channel, entry.attachment);
                }
                Ok(_) | Err(TryRecvError::Disconnected) => {}
                Err(TryRecvError::Empty) => self.deferred.push(entry),
            }
        }
    }
}

pub struct MessageBus {
    inner: Mutex<BusInner>,
    ack_timeout: Option<Duration>,
}

impl MessageBus {
    /// `ack_timeout` bounds how long a `want_ack` dispatch waits for
    /// reactions; `None` waits indefinitely.
    pub fn new(ack_timeout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            ack_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(
        &self,
        channel: Channel,
        owner: ParticipantId,
        subscriber: Arc<dyn Subscriber>,
    ) -> AttachmentId {
        let mut inner = self.lock();
        inner.settle_deferred();
        inner.next_attachment += 1;
        let id = AttachmentId(inner.next_attachment);
        inner.channels.entry(channel).or_default().push(Attachment {
            id,
            owner,
            subscriber,
        });
        debug!(%channel, owner = %owner, "Attached subscriber");
        id
    }

    pub fn detach(&self, channel: Channel, attachment: AttachmentId) -> bool {
        let mut inner = self.lock();
        inner.settle_deferred();
        inner.remove_attachment(channel, attachment)
    }

    /// Detaches everything `owner` has on `channel`.
    pub fn detach_owner_from(&self, channel: Channel, owner: ParticipantId) -> usize {
        let mut inner = self.lock();
        inner.settle_deferred();
        let ids: Vec<AttachmentId> = inner
            .channels
            .get(&channel)
            .map(|attachments| {
                attachments
                    .iter()
                    .filter(|entry| entry.owner == owner)
                    .map(|entry| entry.id)
                    .collect()
            })
            .unwrap_or_default();
        ids.into_iter()
            .filter(|id| inner.remove_attachment(channel, *id))
            .count()
    }

    /// Detaches everything `owner` has on any channel.
    pub fn detach_owner(&self, owner: ParticipantId) -> usize {
        let mut inner = self.lock();
        inner.settle_deferred();
        let mut removed = 0;
        inner.channels.retain(|_, attachments| {
            let before = attachments.len();
            attachments.retain(|entry| entry.owner != owner);
            removed += before - attachments.len();
            !attachments.is_empty()
        });
        if removed > 0 {
            debug!(owner = %owner, removed, "Detached participant from bus");
        }
        removed
    }

    pub fn subscribers(&self, channel: Channel) -> Vec<ParticipantId> {
        self.lock()
            .channels
            .get(&channel)
            .map(|attachments| attachments.iter().map(|entry| entry.owner).collect())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, channel: Channel, owner: ParticipantId) -> bool {
        self.subscribers(channel).contains(&owner)
    }

    /// Delivers `envelope` to every subscriber on its channel, in attachment
    /// order. With `want_ack` the call returns only once every remote
    /// subscriber has reacted or the ack timeout has passed.
    pub fn dispatch(&self, envelope: Envelope, want_ack: bool) -> DispatchReport {
        let channel = envelope.channel;
        let targets: Vec<(AttachmentId, Arc<dyn Subscriber>)> = {
            let mut inner = self.lock();
            inner.settle_deferred();
            inner
                .channels
                .get(&channel)
                .map(|attachments| {
                    attachments
                        .iter()
                        .map(|entry| (entry.id, Arc::clone(&entry.subscriber)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut report = DispatchReport::default();
        let mut removals = HashSet::new();
        let mut waiting = Vec::new();
        let mut parked = Vec::new();

        for (attachment, subscriber) in targets {
            match subscriber.deliver(&envelope) {
                Delivered::Done(reaction) => {
                    report.delivered += 1;
                    report.acknowledged += 1;
                    tally(&mut report, &mut removals, attachment, reaction);
                }
                Delivered::Pending(ticket) => {
                    report.delivered += 1;
                    if want_ack {
                        waiting.push((attachment, ticket));
                    } else {
                        parked.push(Deferred {
                            channel,
                            attachment,
                            ticket,
                        });
                    }
                }
                Delivered::Lost => {}
            }
        }

        if !waiting.is_empty() {
            let deadline = self.ack_timeout.map(|timeout| Instant::now() + timeout);
            for (attachment, ticket) in waiting {
                let outcome = match deadline {
                    Some(deadline) => {
                        ticket.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    }
                    None => ticket.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match outcome {
                    Ok(reaction) => {
                        report.acknowledged += 1;
                        tally(&mut report, &mut removals, attachment, reaction);
                    }
                    Err(RecvTimeoutError::Timeout) => report.timed_out += 1,
                    // Peer disconnected mid-delivery; its cleanup detaches it.
                    Err(RecvTimeoutError::Disconnected) => {}
                }
            }
            if report.timed_out > 0 {
                warn!(
                    %channel,
                    kind = envelope.message.kind_name(),
                    timed_out = report.timed_out,
                    "Subscribers did not acknowledge delivery in time"
                );
            }
        }

        if !removals.is_empty() || !parked.is_empty() {
            let mut inner = self.lock();
            for attachment in removals {
                inner.remove_attachment(channel, attachment);
            }
            inner.deferred.extend(parked);
        }

        report
    }
}

fn tally(
    report: &mut DispatchReport,
    removals: &mut HashSet<AttachmentId>,
    attachment: AttachmentId,
    reaction: Reaction,
) {
    match reaction {
        Reaction::Keep => {}
        Reaction::Drop => report.dropped += 1,
        Reaction::Remove => {
            report.removed += 1;
            removals.insert(attachment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_protocol::{AppMode, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Fixed {
        reaction: Reaction,
        seen: AtomicUsize,
    }

    impl Fixed {
        fn new(reaction: Reaction) -> Arc<Self> {
            Arc::new(Self {
                reaction,
                seen: AtomicUsize::new(0),
            })
        }

        fn seen(&self) -> usize {
            self.seen.load(Ordering::SeqCst)
        }
    }

    impl Subscriber for Fixed {
        fn deliver(&self, _envelope: &Envelope) -> Delivered {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Delivered::Done(self.reaction)
        }
    }

    /// Answers from another thread after `delay`, or never.
    struct Remote {
        reaction: Reaction,
        delay: Option<Duration>,
    }

    impl Subscriber for Remote {
        fn deliver(&self, _envelope: &Envelope) -> Delivered {
            let (tx, rx) = mpsc::channel();
            if let Some(delay) = self.delay {
                let reaction = self.reaction;
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = tx.send(reaction);
                });
            } else {
                thread::spawn(move || {
                    thread::sleep(Duration::from_secs(2));
                    drop(tx);
                });
            }
            Delivered::Pending(rx)
        }
    }

    fn envelope(channel: Channel) -> Envelope {
        Envelope {
            sender: ParticipantId::MAESTRO,
            channel,
            message: Message::Notification {
                mode: AppMode::Ready,
                app_id: None,
            },
        }
    }

    #[test]
    fn dispatch_reaches_only_the_addressed_channel() {
        let bus = MessageBus::new(None);
        let on_seven = Fixed::new(Reaction::Keep);
        let on_eight = Fixed::new(Reaction::Keep);
        bus.attach(Channel(7), ParticipantId(7), on_seven.clone());
        bus.attach(Channel(8), ParticipantId(8), on_eight.clone());

        let report = bus.dispatch(envelope(Channel(7)), true);
        assert_eq!(report.delivered, 1);
        assert_eq!(on_seven.seen(), 1);
        assert_eq!(on_eight.seen(), 0);
    }

    #[test]
    fn dispatch_to_empty_channel_delivers_nothing() {
        let bus = MessageBus::new(None);
        assert_eq!(
            bus.dispatch(envelope(Channel(42)), true),
            DispatchReport::default()
        );
    }

    #[test]
    fn remove_reaction_detaches_subscriber() {
        let bus = MessageBus::new(None);
        let keeper = Fixed::new(Reaction::Keep);
        let leaver = Fixed::new(Reaction::Remove);
        bus.attach(Channel::BROADCAST, ParticipantId(5), keeper.clone());
        bus.attach(Channel::BROADCAST, ParticipantId(6), leaver.clone());

        let report = bus.dispatch(envelope(Channel::BROADCAST), true);
        assert_eq!(report.removed, 1);
        assert_eq!(bus.subscribers(Channel::BROADCAST), vec![ParticipantId(5)]);

        bus.dispatch(envelope(Channel::BROADCAST), true);
        assert_eq!(keeper.seen(), 2);
        assert_eq!(leaver.seen(), 1);
    }

    #[test]
    fn drop_reaction_is_counted() {
        let bus = MessageBus::new(None);
        bus.attach(Channel(9), ParticipantId(9), Fixed::new(Reaction::Drop));
        let report = bus.dispatch(envelope(Channel(9)), true);
        assert_eq!(report.dropped, 1);
        assert!(report.rejected());
        assert!(bus.is_attached(Channel(9), ParticipantId(9)));
    }

    #[test]
    fn want_ack_waits_for_remote_reactions() {
        let bus = MessageBus::new(Some(Duration::from_secs(5)));
        bus.attach(
            Channel(5),
            ParticipantId(5),
            Arc::new(Remote {
                reaction: Reaction::Remove,
                delay: Some(Duration::from_millis(20)),
            }),
        );
        let report = bus.dispatch(envelope(Channel(5)), true);
        assert_eq!(report.acknowledged, 1);
        assert_eq!(report.removed, 1);
        assert!(bus.subscribers(Channel(5)).is_empty());
    }

    #[test]
    fn ack_timeout_bounds_the_wait() {
        let bus = MessageBus::new(Some(Duration::from_millis(30)));
        bus.attach(
            Channel(5),
            ParticipantId(5),
            Arc::new(Remote {
                reaction: Reaction::Keep,
                delay: None,
            }),
        );
        let started = Instant::now();
        let report = bus.dispatch(envelope(Channel(5)), true);
        assert_eq!(report.timed_out, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn deferred_remove_applies_on_next_operation() {
        let bus = MessageBus::new(None);
        bus.attach(
            Channel(5),
            ParticipantId(5),
            Arc::new(Remote {
                reaction: Reaction::Remove,
                delay: Some(Duration::from_millis(1)),
            }),
        );
        let report = bus.dispatch(envelope(Channel(5)), false);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.acknowledged, 0);

        thread::sleep(Duration::from_millis(100));
        bus.dispatch(envelope(Channel(99)), false);
        assert!(bus.subscribers(Channel(5)).is_empty());
    }

    #[test]
    fn detach_owner_clears_every_channel() {
        let bus = MessageBus::new(None);
        bus.attach(Channel(5), ParticipantId(5), Fixed::new(Reaction::Keep));
        bus.attach(Channel::BROADCAST, ParticipantId(5), Fixed::new(Reaction::Keep));
        bus.attach(Channel::BROADCAST, ParticipantId(6), Fixed::new(Reaction::Keep));

        assert_eq!(bus.detach_owner(ParticipantId(5)), 2);
        assert_eq!(bus.subscribers(Channel::BROADCAST), vec![ParticipantId(6)]);
        assert!(bus.subscribers(Channel(5)).is_empty());
    }

    struct Reentrant {
        bus: Arc<MessageBus>,
    }

    impl Subscriber for Reentrant {
        fn deliver(&self, envelope: &Envelope) -> Delivered {
            self.bus.detach_owner_from(envelope.channel, ParticipantId(5));
            self.bus.attach(Channel(6), ParticipantId(6), Fixed::new(Reaction::Keep));
            Delivered::Done(Reaction::Keep)
        }
    }

    #[test]
    fn subscribers_may_touch_the_bus_while_delivering() {
        let bus = Arc::new(MessageBus::new(None));
        bus.attach(
            Channel(5),
            ParticipantId(5),
            Arc::new(Reentrant { bus: Arc::clone(&bus) }),
        );
        let report = bus.dispatch(envelope(Channel(5)), true);
        assert_eq!(report.delivered, 1);
        assert!(bus.subscribers(Channel(5)).is_empty());
        assert_eq!(bus.subscribers(Channel(6)), vec![ParticipantId(6)]);
    }
}
