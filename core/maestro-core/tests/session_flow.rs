//! End-to-end session flows through the service layer, with in-process
//! subscribers standing in for shell processes.

use std::sync::{Arc, Mutex};

use maestro_core::arena::{SessionState, ARENA_NAME};
use maestro_core::{
    Arena, Delivered, MaestroError, MemoryPool, Registration, SessionService, Subscriber,
};
use maestro_protocol::{AppMode, Channel, Envelope, Message, ParticipantId, Reaction, RecordQuery};

/// Records every delivery along with a shared sequence number, so tests can
/// check ordering across participants.
struct Recorder {
    id: ParticipantId,
    log: Arc<Mutex<Vec<(ParticipantId, Message)>>>,
}

impl Subscriber for Recorder {
    fn deliver(&self, envelope: &Envelope) -> Delivered {
        assert_eq!(envelope.sender, ParticipantId::MAESTRO);
        self.log
            .lock()
            .unwrap()
            .push((self.id, envelope.message.clone()));
        Delivered::Done(Reaction::Keep)
    }
}

struct Session {
    service: SessionService,
    log: Arc<Mutex<Vec<(ParticipantId, Message)>>>,
}

impl Session {
    fn new(registry_capacity: usize) -> Self {
        let pool = MemoryPool::create(64 * 1024).expect("pool");
        let arena = Arena::create(ARENA_NAME, 0, pool, registry_capacity, |pool| {
            SessionState::new(pool, 50, 256)
        })
        .expect("arena");
        Self {
            service: SessionService::new(arena, None),
            log: Arc::default(),
        }
    }

    fn join(&self, title: &str) -> ParticipantId {
        let welcome = self
            .service
            .register(Registration {
                pid: std::process::id(),
                proc_started: None,
                title: title.to_string(),
                process_path: format!("/usr/bin/{}", title),
            })
            .expect("register");
        let id = welcome.participant_id;
        for channel in [id.private_channel(), Channel::BROADCAST] {
            self.service
                .attach(
                    id,
                    channel,
                    Arc::new(Recorder {
                        id,
                        log: Arc::clone(&self.log),
                    }),
                )
                .expect("attach");
        }
        self.tell(id, Message::Notification {
            mode: AppMode::Ready,
            app_id: None,
        });
        id
    }

    fn tell(&self, sender: ParticipantId, message: Message) {
        self.service
            .dispatch(sender, Channel::COORDINATOR, message, true)
            .expect("dispatch");
    }

    fn mode(&self, id: ParticipantId) -> AppMode {
        self.service
            .record(&RecordQuery::Id(id))
            .map(|record| record.mode)
            .expect("record")
    }

    fn drain_log(&self) -> Vec<(ParticipantId, Message)> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    fn boot_shell(&self) -> (ParticipantId, ParticipantId, ParticipantId) {
        let bar = self.join("statusbar");
        let osk = self.join("osk");
        let home = self.join("home");
        self.tell(osk, Message::Notification {
            mode: AppMode::Visible,
            app_id: None,
        });
        self.tell(home, Message::ModeRequest {
            mode: AppMode::Visible,
            target: None,
        });
        (bar, osk, home)
    }
}

fn visible_apps(session: &Session) -> Vec<ParticipantId> {
    session
        .service
        .records()
        .into_iter()
        .filter(|record| record.role.can_hold_foreground() && record.mode == AppMode::Visible)
        .map(|record| record.participant_id)
        .collect()
}

#[test]
fn app_launch_and_exit_round_trip() {
    let session = Session::new(8);
    let (bar, osk, home) = session.boot_shell();
    assert_eq!(
        (bar, osk, home),
        (
            ParticipantId::STATUS_BAR,
            ParticipantId::OSK,
            ParticipantId::LAUNCHER
        )
    );
    assert_eq!(session.mode(osk), AppMode::Hidden);
    assert_eq!(session.mode(home), AppMode::Visible);
    session.drain_log();

    let app = session.join("calculator");
    assert_eq!(app, ParticipantId(5));
    session.tell(app, Message::ModeRequest {
        mode: AppMode::Visible,
        target: None,
    });

    assert_eq!(
        session.drain_log(),
        vec![
            (
                home,
                Message::SwitchMode {
                    mode: AppMode::Hidden,
                    target: Some(home)
                }
            ),
            (
                app,
                Message::SwitchMode {
                    mode: AppMode::Visible,
                    target: Some(app)
                }
            ),
            (
                bar,
                Message::Notification {
                    mode: AppMode::Visible,
                    app_id: Some(app)
                }
            ),
        ]
    );
    assert_eq!(visible_apps(&session), vec![app]);

    session.tell(app, Message::Notification {
        mode: AppMode::Terminated,
        app_id: None,
    });
    assert!(session.service.record(&RecordQuery::Id(app)).is_err());
    assert_eq!(session.mode(home), AppMode::Visible);
    assert_eq!(session.service.foreground(), Some(home));

    let log = session.drain_log();
    assert!(log.contains(&(
        bar,
        Message::Notification {
            mode: AppMode::Terminated,
            app_id: Some(app)
        }
    )));
    assert!(log.contains(&(
        home,
        Message::SwitchMode {
            mode: AppMode::Visible,
            target: Some(home)
        }
    )));
}

#[test]
fn at_most_one_app_is_visible() {
    let session = Session::new(16);
    let (_, _, home) = session.boot_shell();
    let apps: Vec<ParticipantId> = (0..4).map(|n| session.join(&format!("app{}", n))).collect();

    for app in apps.iter().chain(apps.iter().rev()).chain([&home]) {
        session.tell(*app, Message::ModeRequest {
            mode: AppMode::Visible,
            target: None,
        });
        assert_eq!(visible_apps(&session), vec![*app]);
        assert_eq!(session.service.foreground(), Some(*app));
    }
}

#[test]
fn participants_only_use_their_own_channels() {
    let session = Session::new(8);
    let (bar, _, _) = session.boot_shell();
    let app = session.join("app");

    let recorder = Arc::new(Recorder {
        id: app,
        log: Arc::clone(&session.log),
    });
    let err = session
        .service
        .attach(app, bar.private_channel(), recorder)
        .expect_err("foreign channel");
    assert!(matches!(err, MaestroError::ForbiddenChannel { .. }));

    let err = session
        .service
        .dispatch(
            app,
            bar.private_channel(),
            Message::Notification {
                mode: AppMode::Visible,
                app_id: None,
            },
            true,
        )
        .expect_err("direct dispatch");
    assert!(matches!(err, MaestroError::ForbiddenChannel { .. }));

    let err = session
        .service
        .dispatch(
            ParticipantId(77),
            Channel::COORDINATOR,
            Message::Notification {
                mode: AppMode::Ready,
                app_id: None,
            },
            true,
        )
        .expect_err("unregistered sender");
    assert!(matches!(err, MaestroError::NotRegistered(_)));
}

#[test]
fn registry_full_rejects_registration() {
    let session = Session::new(3);
    session.boot_shell();
    let err = session
        .service
        .register(Registration {
            pid: std::process::id(),
            proc_started: None,
            title: "late".to_string(),
            process_path: "/usr/bin/late".to_string(),
        })
        .expect_err("full");
    assert!(matches!(err, MaestroError::RegistryFull { capacity: 3 }));
}

#[test]
fn disconnect_behaves_like_termination() {
    let session = Session::new(8);
    let (_, _, home) = session.boot_shell();
    let app = session.join("app");
    session.tell(app, Message::ModeRequest {
        mode: AppMode::Visible,
        target: None,
    });

    session.service.disconnected(app);
    assert_eq!(session.service.foreground(), Some(home));
    assert!(!session
        .service
        .bus()
        .subscribers(Channel::BROADCAST)
        .contains(&app));
}

#[test]
fn shutdown_broadcast_reaches_everyone() {
    let session = Session::new(8);
    let (bar, osk, home) = session.boot_shell();
    session.drain_log();

    assert!(session.service.request_shutdown());
    assert_eq!(
        session.drain_log(),
        vec![(
            bar,
            Message::SwitchMode {
                mode: AppMode::Terminated,
                target: Some(bar)
            }
        )]
    );

    let report = session.service.broadcast_terminated();
    assert_eq!(report.delivered, 3);
    let recipients: Vec<ParticipantId> = session.drain_log().into_iter().map(|(id, _)| id).collect();
    assert_eq!(recipients, vec![bar, osk, home]);

    let arena = session.service.into_arena().expect("arena");
    assert_eq!(arena.registry().len(), 3);
    arena.leave(true);
}
