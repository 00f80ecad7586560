//! The coordinator process: socket server, coordinator worker and shell
//! supervision.
//!
//! Only the worker thread touches the session. Connection threads hand it
//! requests through a queue, so requests are applied one at a time in
//! arrival order while acknowledgements keep flowing on the reader threads.

use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fs_err as fs;
use maestro_core::arena::{SessionState, ARENA_NAME};
use maestro_core::process::{get_process_start_time, record_is_live};
use maestro_core::{
    Arena, ExitClass, MaestroConfig, MaestroError, MemoryPool, ProcessSupervisor, Registration,
    SessionService, ShutdownSignal, Subscriber, World,
};
use maestro_protocol::{
    parse_params, parse_register, parse_set_title, write_frame, ChannelParams, DispatchParams,
    DispatchReport, ErrorInfo, Method, RecordQuery, Request, Response, ServerFrame,
    SetOskTextParams, SetStatusBarHeightParams, ERROR_PROTOCOL_MISMATCH,
    ERROR_INVALID_PARAMS, ERROR_TOO_MANY_CONNECTIONS, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::connection::{self, Link};

/// Work items for the coordinator worker.
pub enum Work {
    Request { link: Arc<Link>, request: Request },
    Disconnected { link: Arc<Link> },
    Reap,
    Broadcast { done: Sender<DispatchReport> },
    Stop,
}

/// Runs a session to completion and returns how the status bar ended it.
pub fn run(config: &MaestroConfig, runtime_dir: &Path) -> Result<ExitClass, MaestroError> {
    let world = World::enter(config.world_index, runtime_dir, false)?;
    if !world.is_master() {
        return Err(MaestroError::AlreadyRunning {
            index: config.world_index,
        });
    }

    let pool = MemoryPool::create(config.pool_size)?;
    let arena = Arena::create(
        ARENA_NAME,
        world.index(),
        pool,
        config.registry_capacity,
        |pool| SessionState::new(pool, config.status_bar_height, config.osk_text_capacity),
    )?;
    let service = Arc::new(SessionService::new(arena, config.ack_timeout()));
    service.reserve_shell_ids(config.shell.clone());

    let socket_path = world.socket_path();
    remove_existing_socket(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)
        .map_err(|err| MaestroError::io(format!("bind {}", socket_path.display()), err))?;
    info!(
        path = %socket_path.display(),
        world = world.index(),
        pid = std::process::id(),
        "Maestro coordinator started"
    );

    let shutdown = ShutdownSignal::default();
    let (work_tx, work_rx) = mpsc::channel();
    let worker = spawn_worker(Arc::clone(&service), work_rx, shutdown.clone(), world.index())?;
    spawn_accept_loop(listener, work_tx.clone(), config.max_connections)?;
    spawn_reaper(work_tx.clone(), config.reap_interval());

    let grace = config.shutdown_grace();
    let mut supervisor =
        ProcessSupervisor::new(config.shell.clone(), service.population(), shutdown.clone())
            .with_session_env(world.index(), runtime_dir);
    let launch_error = supervisor.launch_shell().err();
    let exit = match &launch_error {
        None => supervisor.wait_for_status_bar(grace),
        Some(err) => {
            error!(error = %err, "Failed to launch shell");
            ExitClass::Unknown
        }
    };

    let drained = supervisor.drain(|| broadcast_terminated(&work_tx), grace);
    let _ = work_tx.send(Work::Stop);
    if worker.join().is_err() {
        error!("Coordinator worker panicked");
    }

    let emergency = launch_error.is_some() || !drained || exit != ExitClass::Normal;
    match Arc::try_unwrap(service) {
        Ok(service) => {
            if let Some(arena) = service.into_arena() {
                arena.leave(emergency);
            }
        }
        Err(_) => warn!("Session still referenced at teardown"),
    }
    world.leave()?;
    info!(%exit, emergency, "Maestro coordinator stopped");

    match launch_error {
        Some(err) => Err(err),
        None => Ok(exit),
    }
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), MaestroError> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| MaestroError::io("remove stale socket", err))?;
    }
    Ok(())
}

fn broadcast_terminated(work: &Sender<Work>) {
    let (done_tx, done_rx) = mpsc::channel();
    if work.send(Work::Broadcast { done: done_tx }).is_err() {
        return;
    }
    if let Ok(report) = done_rx.recv() {
        info!(
            delivered = report.delivered,
            acknowledged = report.acknowledged,
            timed_out = report.timed_out,
            "Termination broadcast complete"
        );
    }
}

fn spawn_worker(
    service: Arc<SessionService>,
    work: Receiver<Work>,
    shutdown: ShutdownSignal,
    world_index: u32,
) -> Result<JoinHandle<()>, MaestroError> {
    thread::Builder::new()
        .name("maestro-coordinator".to_string())
        .spawn(move || run_worker(&service, work, &shutdown, world_index))
        .map_err(|err| MaestroError::io("spawn coordinator worker", err))
}

fn run_worker(
    service: &SessionService,
    work: Receiver<Work>,
    shutdown: &ShutdownSignal,
    world_index: u32,
) {
    for item in work {
        match item {
            Work::Request { link, request } => {
                let method = request.method;
                let has_id = request.id.is_some();
                let response = handle_request(service, &link, request, shutdown, world_index);
                if has_id {
                    if let Err(err) = link.respond(response) {
                        debug!(conn = link.conn_id(), error = %err, "Failed to write response");
                    }
                } else if let Some(error) = response.error {
                    warn!(
                        method = method.as_str(),
                        code = %error.code,
                        message = %error.message,
                        "Request without id failed"
                    );
                }
            }
            Work::Disconnected { link } => {
                if let Some(participant) = link.participant() {
                    service.disconnected(participant);
                }
            }
            Work::Reap => {
                let reaped = service.reap(record_is_live);
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Reaped apps whose processes exited");
                }
            }
            Work::Broadcast { done } => {
                let _ = done.send(service.broadcast_terminated());
            }
            Work::Stop => break,
        }
    }
    debug!("Coordinator worker stopped");
}

fn spawn_accept_loop(
    listener: UnixListener,
    work: Sender<Work>,
    max_connections: usize,
) -> Result<(), MaestroError> {
    thread::Builder::new()
        .name("maestro-accept".to_string())
        .spawn(move || accept_loop(listener, work, max_connections))
        .map(|_| ())
        .map_err(|err| MaestroError::io("spawn accept loop", err))
}

/// Decrements the live connection count when a connection thread ends.
struct ActiveConnection(Arc<AtomicUsize>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_loop(listener: UnixListener, work: Sender<Work>, max_connections: usize) {
    let active = Arc::new(AtomicUsize::new(0));
    let mut next_conn: u64 = 0;

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
                continue;
            }
        };
        if active.load(Ordering::SeqCst) >= max_connections {
            warn!(max_connections, "Rejecting connection: too many clients");
            let frame = ServerFrame::Response(Response::error(
                None,
                ERROR_TOO_MANY_CONNECTIONS,
                format!("maestro accepts at most {} connections", max_connections),
            ));
            let _ = write_frame(&mut stream, &frame);
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveConnection(Arc::clone(&active));
        next_conn += 1;
        let conn_id = next_conn;
        let work = work.clone();
        let spawned = thread::Builder::new()
            .name(format!("maestro-conn-{}", conn_id))
            .spawn(move || {
                let _guard = guard;
                connection::serve(stream, conn_id, work);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn connection thread");
        }
    }
}

fn spawn_reaper(work: Sender<Work>, interval: Duration) {
    let spawned = thread::Builder::new()
        .name("maestro-reaper".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            if work.send(Work::Reap).is_err() {
                break;
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn reaper; dead apps will only be noticed on disconnect");
    }
}

fn handle_request(
    service: &SessionService,
    link: &Arc<Link>,
    request: Request,
    shutdown: &ShutdownSignal,
    world_index: u32,
) -> Response {
    let id = request.id.clone();
    match execute(service, link, request, shutdown, world_index) {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn execute(
    service: &SessionService,
    link: &Arc<Link>,
    request: Request,
    shutdown: &ShutdownSignal,
    world_index: u32,
) -> Result<Value, ErrorInfo> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(ErrorInfo::new(
            ERROR_PROTOCOL_MISMATCH,
            "unsupported protocol version",
        ));
    }

    match request.method {
        Method::Register => {
            if let Some(existing) = link.participant() {
                return Err(MaestroError::AlreadyRegistered(existing).into());
            }
            let params = parse_register(request.params)?;
            // Trust the kernel over the client's claim.
            let pid = link.peer_pid().or(params.pid).unwrap_or(0);
            let proc_started = if pid > 0 {
                get_process_start_time(pid)
            } else {
                None
            };
            let welcome = service.register(Registration {
                pid,
                proc_started,
                title: params.title,
                process_path: params.process_path,
            })?;
            link.bind(welcome.participant_id);
            to_json(&welcome)
        }
        Method::Attach => {
            let participant = link.require_participant()?;
            let params: ChannelParams = parse_params(request.params)?;
            let subscriber: Arc<dyn Subscriber> = Arc::clone(link) as Arc<dyn Subscriber>;
            service.attach(participant, params.channel, subscriber)?;
            Ok(json!({ "attached": params.channel }))
        }
        Method::Detach => {
            let participant = link.require_participant()?;
            let params: ChannelParams = parse_params(request.params)?;
            let detached = service.detach(participant, params.channel);
            Ok(json!({ "detached": detached }))
        }
        Method::Dispatch => {
            let participant = link.require_participant()?;
            let params: DispatchParams = parse_params(request.params)?;
            let report =
                service.dispatch(participant, params.channel, params.message, params.want_ack)?;
            to_json(&report)
        }
        Method::Ack => Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "ack is only valid in reply to a delivery",
        )),
        Method::SetTitle => {
            let participant = link.require_participant()?;
            let params = parse_set_title(request.params)?;
            service.set_title(participant, &params.title)?;
            Ok(json!({ "updated": true }))
        }
        Method::GetRecord => {
            let query: RecordQuery = parse_params(request.params)?;
            to_json(&service.record(&query)?)
        }
        Method::ListApps => to_json(&service.records()),
        Method::GetSession => to_json(&service.session()),
        Method::SetOskText => {
            let participant = link.require_participant()?;
            let params: SetOskTextParams = parse_params(request.params)?;
            service.set_osk_text(participant, &params.text)?;
            Ok(json!({ "updated": true }))
        }
        Method::SetStatusBarHeight => {
            let participant = link.require_participant()?;
            let params: SetStatusBarHeightParams = parse_params(request.params)?;
            service.set_status_bar_height(participant, params.height)?;
            Ok(json!({ "updated": true }))
        }
        Method::GetHealth => Ok(json!({
            "status": "ok",
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "world_index": world_index,
            "participants": service.population().current(),
            "foreground": service.foreground(),
            "shutting_down": shutdown.is_requested(),
        })),
        Method::Shutdown => {
            info!(conn = link.conn_id(), "Shutdown requested");
            shutdown.request();
            let notified = service.request_shutdown();
            Ok(json!({ "accepted": true, "status_bar_notified": notified }))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}
