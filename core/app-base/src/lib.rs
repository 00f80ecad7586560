//! Client side of a Maestro session.
//!
//! A shell process calls [`AppBase::join`] to enter a running world as a
//! slave. Joining registers the process, attaches its private and broadcast
//! channels and starts a reactor thread that applies coordinator messages to
//! the local [`AppMode`] and forwards them to an [`AppDelegate`].

mod error;
pub mod reactor;

use std::collections::HashMap;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use maestro_core::config;
use maestro_core::world::World;
use maestro_protocol::{
    read_frame, write_frame, AckParams, AppMode, AppRecordSnapshot, Channel, ChannelParams,
    DispatchParams, DispatchReport, ErrorInfo, Message, Method, ParticipantId, RecordQuery,
    RegisterParams, Request, Response, Role, ServerFrame, SessionSnapshot,
    SetOskTextParams, SetStatusBarHeightParams, SetTitleParams, Welcome, ERROR_NOT_FOUND,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use error::{AppBaseError, Result};
pub use reactor::{AppDelegate, NoopDelegate};

pub use maestro_core::config::WORLD_ENV;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_ATTEMPTS: usize = 20;
const CONNECT_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub title: String,
    pub process_path: String,
    pub world_index: u32,
    /// Defaults to the runtime directory maestro itself uses.
    pub runtime_dir: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl JoinOptions {
    pub fn new(title: impl Into<String>) -> Self {
        let process_path = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        let world_index = std::env::var(WORLD_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        Self {
            title: title.into(),
            process_path,
            world_index,
            runtime_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_world(mut self, world_index: u32) -> Self {
        self.world_index = world_index;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn with_process_path(mut self, path: impl Into<String>) -> Self {
        self.process_path = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// State shared between the caller's thread and the reactor thread.
struct Shared {
    writer: Mutex<UnixStream>,
    pending: Mutex<HashMap<String, mpsc::Sender<Response>>>,
    next_request: AtomicU64,
    participant: OnceLock<ParticipantId>,
    mode: Mutex<AppMode>,
    terminated: (Mutex<bool>, Condvar),
    reactor_thread: OnceLock<ThreadId>,
    delegate: Box<dyn AppDelegate>,
    request_timeout: Duration,
}

impl Shared {
    fn write(&self, request: &Request) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, request)
    }

    /// Closes both directions of the socket, which ends the reactor thread.
    fn disconnect(&self) {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writer.shutdown(std::net::Shutdown::Both);
    }

    fn on_reactor_thread(&self) -> bool {
        self.reactor_thread.get() == Some(&thread::current().id())
    }

    /// Sends a request without waiting for, or asking for, an answer.
    fn post<P: Serialize>(&self, method: Method, params: &P) -> Result<()> {
        let request = Request::new(method, None, Some(to_value(method, params)?));
        self.write(&request).map_err(AppBaseError::from)
    }

    fn request<P, T>(&self, method: Method, params: Option<&P>) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        if self.on_reactor_thread() {
            return Err(AppBaseError::ReentrantCall(method.as_str()));
        }
        let params = params.map(|params| to_value(method, params)).transpose()?;
        let id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel();
        self.pending_lock().insert(id.clone(), tx);

        if let Err(err) = self.write(&Request::new(method, Some(id.clone()), params)) {
            self.pending_lock().remove(&id);
            return Err(err.into());
        }

        let response = match rx.recv_timeout(self.request_timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                self.pending_lock().remove(&id);
                return Err(AppBaseError::Timeout {
                    method: method.as_str(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(AppBaseError::Disconnected),
        };

        if !response.ok {
            let error = response.error.unwrap_or_else(|| {
                ErrorInfo::new("unknown_error", "maestro returned an error without details")
            });
            return Err(AppBaseError::Rejected {
                method: method.as_str(),
                error,
            });
        }
        serde_json::from_value(response.data.unwrap_or(Value::Null)).map_err(|err| {
            AppBaseError::MalformedResponse {
                method: method.as_str(),
                details: err.to_string(),
            }
        })
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            if let Some(error) = &response.error {
                warn!(code = %error.code, message = %error.message, "maestro reported an error");
            }
            return;
        };
        match self.pending_lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(id = %id, "Response for abandoned request"),
        }
    }

    fn mode(&self) -> AppMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: AppMode) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn raise_termination(&self) {
        let (lock, condvar) = &self.terminated;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    /// The coordinator went away: nothing pending will ever be answered and
    /// the app has no session left to live in.
    fn connection_lost(&self) {
        self.pending_lock().clear();
        if self.mode() != AppMode::Terminated {
            self.set_mode(AppMode::Terminated);
            self.delegate.on_mode_change(AppMode::Terminated);
        }
        self.raise_termination();
    }
}

fn to_value<P: Serialize>(method: Method, params: &P) -> Result<Value> {
    serde_json::to_value(params).map_err(|err| AppBaseError::MalformedResponse {
        method: method.as_str(),
        details: err.to_string(),
    })
}

fn run_reactor(shared: Arc<Shared>, stream: UnixStream) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, ServerFrame>(&mut reader) {
            Ok(Some(ServerFrame::Response(response))) => shared.complete(response),
            Ok(Some(ServerFrame::Delivery(delivery))) => {
                let own_id = shared
                    .participant
                    .get()
                    .copied()
                    .unwrap_or(ParticipantId::MAESTRO);
                let verdict = reactor::react(
                    own_id,
                    &shared.mode,
                    shared.delegate.as_ref(),
                    &delivery.envelope,
                );
                let ack = AckParams {
                    seq: delivery.seq,
                    reaction: verdict.reaction,
                };
                if let Err(err) = shared.post(Method::Ack, &ack) {
                    warn!(error = %err, "Failed to acknowledge delivery");
                    break;
                }
                if verdict.terminate {
                    info!("Session asked this app to terminate");
                    shared.raise_termination();
                }
            }
            Ok(None) => break,
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "Skipping malformed frame from maestro");
            }
            Err(err) => {
                warn!(error = %err, "Lost connection to maestro");
                break;
            }
        }
    }
    shared.connection_lost();
}

fn connect_with_retry(path: &Path) -> Result<UnixStream> {
    let mut last_error = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                last_error = Some(err);
                thread::sleep(CONNECT_RETRY);
            }
        }
    }
    Err(AppBaseError::Connect {
        path: path.to_path_buf(),
        source: last_error
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no socket")),
    })
}

/// A shell process's membership in a running session.
pub struct AppBase {
    shared: Arc<Shared>,
    welcome: Welcome,
    reactor: Option<JoinHandle<()>>,
    left: bool,
}

impl AppBase {
    /// Joins the session running in `options.world_index`. Fails with
    /// [`maestro_core::MaestroError::NotRunning`] when no coordinator is up.
    pub fn join<D: AppDelegate + 'static>(options: JoinOptions, delegate: D) -> Result<AppBase> {
        let dir = match options.runtime_dir {
            Some(dir) => dir,
            None => config::runtime_dir()?,
        };
        let world = World::enter(options.world_index, &dir, true)?;
        let socket = world.socket_path();
        world.leave()?;

        let stream = connect_with_retry(&socket)?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            participant: OnceLock::new(),
            mode: Mutex::new(AppMode::None),
            terminated: (Mutex::new(false), Condvar::new()),
            reactor_thread: OnceLock::new(),
            delegate: Box::new(delegate),
            request_timeout: options.request_timeout,
        });

        let reactor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("maestro-reactor".to_string())
                .spawn(move || run_reactor(shared, reader))?
        };
        let _ = shared.reactor_thread.set(reactor.thread().id());

        let registered = shared.request::<_, Welcome>(
            Method::Register,
            Some(&RegisterParams {
                title: options.title,
                process_path: options.process_path,
                pid: Some(std::process::id()),
            }),
        );
        let welcome = match registered {
            Ok(welcome) => welcome,
            Err(err) => {
                shared.disconnect();
                let _ = reactor.join();
                return Err(err);
            }
        };
        let _ = shared.participant.set(welcome.participant_id);

        let app = AppBase {
            shared,
            welcome,
            reactor: Some(reactor),
            left: false,
        };
        for channel in [app.participant_id().private_channel(), Channel::BROADCAST] {
            app.shared
                .request::<_, Value>(Method::Attach, Some(&ChannelParams { channel }))?;
        }
        app.set_app_mode(AppMode::Initialising)?;
        info!(
            participant = %app.participant_id(),
            role = ?app.role(),
            "Joined maestro session"
        );
        Ok(app)
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.welcome.participant_id
    }

    pub fn role(&self) -> Role {
        self.welcome.role
    }

    pub fn welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn app_mode(&self) -> AppMode {
        self.shared.mode()
    }

    /// Records a self-initiated mode change and tells maestro about it.
    pub fn set_app_mode(&self, mode: AppMode) -> Result<()> {
        self.shared.set_mode(mode);
        self.call_maestro(Message::Notification { mode, app_id: None })
    }

    /// Sends `message` to the coordinator without waiting. Safe to call from
    /// delegate callbacks.
    pub fn call_maestro(&self, message: Message) -> Result<()> {
        self.shared.post(
            Method::Dispatch,
            &DispatchParams {
                channel: Channel::COORDINATOR,
                message,
                want_ack: false,
            },
        )
    }

    /// Sends `message` to the coordinator and waits until it has been
    /// routed, including every delivery the routing caused.
    pub fn call_maestro_and_wait(&self, message: Message) -> Result<DispatchReport> {
        self.shared.request(
            Method::Dispatch,
            Some(&DispatchParams {
                channel: Channel::COORDINATOR,
                message,
                want_ack: true,
            }),
        )
    }

    /// Asks to be brought to the foreground.
    pub fn request_visible(&self) -> Result<()> {
        self.call_maestro(Message::ModeRequest {
            mode: AppMode::Visible,
            target: None,
        })
    }

    pub fn set_title(&self, title: &str) -> Result<()> {
        self.shared.request::<_, Value>(
            Method::SetTitle,
            Some(&SetTitleParams {
                title: title.to_string(),
            }),
        )?;
        Ok(())
    }

    pub fn get_app_record(&self, query: RecordQuery) -> Result<Option<AppRecordSnapshot>> {
        let found = self
            .shared
            .request::<_, AppRecordSnapshot>(Method::GetRecord, Some(&query));
        match found {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.code() == Some(ERROR_NOT_FOUND) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn list_apps(&self) -> Result<Vec<AppRecordSnapshot>> {
        self.shared.request::<(), _>(Method::ListApps, None)
    }

    pub fn session(&self) -> Result<SessionSnapshot> {
        self.shared.request::<(), _>(Method::GetSession, None)
    }

    pub fn osk_text(&self) -> Result<String> {
        Ok(self.session()?.osk_text)
    }

    pub fn set_osk_text(&self, text: &str) -> Result<()> {
        self.shared.request::<_, Value>(
            Method::SetOskText,
            Some(&SetOskTextParams {
                text: text.to_string(),
            }),
        )?;
        Ok(())
    }

    pub fn set_status_bar_height(&self, height: u32) -> Result<()> {
        self.shared.request::<_, Value>(
            Method::SetStatusBarHeight,
            Some(&SetStatusBarHeightParams { height }),
        )?;
        Ok(())
    }

    pub fn termination_requested(&self) -> bool {
        *self
            .shared
            .terminated
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until maestro asks this app to terminate or the connection
    /// drops. Returns `false` if `timeout` passed first.
    pub fn wait_for_termination(&self, timeout: Option<Duration>) -> bool {
        let (lock, condvar) = &self.shared.terminated;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            Some(timeout) => {
                let (guard, _) = condvar
                    .wait_timeout_while(guard, timeout, |terminated| !*terminated)
                    .unwrap_or_else(PoisonError::into_inner);
                *guard
            }
            None => *condvar
                .wait_while(guard, |terminated| !*terminated)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Detaches from the bus, removes this app's record and closes the
    /// connection.
    pub fn leave(mut self) -> Result<()> {
        self.leave_session()
    }

    fn leave_session(&mut self) -> Result<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        self.shared.set_mode(AppMode::Terminated);

        for channel in [self.participant_id().private_channel(), Channel::BROADCAST] {
            if let Err(err) = self
                .shared
                .request::<_, Value>(Method::Detach, Some(&ChannelParams { channel }))
            {
                debug!(error = %err, %channel, "Detach during leave failed");
            }
        }
        let result = match self.call_maestro_and_wait(Message::Notification {
            mode: AppMode::Terminated,
            app_id: None,
        }) {
            Ok(_) | Err(AppBaseError::Disconnected) => Ok(()),
            Err(AppBaseError::Io(_)) if self.termination_requested() => Ok(()),
            Err(err) => Err(err),
        };

        self.shared.disconnect();
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }
        info!(participant = %self.participant_id(), "Left maestro session");
        result
    }
}

impl Drop for AppBase {
    fn drop(&mut self) {
        if let Err(err) = self.leave_session() {
            debug!(error = %err, "Leaving session on drop failed");
        }
    }
}
