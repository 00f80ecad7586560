//! IPC protocol types and validation for the Maestro session coordinator.
//!
//! This crate is shared by the coordinator and every participant to prevent
//! schema drift. The coordinator remains the authority on validation, but
//! clients reuse the same types to construct valid requests.
//!
//! Frames are single lines of JSON. Clients send [`Request`]s; the
//! coordinator answers with [`ServerFrame::Response`] and pushes bus traffic
//! as [`ServerFrame::Delivery`], which the client acknowledges with an
//! [`Method::Ack`] request carrying its [`Reaction`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{self, BufRead, Read, Write};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_BYTES: usize = 64 * 1024; // 64KB
pub const MAX_TITLE_CHARS: usize = 128;

pub const ERROR_PROTOCOL_MISMATCH: &str = "protocol_mismatch";
pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";
pub const ERROR_FRAME_TOO_LARGE: &str = "frame_too_large";
pub const ERROR_NOT_REGISTERED: &str = "not_registered";
pub const ERROR_ALREADY_REGISTERED: &str = "already_registered";
pub const ERROR_FORBIDDEN_CHANNEL: &str = "forbidden_channel";
pub const ERROR_FORBIDDEN: &str = "forbidden";
pub const ERROR_REGISTRY_FULL: &str = "registry_full";
pub const ERROR_POOL_EXHAUSTED: &str = "pool_exhausted";
pub const ERROR_NOT_FOUND: &str = "not_found";
pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_REENTRANT_CALL: &str = "reentrant_call";

// ═══════════════════════════════════════════════════════════════════════════════
// Identities and addressing
// ═══════════════════════════════════════════════════════════════════════════════

/// Bus identity of a participant, assigned by the coordinator at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub const MAESTRO: ParticipantId = ParticipantId(1);
    pub const STATUS_BAR: ParticipantId = ParticipantId(2);
    pub const OSK: ParticipantId = ParticipantId(3);
    pub const LAUNCHER: ParticipantId = ParticipantId(4);

    /// Lowest id handed out to a registering process.
    pub const FIRST_ASSIGNABLE: ParticipantId = ParticipantId::STATUS_BAR;

    pub fn role(self) -> Role {
        match self {
            ParticipantId::MAESTRO => Role::Maestro,
            ParticipantId::STATUS_BAR => Role::StatusBar,
            ParticipantId::OSK => Role::Osk,
            ParticipantId::LAUNCHER => Role::Launcher,
            _ => Role::Application,
        }
    }

    pub fn private_channel(self) -> Channel {
        Channel(self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressable recipient group on the message bus.
///
/// Channel 0 reaches only the coordinator, channel 1 every attached
/// participant, and channel N only the participant whose id is N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(pub u32);

impl Channel {
    pub const COORDINATOR: Channel = Channel(0);
    pub const BROADCAST: Channel = Channel(1);

    pub fn private(id: ParticipantId) -> Channel {
        id.private_channel()
    }

    pub fn is_reserved(self) -> bool {
        self == Channel::COORDINATOR || self == Channel::BROADCAST
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a participant plays in the shell, derived from its assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Maestro,
    StatusBar,
    Osk,
    Launcher,
    Application,
}

impl Role {
    /// Overlays are drawn on top of the foreground app and never own it.
    pub fn is_overlay(self) -> bool {
        matches!(self, Role::StatusBar | Role::Osk)
    }

    pub fn can_hold_foreground(self) -> bool {
        matches!(self, Role::Launcher | Role::Application)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMode {
    None,
    Initialising,
    Ready,
    Visible,
    Hidden,
    Background,
    Terminated,
}

impl AppMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppMode::None => "none",
            AppMode::Initialising => "initialising",
            AppMode::Ready => "ready",
            AppMode::Visible => "visible",
            AppMode::Hidden => "hidden",
            AppMode::Background => "background",
            AppMode::Terminated => "terminated",
        }
    }

    /// Capitalised form used by `maestro --status`.
    pub fn label(&self) -> &'static str {
        match self {
            AppMode::None => "None",
            AppMode::Initialising => "Initialising",
            AppMode::Ready => "Ready",
            AppMode::Visible => "Visible",
            AppMode::Hidden => "Hidden",
            AppMode::Background => "Background",
            AppMode::Terminated => "Terminated",
        }
    }

    /// Whether a record in `self` may move to `next`.
    ///
    /// Staying in the same mode is not an advance; callers treat it as a no-op.
    pub fn can_advance_to(&self, next: AppMode) -> bool {
        if *self == next {
            return false;
        }
        match (*self, next) {
            (_, AppMode::None) => false,
            (AppMode::Terminated, _) => false,
            (AppMode::Background, next) => next == AppMode::Terminated,
            (AppMode::None, _) => true,
            (AppMode::Initialising, _) => true,
            (_, AppMode::Initialising) => false,
            (AppMode::Ready, _) => true,
            (AppMode::Visible | AppMode::Hidden, AppMode::Ready) => false,
            (AppMode::Visible | AppMode::Hidden, _) => true,
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bus messages
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordination message carried on the bus.
///
/// Targets are explicit and optional; `None` means "the sender itself" for
/// requests and "everyone on the channel" for coordinator notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Message {
    SwitchMode {
        mode: AppMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    ModeRequest {
        mode: AppMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    Notification {
        mode: AppMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<ParticipantId>,
    },
    OskEvent {
        mode: AppMode,
    },
}

impl Message {
    pub fn mode(&self) -> AppMode {
        match self {
            Message::SwitchMode { mode, .. }
            | Message::ModeRequest { mode, .. }
            | Message::Notification { mode, .. }
            | Message::OskEvent { mode } => *mode,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::SwitchMode { .. } => "switch_mode",
            Message::ModeRequest { .. } => "mode_request",
            Message::Notification { .. } => "notification",
            Message::OskEvent { .. } => "osk_event",
        }
    }
}

/// A message as delivered: the sender is stamped by the coordinator from the
/// connection identity, never taken from client input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: ParticipantId,
    pub channel: Channel,
    pub message: Message,
}

/// What a recipient tells the bus after handling a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    /// Handled; keep the attachment.
    Keep,
    /// Message rejected; the attachment stays.
    Drop,
    /// Tear down the receiving attachment.
    Remove,
}

/// Summary of one dispatch, returned to callers that asked for completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub acknowledged: usize,
    pub dropped: usize,
    pub removed: usize,
    pub timed_out: usize,
}

impl DispatchReport {
    pub fn rejected(&self) -> bool {
        self.dropped > 0 || self.removed > 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Requests and responses
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    Register,
    Attach,
    Detach,
    Dispatch,
    Ack,
    SetTitle,
    GetRecord,
    ListApps,
    GetSession,
    SetOskText,
    SetStatusBarHeight,
    GetHealth,
    Shutdown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "register",
            Method::Attach => "attach",
            Method::Detach => "detach",
            Method::Dispatch => "dispatch",
            Method::Ack => "ack",
            Method::SetTitle => "set_title",
            Method::GetRecord => "get_record",
            Method::ListApps => "list_apps",
            Method::GetSession => "get_session",
            Method::SetOskText => "set_osk_text",
            Method::SetStatusBarHeight => "set_status_bar_height",
            Method::GetHealth => "get_health",
            Method::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// A delivery pushed to a participant; answered with an `ack` carrying `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub seq: u64,
    pub envelope: Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response(Response),
    Delivery(Delivery),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Method parameters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterParams {
    pub title: String,
    pub process_path: String,
    /// Declared pid; only used where the transport cannot report the peer.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl RegisterParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_title(&self.title)?;
        if self.process_path.trim().is_empty() {
            return Err(ErrorInfo::new(
                ERROR_INVALID_PARAMS,
                "process_path is required",
            ));
        }
        if let Some(pid) = self.pid {
            if pid == 0 || i32::try_from(pid).is_err() {
                return Err(ErrorInfo::new(
                    ERROR_INVALID_PARAMS,
                    format!("pid {} is not a valid process id", pid),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelParams {
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchParams {
    pub channel: Channel,
    pub message: Message,
    #[serde(default)]
    pub want_ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckParams {
    pub seq: u64,
    pub reaction: Reaction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetTitleParams {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetOskTextParams {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetStatusBarHeightParams {
    pub height: u32,
}

/// Registry lookup key; callers find records either by bus id or by the
/// path the process was launched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum RecordQuery {
    Id(ParticipantId),
    Path(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Response payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Returned by `register`: the slave's view of the arena it joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub world_index: u32,
    pub arena: String,
    pub status_bar_height: u32,
    pub osk_text_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecordSnapshot {
    pub index: usize,
    pub participant_id: ParticipantId,
    pub role: Role,
    pub pid: u32,
    pub title: String,
    pub process_path: String,
    pub mode: AppMode,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub arena: String,
    pub world_index: u32,
    pub status_bar_height: u32,
    pub osk_text: String,
    pub osk_text_capacity: usize,
    #[serde(default)]
    pub foreground: Option<ParticipantId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params =
        params.ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "params are required"))?;
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("params are invalid: {}", err),
        )
    })
}

pub fn parse_register(params: Option<Value>) -> Result<RegisterParams, ErrorInfo> {
    let register: RegisterParams = parse_params(params)?;
    register.validate()?;
    Ok(register)
}

pub fn parse_set_title(params: Option<Value>) -> Result<SetTitleParams, ErrorInfo> {
    let set_title: SetTitleParams = parse_params(params)?;
    validate_title(&set_title.title)?;
    Ok(set_title)
}

pub fn validate_title(title: &str) -> Result<(), ErrorInfo> {
    if title.trim().is_empty() {
        return Err(ErrorInfo::new(ERROR_INVALID_PARAMS, "title is required"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("title must be {} characters or fewer", MAX_TITLE_CHARS),
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Framing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    TooLarge,
    Malformed(serde_json::Error),
}

impl FrameError {
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            FrameError::Io(err) => {
                ErrorInfo::new("read_error", format!("failed to read frame: {}", err))
            }
            FrameError::TooLarge => {
                ErrorInfo::new(ERROR_FRAME_TOO_LARGE, "frame exceeded maximum size")
            }
            FrameError::Malformed(err) => ErrorInfo::new(
                ERROR_INVALID_JSON,
                format!("frame was not valid JSON: {}", err),
            ),
        }
    }

    /// Whether the stream can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_error_info())
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Reads the next newline-terminated frame, skipping blank lines.
///
/// Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: BufRead,
    T: DeserializeOwned,
{
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let limit = (MAX_FRAME_BYTES + 1) as u64;
        let read = reader.by_ref().take(limit).read_until(b'\n', &mut buffer)?;
        if read == 0 {
            return Ok(None);
        }
        if buffer.last() != Some(&b'\n') && buffer.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge);
        }
        if buffer.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return serde_json::from_slice(&buffer)
            .map(Some)
            .map_err(FrameError::Malformed);
    }
}

/// Writes one frame as a single line. The whole line goes out in one
/// `write_all` so concurrent writers behind a lock never interleave.
pub fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(frame)?;
    payload.push(b'\n');
    writer.write_all(&payload)?;
    writer.flush()
}
