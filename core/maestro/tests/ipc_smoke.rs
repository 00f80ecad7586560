use app_base::{AppBase, JoinOptions, NoopDelegate};
use maestro_protocol::{
    AppMode, AppRecordSnapshot, Message, Method, ParticipantId, RecordQuery, Request, Response,
    ServerFrame, ERROR_INVALID_JSON, ERROR_NOT_REGISTERED, PROTOCOL_VERSION,
};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct MaestroGuard {
    child: Child,
}

impl Drop for MaestroGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn runtime_dir(home: &Path) -> PathBuf {
    home.join(".maestro")
}

fn write_config(runtime: &Path) {
    std::fs::create_dir_all(runtime).expect("create runtime dir");
    let shell = env!("CARGO_BIN_EXE_maestro-headless");
    let config = format!(
        "shutdown_grace_secs = 5\n\n[shell]\nstatus_bar = \"{shell}\"\nosk = \"{shell}\"\nlauncher = \"{shell}\"\n"
    );
    std::fs::write(runtime.join("maestro.toml"), config).expect("write config");
}

fn maestro(home: &Path, flag: &str) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_maestro"));
    command
        .arg(flag)
        .env("HOME", home)
        .env("MAESTRO_RUNTIME_DIR", runtime_dir(home))
        .env_remove("MAESTRO_WORLD")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn start_session(home: &Path) -> MaestroGuard {
    write_config(&runtime_dir(home));
    let child = maestro(home, "--start")
        .spawn()
        .expect("failed to spawn maestro");
    MaestroGuard { child }
}

fn socket_path(home: &Path) -> PathBuf {
    runtime_dir(home).join("world-0.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for maestro socket at {}", path.display());
}

fn read_response(reader: &mut BufReader<UnixStream>) -> Response {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).expect("failed to read frame");
        assert!(n > 0, "maestro closed the connection");
        match serde_json::from_str::<ServerFrame>(line.trim_end()).expect("parse frame") {
            ServerFrame::Response(response) => return response,
            ServerFrame::Delivery(_) => continue,
        }
    }
}

fn send_raw(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to maestro socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream.write_all(payload).expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut BufReader::new(stream))
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut payload = serde_json::to_vec(&request).expect("failed to serialize request");
    payload.push(b'\n');
    send_raw(socket, &payload)
}

fn list_apps(socket: &Path) -> Vec<AppRecordSnapshot> {
    let response = send_request(
        socket,
        Request::new(Method::ListApps, Some("list".to_string()), None),
    );
    assert!(response.ok, "list_apps failed: {:?}", response.error);
    serde_json::from_value(response.data.expect("list_apps data")).expect("parse records")
}

fn mode_of(socket: &Path, id: ParticipantId) -> Option<AppMode> {
    list_apps(socket)
        .into_iter()
        .find(|record| record.participant_id == id)
        .map(|record| record.mode)
}

fn wait_until<F: FnMut() -> bool>(what: &str, timeout: Duration, mut condition: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("poll maestro") {
            return status;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("maestro did not exit within {:?}", timeout);
}

#[test]
fn maestro_session_launch_foreground_and_stop() {
    let home = TempDir::new().expect("failed to create temp HOME");
    let socket = socket_path(home.path());
    let mut guard = start_session(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    wait_until("shell to come up", Duration::from_secs(10), || {
        mode_of(&socket, ParticipantId::LAUNCHER) == Some(AppMode::Visible)
            && mode_of(&socket, ParticipantId::OSK) == Some(AppMode::Hidden)
    });
    let records = list_apps(&socket);
    assert_eq!(records.len(), 3);
    assert_eq!(
        records
            .iter()
            .map(|record| record.participant_id.0)
            .collect::<Vec<_>>(),
        vec![2, 3, 4]
    );

    let app = AppBase::join(
        JoinOptions::new("smoke-app").with_runtime_dir(runtime_dir(home.path())),
        NoopDelegate,
    )
    .expect("join session");
    assert_eq!(app.participant_id(), ParticipantId(5));
    app.call_maestro_and_wait(Message::ModeRequest {
        mode: AppMode::Visible,
        target: None,
    })
    .expect("request visible");

    let record = app
        .get_app_record(RecordQuery::Id(ParticipantId(5)))
        .expect("get record")
        .expect("record exists");
    assert_eq!(record.mode, AppMode::Visible);
    assert_eq!(record.title, "smoke-app");
    assert_eq!(mode_of(&socket, ParticipantId::LAUNCHER), Some(AppMode::Hidden));
    let visible = list_apps(&socket)
        .into_iter()
        .filter(|record| record.mode == AppMode::Visible)
        .count();
    assert_eq!(visible, 1);

    app.leave().expect("leave session");
    wait_until("launcher to return", Duration::from_secs(5), || {
        mode_of(&socket, ParticipantId::LAUNCHER) == Some(AppMode::Visible)
    });
    assert_eq!(list_apps(&socket).len(), 3);

    let stop = maestro(home.path(), "--stop")
        .status()
        .expect("run maestro --stop");
    assert!(stop.success(), "maestro --stop failed");

    let status = wait_for_exit(&mut guard.child, Duration::from_secs(15));
    assert!(status.success(), "maestro exited with {:?}", status);
    assert!(!socket.exists(), "socket left behind after shutdown");
}

#[test]
fn maestro_rejects_bad_frames_and_unregistered_clients() {
    let home = TempDir::new().expect("failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = start_session(home.path());
    wait_for_socket(&socket, Duration::from_secs(5));

    let malformed = send_raw(&socket, b"{not json\n");
    assert!(!malformed.ok);
    assert_eq!(
        malformed.error.expect("error").code,
        ERROR_INVALID_JSON.to_string()
    );

    let dispatch = send_request(
        &socket,
        Request::new(
            Method::Dispatch,
            Some("dispatch".to_string()),
            Some(json!({
                "channel": 0,
                "message": { "kind": "mode_request", "mode": "visible" }
            })),
        ),
    );
    assert!(!dispatch.ok);
    assert_eq!(
        dispatch.error.expect("error").code,
        ERROR_NOT_REGISTERED.to_string()
    );

    let mut stale = Request::new(Method::GetHealth, Some("health".to_string()), None);
    stale.protocol_version = PROTOCOL_VERSION + 1;
    let mismatch = send_request(&socket, stale);
    assert!(!mismatch.ok);

    let health = send_request(
        &socket,
        Request::new(Method::GetHealth, Some("health".to_string()), None),
    );
    assert!(health.ok, "health response was not ok");
    let status = health
        .data
        .as_ref()
        .and_then(|data| data.get("status"))
        .and_then(|value| value.as_str())
        .unwrap_or("missing");
    assert_eq!(status, "ok");
}
