//! One client connection: a reader thread that parses frames, and a
//! [`Link`] the bus delivers through.
//!
//! Reader threads never run coordinator logic. Requests are forwarded to the
//! coordinator worker; acknowledgements are matched to their pending
//! deliveries right here, so a worker blocked on `want_ack` can still be
//! answered.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use maestro_core::{Delivered, Subscriber};
use maestro_protocol::{
    parse_params, read_frame, write_frame, AckParams, Delivery, Envelope, ErrorInfo, Method,
    ParticipantId, Reaction, Request, Response, ServerFrame, ERROR_NOT_REGISTERED,
};
use tracing::{debug, warn};

use crate::server::Work;

const WRITE_TIMEOUT_SECS: u64 = 2;

pub struct Link {
    conn_id: u64,
    peer_pid: Option<u32>,
    writer: Mutex<UnixStream>,
    participant: OnceLock<ParticipantId>,
    pending: Mutex<HashMap<u64, Sender<Reaction>>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
}

impl Link {
    fn new(conn_id: u64, writer: UnixStream) -> Self {
        let _ = writer.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
        Self {
            conn_id,
            peer_pid: peer_pid(&writer),
            writer: Mutex::new(writer),
            participant: OnceLock::new(),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Pid of the connected process as reported by the kernel, if available.
    pub fn peer_pid(&self) -> Option<u32> {
        self.peer_pid
    }

    pub fn participant(&self) -> Option<ParticipantId> {
        self.participant.get().copied()
    }

    pub fn bind(&self, participant: ParticipantId) {
        if self.participant.set(participant).is_err() {
            warn!(conn = self.conn_id, "Connection already bound to a participant");
        }
    }

    pub fn require_participant(&self) -> Result<ParticipantId, ErrorInfo> {
        self.participant().ok_or_else(|| {
            ErrorInfo::new(ERROR_NOT_REGISTERED, "register before using the session")
        })
    }

    pub fn respond(&self, response: Response) -> io::Result<()> {
        self.send(&ServerFrame::Response(response))
    }

    fn send(&self, frame: &ServerFrame) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, frame)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Sender<Reaction>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, seq: u64, reaction: Reaction) -> bool {
        match self.pending().remove(&seq) {
            Some(waiter) => {
                let _ = waiter.send(reaction);
                true
            }
            None => false,
        }
    }

    /// Marks the link dead. Waiters on outstanding deliveries see their
    /// tickets disconnect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending().clear();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writer.shutdown(std::net::Shutdown::Both);
    }
}

impl Subscriber for Link {
    fn deliver(&self, envelope: &Envelope) -> Delivered {
        if self.closed.load(Ordering::SeqCst) {
            return Delivered::Lost;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending().insert(seq, tx);

        let frame = ServerFrame::Delivery(Delivery {
            seq,
            envelope: envelope.clone(),
        });
        if let Err(err) = self.send(&frame) {
            debug!(conn = self.conn_id, error = %err, "Delivery failed; closing link");
            self.pending().remove(&seq);
            self.close();
            return Delivered::Lost;
        }
        Delivered::Pending(rx)
    }
}

/// Serves one connection until the peer hangs up.
pub fn serve(stream: UnixStream, conn_id: u64, work: Sender<Work>) {
    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(conn = conn_id, error = %err, "Failed to clone connection");
            return;
        }
    };
    let link = Arc::new(Link::new(conn_id, writer));
    debug!(conn = conn_id, peer_pid = ?link.peer_pid(), "Connection opened");

    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, Request>(&mut reader) {
            Ok(Some(request)) if request.method == Method::Ack => handle_ack(&link, request),
            Ok(Some(request)) => {
                debug!(conn = conn_id, method = request.method.as_str(), id = ?request.id, "Request received");
                let forwarded = Work::Request {
                    link: Arc::clone(&link),
                    request,
                };
                if work.send(forwarded).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(conn = conn_id, error = %err, "Failed to read request");
                let _ = link.respond(Response::error_with_info(None, err.to_error_info()));
                if !err.is_recoverable() {
                    break;
                }
            }
        }
    }

    link.close();
    debug!(conn = conn_id, participant = ?link.participant().map(|id| id.0), "Connection closed");
    let _ = work.send(Work::Disconnected { link });
}

fn handle_ack(link: &Link, request: Request) {
    match parse_params::<AckParams>(request.params) {
        Ok(ack) => {
            if !link.resolve(ack.seq, ack.reaction) {
                debug!(conn = link.conn_id(), seq = ack.seq, "Ack for unknown or expired delivery");
            }
        }
        Err(err) => {
            warn!(conn = link.conn_id(), code = %err.code, "Malformed ack");
            if request.id.is_some() {
                let _ = link.respond(Response::error_with_info(request.id, err));
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    (rc == 0 && cred.pid > 0).then_some(cred.pid as u32)
}

#[cfg(not(target_os = "linux"))]
fn peer_pid(_stream: &UnixStream) -> Option<u32> {
    None
}
