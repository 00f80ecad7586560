//! One-shot control requests used by `--stop` and `--status`.

use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use maestro_protocol::{read_frame, write_frame, Method, Request, Response, ServerFrame};
use serde_json::Value;

const READ_TIMEOUT_SECS: u64 = 10;
const WRITE_TIMEOUT_SECS: u64 = 2;

pub fn send_request(
    socket: &Path,
    method: Method,
    params: Option<Value>,
) -> Result<Response, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to {}: {}", socket.display(), err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));

    let id = format!("{}-{}", method.as_str(), std::process::id());
    let request = Request::new(method, Some(id), params);
    write_frame(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;

    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<_, ServerFrame>(&mut reader) {
            Ok(Some(ServerFrame::Response(response))) => return Ok(response),
            // Control connections never register, so nothing should be
            // delivered here; ignore it if it is.
            Ok(Some(ServerFrame::Delivery(_))) => continue,
            Ok(None) => return Err("Coordinator closed the connection".to_string()),
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }
}
