//! Unix-domain-socket control service (§4.5): `Ping`, `ScanPackages`, `MkdirAll`. All three
//! operations execute synchronously under the Namespace Model's own writer lock (via
//! [`crate::namespace::Namespace`] and [`crate::scanner`]) — this module adds no locking of its
//! own, just the RPC framing and dispatch.
//!
//! **Wire framing.** A 4-byte little-endian length prefix followed by a `serde_json`-encoded
//! request/response envelope (`{"op":"ping"}`, `{"op":"mkdir_all","name":"..."}`,
//! `{"ok":true}` / `{"ok":false,"error":"..."}`). JSON over a length-prefixed frame keeps this
//! narrow, low-throughput administrative channel trivially inspectable with `socat`/`nc` during
//! operations, at negligible cost given the call volume.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::frontend::Frontend;
use crate::namespace::Namespace;
use crate::scanner;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Ping,
    ScanPackages,
    MkdirAll { name: String },
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn err(e: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(e.to_string()),
        }
    }
}

/// Everything the control service needs to re-run a scan the same way startup did.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub repo: PathBuf,
    pub exchange_dirs: Vec<PathBuf>,
    pub libc_pkg: String,
    pub libc_loader_path: String,
}

/// The control service: holds the shared [`Namespace`] and [`Frontend`] (the same instances
/// the mount itself serves out of, via `Frontend`'s `Arc`-backed fields) plus enough
/// configuration to repeat a scan on demand.
pub struct ControlService {
    namespace: Arc<Namespace>,
    frontend: Frontend,
    config: ScanConfig,
}

impl ControlService {
    pub fn new(namespace: Arc<Namespace>, frontend: Frontend, config: ScanConfig) -> Self {
        Self {
            namespace,
            frontend,
            config,
        }
    }

    /// Binds `socket_path` (removing any stale socket left over from a previous run) and serves
    /// connections until the process exits or the listener errors out. Each connection runs on
    /// its own thread; since every operation takes the Namespace Model's writer lock, concurrent
    /// RPCs are safe but serialize on that lock rather than running in parallel.
    pub fn serve(self: Arc<Self>, socket_path: &Path) -> Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "control service listening");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            thread::spawn(move || {
                if let Err(e) = this.handle_connection(stream) {
                    warn!(error = %e, "control connection error");
                }
            });
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let request = match read_frame(&mut stream)? {
                Some(bytes) => bytes,
                None => return Ok(()),
            };
            let response = match serde_json::from_slice::<Request>(&request) {
                Ok(req) => self.dispatch(req),
                Err(e) => Response::err(format!("malformed request: {e}")),
            };
            let encoded = serde_json::to_vec(&response)
                .map_err(|e| Error::Control(format!("encoding response: {e}")))?;
            write_frame(&mut stream, &encoded)?;
        }
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::ok(),
            Request::ScanPackages => match self.rescan() {
                Ok(n) => {
                    info!(new_packages = n, "ScanPackages complete");
                    Response::ok()
                }
                Err(e) => Response::err(e),
            },
            Request::MkdirAll { name } => match self.namespace.control_mkdir(&name) {
                Ok(()) => Response::ok(),
                Err(e) => Response::err(e),
            },
        }
    }

    fn rescan(&self) -> Result<usize> {
        let scanned = scanner::scan_all(
            &self.namespace,
            &self.frontend,
            &self.config.repo,
            &self.config.exchange_dirs,
            None,
        )?;
        crate::libc_loader::maybe_install(
            &self.namespace,
            &self.config.libc_pkg,
            &self.config.libc_loader_path,
            &self.config.exchange_dirs,
        )?;
        Ok(scanned)
    }
}

/// A minimal synchronous client for the control protocol: sends one JSON request (e.g.
/// `{"op":"ping"}`) and returns the raw JSON response text. Used both by this core's own
/// `SIGHUP` handling (issuing the identical `ScanPackages` request an external CLI client
/// would, per §5 "both execute the same write-side routines as `ScanPackages`") and by
/// integration tests driving the control socket end-to-end.
pub fn request(socket_path: &Path, request: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path)?;
    write_frame(&mut stream, request.as_bytes())?;
    let response = read_frame(&mut stream)?
        .ok_or_else(|| Error::Control("connection closed before a response was received".into()))?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame(stream: &mut UnixStream, data: &[u8]) -> Result<()> {
    let len = (data.len() as u32).to_le_bytes();
    stream.write_all(&len)?;
    stream.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_request_variant() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"op":"ping"}"#).unwrap(),
            Request::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"op":"scan_packages"}"#).unwrap(),
            Request::ScanPackages
        ));
        match serde_json::from_str::<Request>(r#"{"op":"mkdir_all","name":"bin2"}"#).unwrap() {
            Request::MkdirAll { name } => assert_eq!(name, "bin2"),
            _ => panic!("expected MkdirAll"),
        }
    }

    #[test]
    fn response_encodes_ok_and_error_shapes() {
        let ok = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(ok, r#"{"ok":true}"#);
        let err = serde_json::to_string(&Response::err("boom")).unwrap();
        assert_eq!(err, r#"{"ok":false,"error":"boom"}"#);
    }

    #[test]
    fn frame_round_trips_over_a_socket_pair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_frame(&mut a, b"hello").unwrap();
        let received = read_frame(&mut b).unwrap().unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn read_frame_reports_clean_close_as_none() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(read_frame(&mut b).unwrap().is_none());
    }
}
