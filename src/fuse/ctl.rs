//! The overlay control socket.
//!
//! A Unix domain socket speaking one JSON request per line, answered by
//! one JSON response per line. Its path is what the overlay's `ctl`
//! symlink points at, so any process that can `readlink` the mount can
//! find it. Three operations exist: `Ping`, `MkdirAll` and
//! `ScanPackages`.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::fuse::Overlay;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CtlRequest {
    Ping,
    MkdirAll { dir: String },
    ScanPackages,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CtlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bind the control socket and serve requests on a background thread.
pub fn serve(overlay: Arc<Overlay>) -> Result<(), Error> {
    let path = overlay.ctl_path().to_path_buf();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // a stale socket from a previous instance would fail the bind
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    debug!(path = %path.display(), "control socket listening");

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let overlay = Arc::clone(&overlay);
                    std::thread::spawn(move || {
                        if let Err(e) = handle(&overlay, stream) {
                            warn!(error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                    break;
                }
            }
        }
    });
    Ok(())
}

fn handle(overlay: &Overlay, stream: UnixStream) -> Result<(), Error> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CtlRequest>(&line) {
            Ok(CtlRequest::Ping) => CtlResponse { ok: true, error: None },
            Ok(CtlRequest::MkdirAll { dir }) => {
                overlay.mkdir_all(&dir);
                CtlResponse { ok: true, error: None }
            }
            Ok(CtlRequest::ScanPackages) => match overlay.scan_packages() {
                Ok(()) => CtlResponse { ok: true, error: None },
                Err(e) => CtlResponse { ok: false, error: Some(e.to_string()) },
            },
            Err(e) => CtlResponse { ok: false, error: Some(format!("bad request: {e}")) },
        };
        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
    }
}

/// Issue one request against a control socket and return its response.
pub fn call(socket: &Path, request: &CtlRequest) -> Result<CtlResponse, Error> {
    let stream = UnixStream::connect(socket)?;
    let mut writer = stream.try_clone()?;
    serde_json::to_writer(&mut writer, request)?;
    writer.write_all(b"\n")?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let response: CtlResponse = serde_json::from_str(&line)
        .map_err(|e| Error::StdIo(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(response)
}

pub fn ping(socket: &Path) -> Result<(), Error> {
    let resp = call(socket, &CtlRequest::Ping)?;
    if !resp.ok {
        return Err(Error::StdIo(std::io::Error::other(
            resp.error.unwrap_or_else(|| "ping failed".into()),
        )));
    }
    Ok(())
}

pub fn mkdir_all(socket: &Path, dir: &str) -> Result<(), Error> {
    let resp = call(socket, &CtlRequest::MkdirAll { dir: dir.to_string() })?;
    if !resp.ok {
        return Err(Error::StdIo(std::io::Error::other(
            resp.error.unwrap_or_else(|| "mkdir failed".into()),
        )));
    }
    Ok(())
}

pub fn scan_packages(socket: &Path) -> Result<(), Error> {
    let resp = call(socket, &CtlRequest::ScanPackages)?;
    if !resp.ok {
        return Err(Error::StdIo(std::io::Error::other(
            resp.error.unwrap_or_else(|| "scan failed".into()),
        )));
    }
    Ok(())
}

/// The control socket of the overlay mounted at `mountpoint`, found by
/// reading the `ctl` symlink. This never has side effects on the mount.
pub fn socket_for_mountpoint(mountpoint: &Path) -> Result<std::path::PathBuf, Error> {
    Ok(std::fs::read_link(mountpoint.join("ctl"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req: CtlRequest =
            serde_json::from_str(r#"{"op":"mkdir_all","dir":"hello-amd64-1-1"}"#).unwrap();
        match req {
            CtlRequest::MkdirAll { dir } => assert_eq!(dir, "hello-amd64-1-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(serde_json::to_string(&CtlRequest::Ping).unwrap(), r#"{"op":"ping"}"#);
    }
}
