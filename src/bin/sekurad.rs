//! Daemon: pools open disks and exposes partitions on request, so that
//! multiple frontends share one file handle and one used-slot set per disk.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use sekura::gateway::{Attachment, Gateway, HostedHost};
use sekura::protocol::{self, AddRequest, AddResponse, DeleteRequest, DeleteResponse, Request, Response};
use sekura::{Disk, Error};

struct Daemon {
    disks: Mutex<HashMap<PathBuf, Disk>>,
    gateway: Gateway<HostedHost>,
    attachments: Mutex<Vec<Attachment>>,
}

impl Daemon {
    fn new() -> Daemon {
        Daemon {
            disks: Mutex::new(HashMap::new()),
            gateway: Gateway::new(HostedHost::new()),
            attachments: Mutex::new(Vec::new()),
        }
    }

    /// One `Disk` per path for the life of the daemon; partitions opened on
    /// the same disk must share its used-slot set or they would allocate over
    /// each other.
    fn disk_for(&self, path: &str) -> sekura::Result<Disk> {
        let path = PathBuf::from(path);
        let mut disks = self.disks.lock().unwrap();
        if let Some(disk) = disks.get(&path) {
            return Ok(disk.clone());
        }
        let disk = Disk::open(&path)?;
        disks.insert(path, disk.clone());
        Ok(disk)
    }

    fn add(&self, request: &AddRequest) -> AddResponse {
        match self.try_add(request) {
            Ok(device_path) => AddResponse { error: String::new(), device_path },
            Err(e) => AddResponse { error: e.to_string(), device_path: String::new() },
        }
    }

    fn try_add(&self, request: &AddRequest) -> sekura::Result<String> {
        let disk = self.disk_for(&request.disk_path)?;
        let partition = disk.open_partition(&request.passphrase)?;
        let attachment = self.gateway.expose(partition)?;
        let device_path = attachment.device_path().display().to_string();
        self.attachments.lock().unwrap().push(attachment);
        Ok(device_path)
    }

    fn delete(&self, request: &DeleteRequest) -> DeleteResponse {
        match self.try_delete(request) {
            Ok(()) => DeleteResponse { error: String::new() },
            Err(e) => DeleteResponse { error: e.to_string() },
        }
    }

    fn try_delete(&self, request: &DeleteRequest) -> sekura::Result<()> {
        let disk = self.disk_for(&request.disk_path)?;
        match disk.open_partition(&request.passphrase) {
            Ok(partition) => partition.delete(),
            Err(Error::InvalidBlockStructure(unordered)) => {
                log::warn!("deleting a partition whose chain no longer reconstructs");
                unordered.delete()
            }
            Err(e) => Err(e),
        }
    }
}

/// One thread per client; exactly one response per request, connection
/// reusable until the client hangs up.
fn serve(daemon: Arc<Daemon>, stream: UnixStream) {
    let result = (|| -> std::io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        while let Some(request) = protocol::receive::<Request, _>(&mut reader)? {
            let response = match request {
                Request::Add(r) => Response::Add(daemon.add(&r)),
                Request::Delete(r) => Response::Delete(daemon.delete(&r)),
            };
            protocol::send(&mut writer, &response)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        log::debug!("client connection ended: {}", e);
    }
}

/// Removes the socket and PID file however `main` unwinds.
struct RuntimeFiles;

impl Drop for RuntimeFiles {
    fn drop(&mut self) {
        let _ = fs::remove_file(protocol::SOCKET_PATH);
        let _ = fs::remove_file(protocol::PID_PATH);
    }
}

fn main() -> Result<()> {
    env_logger::init();

    if Path::new(protocol::PID_PATH).exists() {
        bail!("pid file {} already exists; is sekurad running?", protocol::PID_PATH);
    }
    fs::write(protocol::PID_PATH, std::process::id().to_string())
        .with_context(|| format!("writing {}", protocol::PID_PATH))?;
    let _cleanup = RuntimeFiles;

    let listener = UnixListener::bind(protocol::SOCKET_PATH)
        .with_context(|| format!("binding {}", protocol::SOCKET_PATH))?;
    listener.set_nonblocking(true)?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&term))?;

    let daemon = Arc::new(Daemon::new());
    log::info!("listening on {}", protocol::SOCKET_PATH);

    while !term.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                let daemon = Arc::clone(&daemon);
                thread::Builder::new().name("client".into()).spawn(move || serve(daemon, stream))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("accept failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    // in-flight client operations complete on their own threads; we only
    // stop taking new connections
    log::info!("shutting down");
    Ok(())
}
