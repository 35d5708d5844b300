//! Adapter between a [`Partition`] and a host block-device mechanism.
//!
//! The mechanism itself (kernel NBD or similar) lives outside this crate; it
//! plugs in through [`DeviceHost`]/[`DeviceSession`]. What the core provides
//! is the contract it must drive (positional reads and writes of arbitrary
//! byte ranges), plus the path-selection and background-task plumbing, and
//! [`HostedHost`], an in-process stand-in used by the tests and by hosted
//! deployments without a kernel gateway.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crate::api::{Error, Result};
use crate::backend::Partition;

/// The minimal contract a host block-device mechanism drives. Short counts
/// mark end-of-device, as in the partition I/O paths.
pub trait BlockDevice: Send + 'static {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize>;
    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize>;
    fn flush(&mut self) -> Result<()>;
    fn size(&self) -> u64;
}

impl BlockDevice for Partition {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> { Partition::read_at(self, buf, off) }

    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> { Partition::write_at(self, buf, off) }

    fn flush(&mut self) -> Result<()> { self.close() }

    fn size(&self) -> u64 { self.data_size() }
}

/// A host's refusal to take a device path. The device rides along so the
/// gateway can offer it at the next path.
pub struct Refused {
    pub device: Box<dyn BlockDevice>,
    pub error: io::Error,
}

/// The external block-device mechanism.
pub trait DeviceHost: Send + Sync {
    fn connect(
        &self,
        path: &Path,
        device: Box<dyn BlockDevice>,
    ) -> std::result::Result<Box<dyn DeviceSession>, Refused>;
}

/// One attachment's event loop and teardown.
pub trait DeviceSession: Send + Sync {
    /// Blocking event loop; returns once the device is disconnected.
    fn run(&self) -> io::Result<()>;
    fn disconnect(&self) -> io::Result<()>;
}

/// How many device paths to probe before concluding the host is not taking
/// any. Matches the largest nbd minor count a kernel will realistically have.
const DEVICE_PROBE_LIMIT: u32 = 1024;

/// Owns the process-local device-path counter and spawns the per-attachment
/// background task. Paths are never reused within a process; a partition can
/// be re-attached (necessarily elsewhere) only after its previous attachment
/// is disconnected; ownership enforces this, since the partition lives inside
/// the attachment.
pub struct Gateway<H: DeviceHost> {
    host: H,
    counter: Mutex<u32>,
}

impl<H: DeviceHost> Gateway<H> {
    pub fn new(host: H) -> Gateway<H> { Gateway { host, counter: Mutex::new(0) } }

    pub fn host(&self) -> &H { &self.host }

    /// Walk `/dev/nbd{n}` until the host accepts, then hand the device over
    /// and run the session's event loop on a background thread. An event-loop
    /// failure ends that session only; it is logged, not fatal to the
    /// process.
    pub fn expose(&self, device: impl BlockDevice) -> Result<Attachment> {
        let mut device: Box<dyn BlockDevice> = Box::new(device);
        for _ in 0..DEVICE_PROBE_LIMIT {
            let path = {
                let mut counter = self.counter.lock().unwrap();
                let n = *counter;
                *counter += 1;
                PathBuf::from(format!("/dev/nbd{}", n))
            };
            match self.host.connect(&path, device) {
                Ok(session) => {
                    let session: Arc<dyn DeviceSession> = Arc::from(session);
                    let worker = {
                        let session = Arc::clone(&session);
                        let path = path.clone();
                        thread::Builder::new()
                            .name(format!("gateway-{}", path.display()))
                            .spawn(move || {
                                if let Err(e) = session.run() {
                                    log::error!("device {} event loop failed: {}", path.display(), e);
                                }
                            })?
                    };
                    log::info!("partition exposed at {}", path.display());
                    return Ok(Attachment { path, session, worker: Some(worker) });
                }
                Err(refused) => {
                    log::debug!("host refused {}: {}", path.display(), refused.error);
                    device = refused.device;
                }
            }
        }
        Err(Error::Io(io::Error::new(io::ErrorKind::AddrNotAvailable, "no device path accepted by the host")))
    }
}

/// A partition attached to a device path. Dropping it disconnects.
pub struct Attachment {
    path: PathBuf,
    session: Arc<dyn DeviceSession>,
    worker: Option<JoinHandle<()>>,
}

impl Attachment {
    pub fn device_path(&self) -> &Path { &self.path }

    /// Tear the attachment down and wait for its event loop to drain.
    pub fn disconnect(mut self) -> Result<()> {
        self.session.disconnect()?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.worker.take().is_some() {
            // detach the worker; joining here could block teardown paths
            let _ = self.session.disconnect();
        }
    }
}

struct HostedEntry {
    device: Mutex<Box<dyn BlockDevice>>,
    disconnected: Mutex<bool>,
    cv: Condvar,
}

type HostedRegistry = Arc<Mutex<HashMap<PathBuf, Arc<HostedEntry>>>>;

/// In-process device host: attached devices are served out of a table
/// instead of a kernel device node. The I/O entry points below play the role
/// of the kernel driver's request queue.
pub struct HostedHost {
    devices: HostedRegistry,
}

impl HostedHost {
    pub fn new() -> HostedHost { HostedHost { devices: Arc::new(Mutex::new(HashMap::new())) } }

    fn entry(&self, path: &Path) -> Result<Arc<HostedEntry>> {
        self.devices
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotFound, format!("no device at {}", path.display()))))
    }

    pub fn read(&self, path: &Path, buf: &mut [u8], off: u64) -> Result<usize> {
        self.entry(path)?.device.lock().unwrap().read_at(buf, off)
    }

    pub fn write(&self, path: &Path, buf: &[u8], off: u64) -> Result<usize> {
        self.entry(path)?.device.lock().unwrap().write_at(buf, off)
    }

    pub fn flush(&self, path: &Path) -> Result<()> { self.entry(path)?.device.lock().unwrap().flush() }

    pub fn size(&self, path: &Path) -> Result<u64> { Ok(self.entry(path)?.device.lock().unwrap().size()) }
}

impl Default for HostedHost {
    fn default() -> Self { Self::new() }
}

impl DeviceHost for HostedHost {
    fn connect(
        &self,
        path: &Path,
        device: Box<dyn BlockDevice>,
    ) -> std::result::Result<Box<dyn DeviceSession>, Refused> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(path) {
            return Err(Refused {
                device,
                error: io::Error::new(io::ErrorKind::AddrInUse, format!("{} is attached", path.display())),
            });
        }
        let entry = Arc::new(HostedEntry {
            device: Mutex::new(device),
            disconnected: Mutex::new(false),
            cv: Condvar::new(),
        });
        devices.insert(path.to_path_buf(), Arc::clone(&entry));
        Ok(Box::new(HostedSession {
            path: path.to_path_buf(),
            entry,
            registry: Arc::clone(&self.devices),
        }))
    }
}

struct HostedSession {
    path: PathBuf,
    entry: Arc<HostedEntry>,
    registry: HostedRegistry,
}

impl DeviceSession for HostedSession {
    fn run(&self) -> io::Result<()> {
        let mut disconnected = self.entry.disconnected.lock().unwrap();
        while !*disconnected {
            disconnected = self.entry.cv.wait(disconnected).unwrap();
        }
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        *self.entry.disconnected.lock().unwrap() = true;
        self.entry.cv.notify_all();
        self.registry.lock().unwrap().remove(&self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vec-backed device standing in for a partition.
    struct MemDevice {
        bytes: Vec<u8>,
        flushes: usize,
    }

    impl MemDevice {
        fn new(len: usize) -> MemDevice { MemDevice { bytes: vec![0; len], flushes: 0 } }
    }

    impl BlockDevice for MemDevice {
        fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
            if off as usize >= self.bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.bytes.len() - off as usize);
            buf[..n].copy_from_slice(&self.bytes[off as usize..off as usize + n]);
            Ok(n)
        }

        fn write_at(&mut self, buf: &[u8], off: u64) -> Result<usize> {
            if off as usize >= self.bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.bytes.len() - off as usize);
            self.bytes[off as usize..off as usize + n].copy_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }

        fn size(&self) -> u64 { self.bytes.len() as u64 }
    }

    #[test]
    fn expose_walks_device_paths() {
        let gateway = Gateway::new(HostedHost::new());
        let a = gateway.expose(MemDevice::new(64)).unwrap();
        let b = gateway.expose(MemDevice::new(64)).unwrap();
        assert_eq!(a.device_path(), Path::new("/dev/nbd0"));
        assert_eq!(b.device_path(), Path::new("/dev/nbd1"));

        a.disconnect().unwrap();
        // paths are never reused within a process
        let c = gateway.expose(MemDevice::new(64)).unwrap();
        assert_eq!(c.device_path(), Path::new("/dev/nbd2"));
        b.disconnect().unwrap();
        c.disconnect().unwrap();
    }

    #[test]
    fn host_serves_attached_device_io() {
        let gateway = Gateway::new(HostedHost::new());
        let attachment = gateway.expose(MemDevice::new(128)).unwrap();
        let path = attachment.device_path().to_path_buf();
        let host = gateway.host();

        assert_eq!(host.size(&path).unwrap(), 128);
        assert_eq!(host.write(&path, b"hello", 40).unwrap(), 5);
        let mut out = [0u8; 5];
        assert_eq!(host.read(&path, &mut out, 40).unwrap(), 5);
        assert_eq!(&out, b"hello");
        host.flush(&path).unwrap();

        attachment.disconnect().unwrap();
        assert!(host.read(&path, &mut out, 0).is_err(), "detached device must be gone");
    }

    #[test]
    fn hosted_host_refuses_an_occupied_path() {
        let host = HostedHost::new();
        let session = host.connect(Path::new("/dev/nbd0"), Box::new(MemDevice::new(8))).ok().unwrap();
        let refused = match host.connect(Path::new("/dev/nbd0"), Box::new(MemDevice::new(8))) {
            Err(r) => r,
            Ok(_) => panic!("occupied path must be refused"),
        };
        assert_eq!(refused.error.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(refused.device.size(), 8);

        session.disconnect().unwrap();
        assert!(host.connect(Path::new("/dev/nbd0"), refused.device).is_ok());
    }

    #[test]
    fn disconnect_unblocks_the_event_loop() {
        let host = HostedHost::new();
        let session = host.connect(Path::new("/dev/nbd9"), Box::new(MemDevice::new(8))).ok().unwrap();
        let session: Arc<dyn DeviceSession> = Arc::from(session);
        let runner = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.run())
        };
        session.disconnect().unwrap();
        runner.join().unwrap().unwrap();
    }
}
