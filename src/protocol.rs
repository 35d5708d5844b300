//! Wire envelope for the daemon socket.
//!
//! Self-describing tagged messages, one JSON object per line, exactly one
//! response per request; a connection may carry any number of requests. The
//! tag is the discriminator and decoding is exhaustive: an unknown tag is a
//! decode error, never a fall-through.

use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const SOCKET_PATH: &str = "/run/sekura.sock";
pub const PID_PATH: &str = "/run/sekura.pid";

/// Client → daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data")]
pub enum Request {
    Add(AddRequest),
    Delete(DeleteRequest),
}

/// Open the partition and expose it as a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub disk_path: String,
    pub passphrase: String,
}

/// Destroy the partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub disk_path: String,
    pub passphrase: String,
}

/// Daemon → client. `error` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data")]
pub enum Response {
    Add(AddResponse),
    Delete(DeleteResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResponse {
    pub error: String,
    pub device_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub error: String,
}

pub fn send<T: Serialize, W: Write>(writer: &mut W, message: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// `None` on a clean EOF between messages.
pub fn receive<T: DeserializeOwned, R: BufRead>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trip() {
        let requests = vec![
            Request::Add(AddRequest { disk_path: "/tmp/disk".into(), passphrase: "hunter2".into() }),
            Request::Delete(DeleteRequest { disk_path: "/tmp/disk".into(), passphrase: "hunter2".into() }),
        ];
        let mut wire = Vec::new();
        for request in &requests {
            send(&mut wire, request).unwrap();
        }

        let mut reader = Cursor::new(wire);
        for request in &requests {
            let decoded: Request = receive(&mut reader).unwrap().unwrap();
            assert_eq!(&decoded, request);
        }
        assert!(receive::<Request, _>(&mut reader).unwrap().is_none(), "clean EOF after the last message");
    }

    #[test]
    fn response_round_trip() {
        let mut wire = Vec::new();
        send(&mut wire, &Response::Add(AddResponse { error: String::new(), device_path: "/dev/nbd0".into() }))
            .unwrap();
        send(&mut wire, &Response::Delete(DeleteResponse { error: "no partition with that passphrase".into() }))
            .unwrap();

        let mut reader = Cursor::new(wire);
        match receive::<Response, _>(&mut reader).unwrap().unwrap() {
            Response::Add(r) => {
                assert!(r.error.is_empty());
                assert_eq!(r.device_path, "/dev/nbd0");
            }
            other => panic!("wrong variant: {:?}", other),
        }
        match receive::<Response, _>(&mut reader).unwrap().unwrap() {
            Response::Delete(r) => assert_eq!(r.error, "no partition with that passphrase"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut reader = Cursor::new(b"{\"id\":\"Format\",\"data\":{}}\n".to_vec());
        let err = receive::<Request, _>(&mut reader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
