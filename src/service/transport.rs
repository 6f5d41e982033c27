//! Service transport abstraction layer.
//! Supports TCP (for remote frontends) and an in-process pipe pair (for embedded use).

use crate::debugger::error::Error;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// Trait for service message transport.
/// Every message is a JSON document with `Content-Length` framing.
pub trait Transport: Send {
    /// Read a single message.
    fn read_message(&mut self) -> Result<Value, Error>;

    /// Write a single message.
    fn write_message(&mut self, message: &Value) -> Result<(), Error>;
}

fn read_framed(reader: &mut impl BufRead) -> Result<Value, Error> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse().map_err(|_| {
                Error::IO(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "bad Content-Length header",
                ))
            })?);
        }
    }

    let len = content_length.ok_or_else(|| {
        Error::IO(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing Content-Length header",
        ))
    })?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let msg: Value = serde_json::from_slice(&buf)
        .map_err(|e| Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(msg)
}

fn write_framed(writer: &mut impl Write, message: &Value) -> Result<(), Error> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// TCP based transport.
pub struct TcpTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }
}

impl Transport for TcpTransport {
    fn read_message(&mut self) -> Result<Value, Error> {
        read_framed(&mut self.reader)
    }

    fn write_message(&mut self, message: &Value) -> Result<(), Error> {
        write_framed(&mut self.stream, message)
    }
}

/// In-process duplex stream built from a pair of OS pipes.
pub struct PipeTransport {
    reader: BufReader<os_pipe::PipeReader>,
    writer: os_pipe::PipeWriter,
}

impl PipeTransport {
    /// Create a connected pair of duplex endpoints.
    pub fn pair() -> Result<(PipeTransport, PipeTransport), Error> {
        let (a_reader, b_writer) = os_pipe::pipe()?;
        let (b_reader, a_writer) = os_pipe::pipe()?;
        Ok((
            PipeTransport {
                reader: BufReader::new(a_reader),
                writer: a_writer,
            },
            PipeTransport {
                reader: BufReader::new(b_reader),
                writer: b_writer,
            },
        ))
    }
}

impl Transport for PipeTransport {
    fn read_message(&mut self) -> Result<Value, Error> {
        read_framed(&mut self.reader)
    }

    fn write_message(&mut self, message: &Value) -> Result<(), Error> {
        write_framed(&mut self.writer, message)
    }
}

/// Listener whose `accept` yields a single pre-connected bidirectional stream.
/// The other end of the stream is held by the in-process client.
pub struct PipeListener {
    endpoint: Option<PipeTransport>,
}

impl PipeListener {
    /// Create a listener and the client-side endpoint of its stream.
    pub fn bind() -> Result<(PipeListener, PipeTransport), Error> {
        let (server_side, client_side) = PipeTransport::pair()?;
        Ok((
            PipeListener {
                endpoint: Some(server_side),
            },
            client_side,
        ))
    }

    /// Yield the pre-connected stream. Subsequent calls fail: a pipe listener
    /// serves exactly one client.
    pub fn accept(&mut self) -> Result<PipeTransport, Error> {
        self.endpoint.take().ok_or_else(|| {
            Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "pipe listener already accepted its stream",
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pipe_transport_roundtrip() {
        let (mut server, mut client) = PipeTransport::pair().unwrap();

        let request = json!({"id": 1, "method": "state", "params": {}});
        client.write_message(&request).unwrap();
        let received = server.read_message().unwrap();
        assert_eq!(received, request);

        let response = json!({"id": 1, "result": {"running": false}});
        server.write_message(&response).unwrap();
        let received = client.read_message().unwrap();
        assert_eq!(received, response);
    }

    #[test]
    fn test_pipe_listener_single_accept() {
        let (mut listener, _client) = PipeListener::bind().unwrap();
        assert!(listener.accept().is_ok());
        assert!(listener.accept().is_err());
    }

    #[test]
    fn test_multiple_messages_in_flight() {
        let (mut server, mut client) = PipeTransport::pair().unwrap();

        for id in 0..10 {
            client
                .write_message(&json!({"id": id, "method": "m", "params": {}}))
                .unwrap();
        }
        for id in 0..10 {
            let msg = server.read_message().unwrap();
            assert_eq!(msg["id"], json!(id));
        }
    }
}
