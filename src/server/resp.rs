//! RESP front end: command parsing, reply serialization, TCP server.
//!
//! The parser is command-oriented. A server only ever receives arrays of
//! bulk strings (or whitespace-separated inline commands), so that is all
//! it accepts; replies use the full RESP vocabulary. Parsing is
//! incremental: `Ok(None)` means the buffer holds an incomplete command
//! and the caller should read more bytes.
//!
//! `PING` and `QUIT` are answered here and never reach the dispatcher.

use crate::controller::Controller;
use crate::message::{Request, Response, Status};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

/// Largest accepted bulk string, matching the usual Redis limit.
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8 in inline command")]
    InvalidUtf8,

    #[error("bulk string too large: {size} bytes (max {max})")]
    BulkTooLarge { size: usize, max: usize },

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Tries to parse one complete command from `buf`.
///
/// Returns the command arguments (name included) and the number of bytes
/// consumed, or `None` when the buffer ends mid-command.
pub fn parse_command(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == b'*' {
        parse_array_command(buf)
    } else {
        parse_inline_command(buf)
    }
}

fn parse_array_command(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, ParseError> {
    let Some(count_end) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let count = parse_int(&buf[1..1 + count_end])?;
    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }

    let mut consumed = 1 + count_end + 2;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let rest = &buf[consumed.min(buf.len())..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest[0] != b'$' {
            return Err(ParseError::Protocol(format!(
                "expected a bulk string, got prefix {:#04x}",
                rest[0]
            )));
        }

        let Some(len_end) = find_crlf(&rest[1..]) else {
            return Ok(None);
        };
        let len = parse_int(&rest[1..1 + len_end])?;
        if len < 0 {
            return Err(ParseError::InvalidBulkLength(len));
        }
        let len = len as usize;
        if len > MAX_BULK_SIZE {
            return Err(ParseError::BulkTooLarge {
                size: len,
                max: MAX_BULK_SIZE,
            });
        }

        let data_start = 1 + len_end + 2;
        let total = data_start + len + 2;
        if rest.len() < total {
            return Ok(None);
        }
        if &rest[data_start + len..total] != b"\r\n" {
            return Err(ParseError::Protocol(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        args.push(Bytes::copy_from_slice(&rest[data_start..data_start + len]));
        consumed += total;
    }

    Ok(Some((args, consumed)))
}

/// Inline commands: a whitespace-separated line, the way redis-cli sends
/// hand-typed input. An empty line parses to an empty argument list and
/// is ignored by the connection loop.
fn parse_inline_command(buf: &[u8]) -> Result<Option<(Vec<Bytes>, usize)>, ParseError> {
    let Some(line_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| ParseError::InvalidUtf8)?;
    let args = line
        .split_whitespace()
        .map(|word| Bytes::copy_from_slice(word.as_bytes()))
        .collect();
    Ok(Some((args, line_end + 2)))
}

/// Serializes a reply into `buf` according to the RESP mapping: Ok is a
/// simple string, NotFound a nil bulk, TypeMismatch the WRONGTYPE error
/// line, every other failure an ERR line.
pub fn encode_response(response: &Response, buf: &mut Vec<u8>) {
    match response {
        Response::Status { status, message } => match status {
            Status::Ok => buf.extend_from_slice(b"+OK\r\n"),
            Status::NotFound => buf.extend_from_slice(b"$-1\r\n"),
            Status::TypeMismatch => buf.extend_from_slice(
                b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
            ),
            Status::Error | Status::InvalidCommand | Status::InvalidArguments => {
                buf.extend_from_slice(b"-ERR ");
                buf.extend_from_slice(message.replace(['\r', '\n'], " ").as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        },
        Response::Int(n) => {
            buf.push(b':');
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Response::Str(data) => encode_bulk(data, buf),
        Response::StrSlice(items) => {
            buf.push(b'*');
            buf.extend_from_slice(items.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                encode_bulk(item, buf);
            }
        }
    }
}

fn encode_bulk(data: &[u8], buf: &mut Vec<u8>) {
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_int(digits: &[u8]) -> Result<i64, ParseError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(digits).into_owned()))
}

/// Accepts connections until the shutdown channel fires, spawning one
/// task per client.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<Controller>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let controller = Arc::clone(&controller);
                        tokio::spawn(async move {
                            Connection::new(stream, addr, controller).run().await;
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => return Ok(()),
        }
    }
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("client disconnected")]
    Disconnected,

    #[error("connection closed mid-command")]
    UnexpectedEof,
}

/// One client connection: buffer, parse loop, reply writer.
struct Connection {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    controller: Arc<Controller>,
}

impl Connection {
    fn new(stream: TcpStream, addr: SocketAddr, controller: Arc<Controller>) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            controller,
        }
    }

    async fn run(mut self) {
        debug!(client = %self.addr, "client connected");
        match self.main_loop().await {
            Ok(()) | Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "client disconnected")
            }
            Err(ConnectionError::Io(ref e))
                if e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let mut out = Vec::new();
        loop {
            while let Some((args, consumed)) = parse_command(&self.buffer)? {
                self.buffer.advance(consumed);
                if args.is_empty() {
                    continue;
                }

                let cmd = String::from_utf8_lossy(&args[0]).to_uppercase();
                match cmd.as_str() {
                    "PING" => {
                        self.write_all(b"+PONG\r\n").await?;
                        continue;
                    }
                    "QUIT" => {
                        self.write_all(b"+OK\r\n").await?;
                        return Ok(());
                    }
                    _ => {}
                }

                let mut request = Request::new(&cmd, args[1..].to_vec());
                // More buffered commands behind this one means the client
                // pipelined and is not waiting on this individual reply.
                request.unreliable = !self.buffer.is_empty();
                trace!(client = %self.addr, cmd = %request.cmd, "handling request");

                let response = self.controller.handle(request);
                out.clear();
                encode_response(&response, &mut out);
                self.write_all(&out).await?;
            }

            self.read_more().await?;
        }
    }

    async fn read_more(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::Disconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }
        trace!(client = %self.addr, bytes = n, "read data");
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn parse_array_command_round_trip() {
        let input = b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$6\r\nradish\r\n";
        let (args, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            args,
            vec![Bytes::from("SET"), Bytes::from("name"), Bytes::from("radish")]
        );
    }

    #[test]
    fn parse_incomplete_commands() {
        assert_eq!(parse_command(b"").unwrap(), None);
        assert_eq!(parse_command(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(parse_command(b"*1\r\n$4\r\nPI").unwrap(), None);
        assert_eq!(parse_command(b"GET name").unwrap(), None);
    }

    #[test]
    fn parse_binary_safe_bulk() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhe\x00lo\r\n";
        let (args, _) = parse_command(input).unwrap().unwrap();
        assert_eq!(args[1], Bytes::from_static(b"he\x00lo"));
    }

    #[test]
    fn parse_inline() {
        let (args, consumed) = parse_command(b"GET  name\r\nrest").unwrap().unwrap();
        assert_eq!(consumed, 11);
        assert_eq!(args, vec![Bytes::from("GET"), Bytes::from("name")]);

        let (args, consumed) = parse_command(b"\r\n").unwrap().unwrap();
        assert_eq!(consumed, 2);
        assert!(args.is_empty());
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            parse_command(b"*-1\r\n"),
            Err(ParseError::InvalidArrayLength(-1))
        ));
        assert!(matches!(
            parse_command(b"*1\r\n$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        ));
        assert!(matches!(
            parse_command(b"*x\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_command(b"*1\r\n:5\r\n"),
            Err(ParseError::Protocol(_))
        ));
        assert!(matches!(
            parse_command(b"*1\r\n$3\r\nabcXX"),
            Err(ParseError::Protocol(_))
        ));
    }

    #[test]
    fn encode_replies() {
        let mut buf = Vec::new();

        encode_response(&Response::ok(), &mut buf);
        assert_eq!(buf, b"+OK\r\n");

        buf.clear();
        encode_response(&Response::not_found("GET: key not found"), &mut buf);
        assert_eq!(buf, b"$-1\r\n");

        buf.clear();
        encode_response(&Response::wrong_type("HGET: wrong kind"), &mut buf);
        assert_eq!(
            buf,
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"
        );

        buf.clear();
        encode_response(&Response::error("no such key"), &mut buf);
        assert_eq!(buf, b"-ERR no such key\r\n");

        buf.clear();
        encode_response(&Response::invalid_command("unknown command 'FOO'"), &mut buf);
        assert_eq!(buf, b"-ERR unknown command 'FOO'\r\n");

        buf.clear();
        encode_response(&Response::Int(-2), &mut buf);
        assert_eq!(buf, b":-2\r\n");

        buf.clear();
        encode_response(&Response::Str(Bytes::from("hello")), &mut buf);
        assert_eq!(buf, b"$5\r\nhello\r\n");

        buf.clear();
        encode_response(
            &Response::StrSlice(vec![Bytes::from("a"), Bytes::from("bb")]),
            &mut buf,
        );
        assert_eq!(buf, b"*2\r\n$1\r\na\r\n$2\r\nbb\r\n");
    }

    async fn start_test_server() -> (SocketAddr, Arc<Controller>) {
        let controller = Controller::new(Config::default());
        controller.start();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_tx, rx) = watch::channel(false);
        let served = Arc::clone(&controller);
        tokio::spawn(async move {
            // The watch sender leaks into the task so the server runs for
            // the whole test.
            let _keep = _tx;
            let _ = serve(listener, served, rx).await;
        });
        (addr, controller)
    }

    #[tokio::test]
    async fn ping_pong() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn set_get_over_the_wire() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$6\r\nradish\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$6\r\nradish\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\ngone\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$-1\r\n");
    }

    #[tokio::test]
    async fn wrong_type_error_line() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*3\r\n$4\r\nHGET\r\n$1\r\nk\r\n$1\r\nf\r\n")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(
            &buf[..n],
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"
        );
    }

    #[tokio::test]
    async fn pipelined_commands_all_answered() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(
                b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n\
                  *3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n\
                  *2\r\n$3\r\nGET\r\n$2\r\nk1\r\n",
            )
            .await
            .unwrap();

        let expected = b"+OK\r\n+OK\r\n$2\r\nv1\r\n";
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, expected);
    }
}
