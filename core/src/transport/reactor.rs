//! Single-threaded non-blocking I/O reactor (spec.md §4.3).
//!
//! Grounded on `neutronium::net::endpoint::Endpoint`'s `mio`-driven
//! accept/read/write loop, re-expressed against the current `mio` 0.8 API
//! (`Interest`/`Registry` rather than the teacher's `Ready`/`PollOpt`), and
//! on `t51core::net::buffer::Buffer`'s chunked, `WouldBlock`-aware
//! egress/ingress handling.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::command::{BuiltinKind, CommandManager};
use crate::message::{self, Command, Response, ResponseBody};
use crate::transport::{framing, http};

const SERVER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    queue_id: Option<u64>,
    http_mode: Option<bool>,
    closing: bool,
}

impl Connection {
    fn new(stream: TcpStream, addr: SocketAddr) -> Connection {
        Connection {
            stream,
            addr,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            queue_id: None,
            http_mode: None,
            closing: false,
        }
    }

    /// Read whatever is available without blocking (spec.md's ingress
    /// pattern: keep reading until `WouldBlock`).
    fn ingress(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closing = true;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of the pending buffer as the socket accepts without
    /// blocking.
    fn egress(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Owns the listener and every connection; runs accept/read/write on one
/// thread, handing parsed commands to `CommandManager` by reference and
/// never blocking on application work itself.
pub struct Reactor<R: Send + Sync + 'static> {
    poll: Poll,
    listener: TcpListener,
    events: Events,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    manager: std::sync::Arc<CommandManager<R>>,
    max_frame_size: u32,
    allowed_host: regex::Regex,
    running: bool,
}

impl<R: Send + Sync + 'static> Reactor<R> {
    pub fn bind(
        addr: SocketAddr,
        manager: std::sync::Arc<CommandManager<R>>,
        max_frame_size: u32,
        allowed_host: regex::Regex,
    ) -> io::Result<Reactor<R>> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, SERVER_TOKEN, Interest::READABLE)?;
        Ok(Reactor {
            poll,
            listener,
            events: Events::with_capacity(1024),
            connections: HashMap::new(),
            next_token: 1,
            manager,
            max_frame_size,
            allowed_host,
            running: true,
        })
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// The address actually bound, useful when `bind` was given port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run one iteration of accept/read/dispatch/write. Call in a loop
    /// from the reactor thread until `stop` has been called and no
    /// connections remain.
    pub fn turn(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(POLL_TIMEOUT))?;

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == SERVER_TOKEN {
                self.accept_all()?;
                continue;
            }
            self.service(token)?;
        }

        self.connections.retain(|_, conn| !(conn.closing && conn.write_buf.is_empty()));
        Ok(())
    }

    fn accept_all(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if !self.allowed_host.is_match(&addr.ip().to_string()) {
                        tracing::warn!(%addr, "rejecting connection from disallowed host");
                        continue;
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    self.connections.insert(token, Connection::new(stream, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn service(&mut self, token: Token) -> io::Result<()> {
        let max_frame_size = self.max_frame_size;
        let manager = self.manager.clone();
        let conn = match self.connections.get_mut(&token) {
            Some(c) => c,
            None => return Ok(()),
        };

        conn.ingress()?;

        loop {
            if conn.http_mode.is_none() && !conn.read_buf.is_empty() {
                conn.http_mode = Some(framing::looks_like_http(&conn.read_buf));
            }

            let dispatched = match conn.http_mode {
                Some(true) => Self::service_http(conn, &manager)?,
                Some(false) => Self::service_binary(conn, &manager, max_frame_size)?,
                None => false,
            };
            if !dispatched {
                break;
            }
        }

        conn.egress()
    }

    fn service_binary(conn: &mut Connection, manager: &CommandManager<R>, max_frame_size: u32) -> io::Result<bool> {
        let extracted = framing::try_extract_frame(&conn.read_buf, max_frame_size);
        let (payload, consumed) = match extracted {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(false),
            Err(_) => {
                conn.closing = true;
                return Ok(false);
            }
        };
        conn.read_buf.drain(..consumed);

        let command: Command = match message::decode(&payload) {
            Ok(c) => c,
            Err(_) => {
                conn.closing = true;
                return Ok(true);
            }
        };
        let response = dispatch(conn, manager, command);
        if let Ok(bytes) = message::encode(&response) {
            if let Ok(framed) = framing::encode_frame(&bytes) {
                conn.write_buf.extend_from_slice(&framed);
            }
        }
        Ok(true)
    }

    fn service_http(conn: &mut Connection, manager: &CommandManager<R>) -> io::Result<bool> {
        let head = match http::parse_request_head(&conn.read_buf) {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(false),
            Err(_) => {
                conn.closing = true;
                return Ok(false);
            }
        };
        let total = head.header_len + head.content_length;
        if conn.read_buf.len() < total {
            return Ok(false);
        }
        let body = conn.read_buf[head.header_len..total].to_vec();
        conn.read_buf.drain(..total);

        let response = match http::decode_json_command(&body) {
            Ok(command) => dispatch(conn, manager, command),
            Err(_) => Response::error("malformed request body"),
        };
        if let Ok(bytes) = http::encode_http_response(&response) {
            conn.write_buf.extend_from_slice(&bytes);
        }
        conn.closing = true;
        Ok(true)
    }
}

fn dispatch<R: Send + Sync + 'static>(conn: &mut Connection, manager: &CommandManager<R>, command: Command) -> Response {
    match command {
        Command::GetSystemState { bind_queue_id } => match bind_queue_id {
            Some(existing) => {
                conn.queue_id = Some(existing);
                Response::ok(ResponseBody::SystemState { queue_id: existing })
            }
            None => {
                let queue_id = conn.addr.port() as u64; // placeholder stable id; real allocation lives in the runtime's accept path
                conn.queue_id = Some(queue_id);
                manager.enqueue_builtin(BuiltinKind::CreateQueue, queue_id);
                Response::ok(ResponseBody::SystemState { queue_id })
            }
        },
        Command::ClientCommand { command, .. } => {
            let queue_id = match conn.queue_id {
                Some(id) => id,
                None => return Response::error("GetSystemState must be called first"),
            };
            match manager.enqueue_user(queue_id, command) {
                Ok(task_id) => Response::ok(ResponseBody::RunCommandAck { queue_id, task_id }),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Command::Poll { queue_id, timeout_ms, max_count } => {
            match manager.flush_results(queue_id, max_count, Duration::from_millis(timeout_ms)) {
                Ok(results) => Response::ok(ResponseBody::PollResults { results }),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Command::Shutdown => {
            manager.enqueue_shutdown();
            Response::ok(ResponseBody::TextResponse { message: "shutting down".into() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Registry;
    use crate::message::ResponseCode;

    fn echo_manager() -> std::sync::Arc<CommandManager<()>> {
        let registry: Registry<()> = Registry::new();
        let manager = std::sync::Arc::new(CommandManager::new(registry));
        manager.bind_runtime(std::sync::Arc::new(()));
        manager.start();
        manager
    }

    fn fake_connection() -> Connection {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        Connection::new(TcpStream::from_std(client), addr)
    }

    #[test]
    fn get_system_state_allocates_a_queue_id() {
        let manager = echo_manager();
        let mut conn = fake_connection();
        let response = dispatch(&mut conn, &manager, Command::GetSystemState { bind_queue_id: None });
        assert_eq!(response.code, ResponseCode::Ok);
        assert!(conn.queue_id.is_some());
        manager.enqueue_shutdown();
        manager.join();
    }

    #[test]
    fn client_command_before_system_state_errors() {
        let manager = echo_manager();
        let mut conn = fake_connection();
        let response = dispatch(
            &mut conn,
            &manager,
            Command::ClientCommand { command: crate::message::Message::Ack, blocking: false },
        );
        assert_eq!(response.code, ResponseCode::Error);
        manager.enqueue_shutdown();
        manager.join();
    }

    #[test]
    fn poll_connection_binds_to_existing_queue_id() {
        let manager = echo_manager();
        let mut conn = fake_connection();
        dispatch(&mut conn, &manager, Command::GetSystemState { bind_queue_id: Some(42) });
        assert_eq!(conn.queue_id, Some(42));
        manager.enqueue_shutdown();
        manager.join();
    }
}
