//! End-to-end scenarios driven over a real loopback socket against a
//! runtime backed by `FakeProcessThreads`. Exercises the protocol the way
//! an external client actually would: `GetSystemState` to obtain a
//! queue-id, `ClientCommand` to submit work, `Poll` to collect results.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use instrument_core::config::RuntimeConfig;
use instrument_core::message::{self, Command, Message, Response, ResponseBody, ResponseCode};
use instrument_core::transport::framing;
use instrument_runtime::Runtime;

const MAX_FRAME: u32 = 4 * 1024 * 1024;

fn start_runtime() -> (std::sync::Arc<Runtime>, SocketAddr) {
    let mut config = RuntimeConfig::default();
    config.listen_port = 0;
    let runtime = Runtime::new_for_test(config).expect("failed to construct runtime");
    let addr = runtime.listen().expect("failed to start listener");
    (runtime, addr)
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).expect("failed to connect");
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        Client { stream, buf: Vec::new() }
    }

    fn send(&mut self, command: &Command) -> Response {
        let bytes = message::encode(command).unwrap();
        let framed = framing::encode_frame(&bytes).unwrap();
        self.stream.write_all(&framed).unwrap();
        self.read_response()
    }

    fn read_response(&mut self) -> Response {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((payload, consumed)) = framing::try_extract_frame(&self.buf, MAX_FRAME).unwrap() {
                self.buf.drain(..consumed);
                return message::decode(&payload).unwrap();
            }
            let n = self.stream.read(&mut chunk).expect("failed to read response");
            assert!(n > 0, "connection closed before a full response arrived");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn bind_queue(&mut self) -> u64 {
        match self.send(&Command::GetSystemState { bind_queue_id: None }).body {
            ResponseBody::SystemState { queue_id } => queue_id,
            other => panic!("unexpected response to GetSystemState: {other:?}"),
        }
    }

    /// Submit a command, retrying briefly if the queue the reactor just
    /// allocated hasn't been created by the worker thread yet (the
    /// `CreateQueue` builtin and the user command race on the same
    /// priority tier).
    fn run(&mut self, queue_id: u64, message: Message) -> u64 {
        for attempt in 0..50 {
            let response = self.send(&Command::ClientCommand { command: message.clone(), blocking: false });
            match response.body {
                ResponseBody::RunCommandAck { task_id, queue_id: q } => {
                    assert_eq!(q, queue_id);
                    return task_id;
                }
                ResponseBody::TextResponse { message } if attempt < 49 => {
                    let _ = message;
                    std::thread::sleep(Duration::from_millis(2));
                }
                ResponseBody::TextResponse { message } => panic!("command rejected: {message}"),
                other => panic!("unexpected response to ClientCommand: {other:?}"),
            }
        }
        unreachable!()
    }

    fn poll(&mut self, queue_id: u64, max_count: usize, timeout_ms: u64) -> Response {
        self.send(&Command::Poll { queue_id, timeout_ms, max_count })
    }
}

#[test]
fn store_and_get_value_round_trip() {
    let (runtime, addr) = start_runtime();
    let mut client = Client::connect(addr);
    let queue_id = client.bind_queue();

    client.run(queue_id, Message::StoreValue { key: "score".into(), value: "100".into() });
    let poll = client.poll(queue_id, 10, 2000);
    match poll.body {
        ResponseBody::PollResults { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].result_code, instrument_core::message::ResultCode::Ok);
        }
        other => panic!("unexpected poll response: {other:?}"),
    }

    client.run(queue_id, Message::GetValue { key: "score".into() });
    let poll = client.poll(queue_id, 10, 2000);
    match poll.body {
        ResponseBody::PollResults { results } => {
            assert_eq!(results.len(), 1);
            match &results[0].result {
                Some(Message::GetValueResult { value }) => assert_eq!(value, "100"),
                other => panic!("unexpected result payload: {other:?}"),
            }
        }
        other => panic!("unexpected poll response: {other:?}"),
    }

    runtime.shutdown();
}

#[test]
fn get_unknown_key_fails() {
    let (runtime, addr) = start_runtime();
    let mut client = Client::connect(addr);
    let queue_id = client.bind_queue();

    client.run(queue_id, Message::GetValue { key: "nope".into() });
    let poll = client.poll(queue_id, 10, 2000);
    match poll.body {
        ResponseBody::PollResults { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].result_code, instrument_core::message::ResultCode::Error);
            assert!(results[0].error_message.is_some());
        }
        other => panic!("unexpected poll response: {other:?}"),
    }

    runtime.shutdown();
}

#[test]
fn hook_lifecycle_round_trips_through_rpc() {
    let (runtime, addr) = start_runtime();
    let mut client = Client::connect(addr);
    let queue_id = client.bind_queue();

    client.run(
        queue_id,
        Message::InstallHook { name: "on_update".into(), address: 0x4000, prefix_length: 8 },
    );
    let poll = client.poll(queue_id, 10, 2000);
    assert_ok_ack(&poll);

    client.run(queue_id, Message::AddCallback { target: 0x4000, name: "tracker".into() });
    assert_ok_ack(&client.poll(queue_id, 10, 2000));

    client.run(queue_id, Message::RemoveCallback { target: 0x4000, name: "tracker".into() });
    assert_ok_ack(&client.poll(queue_id, 10, 2000));

    client.run(queue_id, Message::UninstallHook { target: 0x4000 });
    assert_ok_ack(&client.poll(queue_id, 10, 2000));

    runtime.shutdown();
}

fn assert_ok_ack(response: &Response) {
    match &response.body {
        ResponseBody::PollResults { results } => {
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].result_code, instrument_core::message::ResultCode::Ok);
        }
        other => panic!("unexpected poll response: {other:?}"),
    }
}

#[test]
fn unit_order_defers_until_the_next_frame() {
    let (runtime, addr) = start_runtime();
    let mut client = Client::connect(addr);
    let queue_id = client.bind_queue();

    client.run(
        queue_id,
        Message::UnitOrder { addresses: vec![1, 2, 3], action: "move".into(), x: 1.0, y: 2.0 },
    );

    // Nothing to collect yet: the handler returned Pending and the work
    // sits in the bridge's deferred queue until a frame callback drains it.
    let poll = client.poll(queue_id, 10, 100);
    match poll.body {
        ResponseBody::PollResults { results } => assert!(results.is_empty()),
        other => panic!("unexpected poll response: {other:?}"),
    }

    runtime.bridge.on_frame(vec![]);

    let poll = client.poll(queue_id, 10, 2000);
    assert_ok_ack(&poll);

    runtime.shutdown();
}

#[test]
fn two_concurrent_clients_get_isolated_queues() {
    let (runtime, addr) = start_runtime();
    let mut client_a = Client::connect(addr);
    let mut client_b = Client::connect(addr);
    let queue_a = client_a.bind_queue();
    let queue_b = client_b.bind_queue();
    assert_ne!(queue_a, queue_b);

    client_a.run(queue_a, Message::StoreValue { key: "k".into(), value: "a".into() });
    client_b.run(queue_b, Message::StoreValue { key: "k".into(), value: "b".into() });

    let result_a = client_a.poll(queue_a, 10, 2000);
    let result_b = client_b.poll(queue_b, 10, 2000);
    match (result_a.body, result_b.body) {
        (ResponseBody::PollResults { results: ra }, ResponseBody::PollResults { results: rb }) => {
            assert_eq!(ra.len(), 1);
            assert_eq!(rb.len(), 1);
        }
        _ => panic!("unexpected poll responses"),
    }

    runtime.shutdown();
}

#[test]
fn poll_connection_binds_to_the_command_connections_queue() {
    let (runtime, addr) = start_runtime();
    let mut command_client = Client::connect(addr);
    let queue_id = command_client.bind_queue();

    let mut poll_client = Client::connect(addr);
    let bound = match poll_client.send(&Command::GetSystemState { bind_queue_id: Some(queue_id) }).body {
        ResponseBody::SystemState { queue_id } => queue_id,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(bound, queue_id);

    command_client.run(queue_id, Message::StoreValue { key: "k".into(), value: "v".into() });
    let poll = poll_client.poll(queue_id, 10, 2000);
    assert_ok_ack(&poll);

    runtime.shutdown();
}

#[test]
fn shutdown_command_stops_accepting_further_work() {
    let (runtime, addr) = start_runtime();
    let mut client = Client::connect(addr);
    let queue_id = client.bind_queue();

    let response = client.send(&Command::Shutdown);
    assert_eq!(response.code, ResponseCode::Ok);

    // Give the worker a moment to observe the shutdown command and mark
    // every queue destroyed.
    std::thread::sleep(Duration::from_millis(50));

    let poll = client.poll(queue_id, 10, 200);
    assert_eq!(poll.code, ResponseCode::Error);

    runtime.shutdown();
}
