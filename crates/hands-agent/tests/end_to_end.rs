//! Agent and controller in one process, talking over real local channels.

use hands_agent::{Agent, AgentHandle};
use hands_client::{CallResponse, CommandClient, FunctionServer};
use hands_common::message::IsValidRequest;
use hands_common::{AgentConfig, Message, MessageChannel};
use hands_core::connect;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn start_agent(dir: &Path) -> AgentHandle {
    let mut config = AgentConfig::default();
    config.channel.socket_dir = dir.to_path_buf();
    config.channel.probe_interval_ms = 10;
    Agent::new(config).start().unwrap()
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn call_native2(address: u64, a: usize, b: usize) -> usize {
    let function: extern "C" fn(usize, usize) -> usize =
        unsafe { std::mem::transmute(address as usize) };
    function(a, b)
}

#[test]
fn test_is_valid_and_reconnect_after_close() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());

    let mut first = CommandClient::connect(agent.command_channel()).unwrap();
    assert!(first.is_valid().unwrap());
    assert!(first.close_process().unwrap());
    // The session is over; the agent keeps serving.
    assert!(first.is_valid().is_err());

    let mut second = CommandClient::connect(agent.command_channel()).unwrap();
    assert!(second.is_valid().unwrap());

    drop(second);
    agent.shutdown();
}

#[test]
fn test_read_live_memory() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let live: Vec<u8> = (100..116).collect();
    let bytes = client
        .read_memory(live.as_ptr() as u64, 16)
        .unwrap()
        .unwrap();
    assert_eq!(bytes, live);

    drop(client);
    agent.shutdown();
}

#[test]
fn test_oversized_read_fails_without_ending_session() {
    let dir = TempDir::new().unwrap();
    let mut config = AgentConfig::default();
    config.channel.socket_dir = dir.path().to_path_buf();
    config.channel.probe_interval_ms = 10;
    config.channel.max_message_size = 4096;
    let agent = Agent::new(config).start().unwrap();
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let live = vec![0x5au8; 8192];
    assert_eq!(client.read_memory(live.as_ptr() as u64, 8192).unwrap(), None);
    assert!(client.is_valid().unwrap());
    assert_eq!(
        client.read_memory(live.as_ptr() as u64, 1024).unwrap().unwrap(),
        live[..1024].to_vec()
    );

    drop(client);
    agent.shutdown();
}

#[test]
fn test_create_function_with_too_many_arguments_fails() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    assert!(client.create_function("wide", u32::MAX).is_err());
    assert!(client.is_valid().unwrap());
    assert_eq!(agent.context().functions.address_of("wide"), None);

    drop(client);
    agent.shutdown();
}

#[test]
fn test_write_to_unmapped_memory_fails() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    assert!(!client.write_memory(0, &[1, 2, 3, 4]).unwrap());
    assert_eq!(client.read_memory(0, 4).unwrap(), None);
    // Failed requests do not end the session.
    assert!(client.is_valid().unwrap());

    drop(client);
    agent.shutdown();
}

#[cfg(any(windows, target_os = "linux", target_os = "android"))]
#[test]
fn test_allocate_query_free() {
    use hands_common::memory::{MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE};

    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let address = client
        .allocate_memory(4096, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        .unwrap()
        .unwrap();
    assert_ne!(address, 0);
    assert_eq!(client.query_memory(address).unwrap(), Some(PAGE_READWRITE));

    assert!(client.write_memory(address + 8, b"written").unwrap());
    assert_eq!(
        client.read_memory(address + 8, 7).unwrap().unwrap(),
        b"written".to_vec()
    );

    assert!(client.protect_memory(address, 4096, PAGE_EXECUTE_READ).unwrap());
    assert_eq!(client.query_memory(address).unwrap(), Some(PAGE_EXECUTE_READ));
    assert!(client.protect_memory(address, 4096, PAGE_READWRITE).unwrap());

    assert!(client.free_memory(address).unwrap());
    assert!(!client.free_memory(address).unwrap());

    drop(client);
    agent.shutdown();
}

#[test]
fn test_call_function_in_agent_process() {
    extern "C" fn multiply(a: usize, b: usize) -> usize {
        a * b
    }

    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    assert_eq!(
        client.call_function(multiply as usize as u64, &[6, 7]).unwrap(),
        42
    );
    assert!(client.call_function(0, &[]).is_err());
    assert!(client.is_valid().unwrap());

    drop(client);
    agent.shutdown();
}

#[test]
fn test_trampoline_reaches_controller() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let server = FunctionServer::connect(agent.data_channel()).unwrap();
    server.register("add", |args: &[u64]| CallResponse::value(args[0] + args[1]));
    let bridge = agent.context().bridge.clone();
    assert!(wait_until(|| bridge.is_attached()));

    let address = client.create_function("add", 2).unwrap();
    assert_ne!(address, 0);
    assert_eq!(call_native2(address, 3, 4), 7);

    // A stack trace request only adds agent-side logging.
    server.register("add", |args: &[u64]| {
        CallResponse::value(args[0] + args[1]).with_stack_trace()
    });
    assert_eq!(call_native2(address, 10, 20), 30);

    server.close();
    drop(client);
    agent.shutdown();
}

#[test]
fn test_trampoline_without_controller_returns_zero() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let address = client.create_function("lonely", 2).unwrap();
    assert_eq!(call_native2(address, 1, 2), 0);

    // Same once a controller came and went.
    let server = FunctionServer::connect(agent.data_channel()).unwrap();
    server.register("lonely", |_: &[u64]| CallResponse::value(99));
    let bridge = agent.context().bridge.clone();
    assert!(wait_until(|| bridge.is_attached()));
    assert_eq!(call_native2(address, 1, 2), 99);

    server.close();
    assert!(wait_until(|| !bridge.is_attached()));
    assert_eq!(call_native2(address, 1, 2), 0);

    drop(client);
    agent.shutdown();
}

#[test]
fn test_concurrent_trampolines_are_serialized() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let server = FunctionServer::connect(agent.data_channel()).unwrap();
    for (name, offset) in [("left", 1000u64), ("right", 2000u64)] {
        let calls = calls.clone();
        server.register(name, move |args: &[u64]| {
            calls.fetch_add(1, Ordering::SeqCst);
            CallResponse::value(offset + args[0] * args[1])
        });
    }
    let bridge = agent.context().bridge.clone();
    assert!(wait_until(|| bridge.is_attached()));

    let left = client.create_function("left", 2).unwrap();
    let right = client.create_function("right", 2).unwrap();

    let workers: Vec<_> = [(left, 1000usize), (right, 2000usize)]
        .into_iter()
        .map(|(address, offset)| {
            thread::spawn(move || {
                for i in 0..50usize {
                    assert_eq!(call_native2(address, i, 3), offset + i * 3);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 100);

    server.close();
    drop(client);
    agent.shutdown();
}

#[test]
fn test_function_lifecycle() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let first = client.create_function("f", 2).unwrap();
    assert_eq!(client.create_function("f", 2).unwrap(), first);

    assert!(client.free_function("f").unwrap());
    assert!(!client.free_function("f").unwrap());
    assert_eq!(agent.context().functions.address_of("f"), None);

    let again = client.create_function("f", 2).unwrap();
    assert_ne!(again, 0);
    assert_eq!(agent.context().functions.address_of("f"), Some(again as usize));

    drop(client);
    agent.shutdown();
}

#[test]
fn test_remote_call_timeout_detaches_controller() {
    let dir = TempDir::new().unwrap();
    let mut config = AgentConfig::default();
    config.channel.socket_dir = dir.path().to_path_buf();
    config.channel.probe_interval_ms = 10;
    config.bridge.remote_call_timeout_ms = Some(100);
    let agent = Agent::new(config).start().unwrap();
    let mut client = CommandClient::connect(agent.command_channel()).unwrap();

    let server = FunctionServer::connect(agent.data_channel()).unwrap();
    server.register("slow", |_: &[u64]| {
        thread::sleep(Duration::from_millis(500));
        CallResponse::value(1)
    });
    let bridge = agent.context().bridge.clone();
    assert!(wait_until(|| bridge.is_attached()));

    let address = client.create_function("slow", 2).unwrap();
    assert_eq!(call_native2(address, 0, 0), 0);
    assert!(!bridge.is_attached());

    drop(server);
    drop(client);
    agent.shutdown();
}

#[test]
fn test_response_messages_get_no_reply() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());

    let mut channel = MessageChannel::new(connect(agent.command_channel()).unwrap());
    channel.send(&Message::status(true)).unwrap();
    channel.send(&Message::IsValid(IsValidRequest)).unwrap();
    // The only reply is the one for IsValid.
    assert_eq!(channel.receive().unwrap(), Message::status(true));

    drop(channel);
    agent.shutdown();
}

#[test]
fn test_unknown_message_type_drops_session() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());

    let mut raw = connect(agent.command_channel()).unwrap();
    raw.write_all(&4u32.to_le_bytes()).unwrap();
    raw.write_all(&99u32.to_le_bytes()).unwrap();
    raw.flush().unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(raw.read(&mut buf), Ok(0) | Err(_)));

    let mut client = CommandClient::connect(agent.command_channel()).unwrap();
    assert!(client.is_valid().unwrap());

    drop(client);
    agent.shutdown();
}

#[test]
fn test_shutdown_removes_endpoints() {
    let dir = TempDir::new().unwrap();
    let agent = start_agent(dir.path());
    let command = agent.command_channel().clone();
    let data = agent.data_channel().clone();
    assert!(command.endpoint_path().exists());
    assert!(data.endpoint_path().exists());

    agent.shutdown();
    assert!(!command.endpoint_path().exists());
    assert!(!data.endpoint_path().exists());
    assert!(CommandClient::connect(&command).is_err());
}
