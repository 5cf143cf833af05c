//! End-to-end exercises of the FTP control channel and the supervisor,
//! over a real TCP connection.

use slog::Drain;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use wharf::server::ListenerError;
use wharf::store::{ListenerCaps, NewListener, NewUser, NewVirtualPath, PathCaps, Protocol, Store};
use wharf::{CoreConfig, Supervisor, SupervisorError};

static TESTPORT: AtomicU16 = AtomicU16::new(2450);

fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard.fuse(), slog::o!())
}

struct Harness {
    supervisor: Arc<Supervisor>,
    store: Store,
    listener_id: i64,
    port: u16,
    _root: tempfile::TempDir,
    _base: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with_config(CoreConfig::default()).await
}

async fn harness_with_config(config: CoreConfig) -> Harness {
    let base = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let logger = discard_logger();
    let store = Store::open(base.path().join("test.db"), logger.clone()).await.unwrap();

    let user = store
        .create_user(NewUser {
            username: "test".to_string(),
            password: Some("test".to_string()),
            password_enabled: true,
            public_key: None,
            gui_enabled: false,
        })
        .await
        .unwrap();
    let port = TESTPORT.fetch_add(1, Ordering::Relaxed);
    let listener = store
        .create_listener(NewListener {
            name: "ftp-test".to_string(),
            protocol: Protocol::Ftp,
            binding_ip: "127.0.0.1".to_string(),
            port,
            enabled: true,
        })
        .await
        .unwrap();
    store.subscribe(user.id, listener.id).await.unwrap();
    store.set_listener_caps(user.id, listener.id, ListenerCaps::all()).await.unwrap();
    store
        .add_virtual_path(NewVirtualPath {
            user_id: user.id,
            virtual_path: "/".to_string(),
            local_path: root.path().to_path_buf(),
            caps: PathCaps::all(),
            apply_to_subdirs: true,
        })
        .await
        .unwrap();

    let host_key = wharf::sftp::load_or_generate_host_key(&base.path().join("ssh_host_key"), &logger).unwrap();
    let supervisor = Arc::new(Supervisor::new(store.clone(), config, host_key, logger).await.unwrap());
    supervisor.start_listener(listener.id).await.unwrap();

    Harness {
        supervisor,
        store,
        listener_id: listener.id,
        port,
        _root: root,
        _base: base,
    }
}

async fn connect(port: u16) -> TcpStream {
    for _ in 0..20 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("could not connect to 127.0.0.1:{}", port);
}

async fn read_reply(buffer: &mut [u8], stream: &TcpStream) -> String {
    loop {
        stream.readable().await.unwrap();
        match stream.try_read(buffer) {
            Ok(0) => panic!("connection closed"),
            Ok(n) => return String::from_utf8_lossy(&buffer[..n]).into_owned(),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("{}", e),
        }
    }
}

async fn send_line(line: &str, stream: &TcpStream) {
    loop {
        stream.writable().await.unwrap();
        match stream.try_write(line.as_bytes()) {
            Ok(_) => return,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("{}", e),
        }
    }
}

async fn login(stream: &TcpStream, buffer: &mut [u8]) {
    assert!(read_reply(buffer, stream).await.starts_with("220 "));
    send_line("USER test\r\n", stream).await;
    assert!(read_reply(buffer, stream).await.starts_with("331 "));
    send_line("PASS test\r\n", stream).await;
    assert!(read_reply(buffer, stream).await.starts_with("230 "));
}

#[tokio::test]
async fn login_and_directory_lifecycle() {
    let h = harness().await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    login(&stream, &mut buffer).await;

    send_line("PWD\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("257 \"/\""));

    send_line("MKD inbox\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("257 "));

    send_line("CWD inbox\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("250 "));

    send_line("PWD\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("257 \"/inbox\""));

    send_line("CDUP\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("250 "));

    send_line("RMD inbox\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("250 "));

    send_line("DELE missing.txt\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("550 "));

    send_line("QUIT\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("221 "));
}

#[tokio::test]
async fn commands_require_authentication() {
    let h = harness().await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    assert!(read_reply(&mut buffer, &stream).await.starts_with("220 "));

    send_line("PWD\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("530 "));

    send_line("USER test\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("331 "));
    send_line("PASS wrong\r\n", &stream).await;
    assert!(read_reply(&mut buffer, &stream).await.starts_with("530 "));
}

#[tokio::test]
async fn data_channel_commands_answer_not_implemented() {
    let h = harness().await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    login(&stream, &mut buffer).await;

    for command in ["PASV\r\n", "PORT 127,0,0,1,7,210\r\n", "RETR x\r\n", "STOR x\r\n", "LIST\r\n"] {
        send_line(command, &stream).await;
        assert!(read_reply(&mut buffer, &stream).await.starts_with("502 "));
    }
}

#[tokio::test]
async fn sessions_are_tracked_and_disconnectable() {
    let h = harness().await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    login(&stream, &mut buffer).await;

    let mut sessions = Vec::new();
    for _ in 0..50 {
        sessions = h.supervisor.active_sessions();
        if !sessions.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].username, "test");
    assert_eq!(sessions[0].listener_id, h.listener_id);
    assert_eq!(sessions[0].protocol, Protocol::Ftp);

    assert!(h.supervisor.disconnect_session(sessions[0].session_id).await);
    assert!(read_reply(&mut buffer, &stream).await.starts_with("421 "));

    for _ in 0..50 {
        if h.supervisor.active_sessions().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(h.supervisor.active_sessions().is_empty());
    assert!(!h.supervisor.disconnect_session(uuid::Uuid::new_v4()).await);
}

#[tokio::test]
async fn listener_lifecycle_errors() {
    let h = harness().await;

    assert!(h.supervisor.is_running(h.listener_id).await);
    let err = h.supervisor.start_listener(h.listener_id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Listener(ListenerError::AlreadyRunning)));

    h.supervisor.stop_listener(h.listener_id).await.unwrap();
    assert!(!h.supervisor.is_running(h.listener_id).await);
    h.supervisor.restart_listener(h.listener_id).await.unwrap();
    assert!(h.supervisor.is_running(h.listener_id).await);

    // A disabled listener refuses to start.
    let disabled = h
        .store
        .create_listener(NewListener {
            name: "off".to_string(),
            protocol: Protocol::Ftp,
            binding_ip: "127.0.0.1".to_string(),
            port: TESTPORT.fetch_add(1, Ordering::Relaxed),
            enabled: false,
        })
        .await
        .unwrap();
    let err = h.supervisor.start_listener(disabled.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Listener(ListenerError::Disabled)));

    assert!(matches!(
        h.supervisor.start_listener(9999).await.unwrap_err(),
        SupervisorError::UnknownListener
    ));

    h.supervisor.shutdown().await;
    assert!(!h.supervisor.is_running(h.listener_id).await);
}

#[tokio::test]
async fn idle_sessions_are_timed_out_and_released() {
    let config = CoreConfig {
        idle_timeout: std::time::Duration::from_secs(1),
        ..CoreConfig::default()
    };
    let h = harness_with_config(config).await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    login(&stream, &mut buffer).await;

    // Stall past the timeout; the server hangs up on its own.
    assert!(read_reply(&mut buffer, &stream).await.starts_with("421 "));

    let mut timed_out = false;
    for _ in 0..100 {
        let rows = h.store.list_activities(Default::default()).await.unwrap();
        if rows.iter().any(|r| r.action == "IDLE_TIMEOUT") {
            timed_out = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(timed_out, "IDLE_TIMEOUT activity never recorded");
    for _ in 0..50 {
        if h.supervisor.active_sessions().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(h.supervisor.active_sessions().is_empty());
}

#[tokio::test]
async fn port_zero_fails_at_start() {
    let h = harness().await;
    let bad = h
        .store
        .create_listener(NewListener {
            name: "bad-port".to_string(),
            protocol: Protocol::Ftp,
            binding_ip: "127.0.0.1".to_string(),
            port: 0,
            enabled: true,
        })
        .await
        .unwrap();
    let err = h.supervisor.start_listener(bad.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Listener(ListenerError::Io(_))));
}

#[tokio::test]
async fn login_activity_reaches_the_store() {
    let h = harness().await;
    let stream = connect(h.port).await;
    let mut buffer = vec![0u8; 1024];
    login(&stream, &mut buffer).await;

    let mut found = false;
    for _ in 0..100 {
        let rows = h.store.list_activities(Default::default()).await.unwrap();
        if rows.iter().any(|r| r.action == "LOGIN" && r.username == "test" && r.success) {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(found, "LOGIN activity never persisted");
}
