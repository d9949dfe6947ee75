//! Integration tests for the external OpenOCD controller

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use openocd_external::config::{RttConfig, SwoConfig, SwoSource, TCL_PORT_NAME};
use openocd_external::session::STOP_REASON_ENTRY;
use openocd_external::swo::{Platform, SwoTransport};
use openocd_external::tcl_channel::{TclFramer, TCL_TERMINATOR};
use openocd_external::{
    ControllerError, ControllerEvent, EventSession, ExternalServerController, ServerController,
    SessionConfig, TclChannel,
};
use openocd_external::session::Diagnostics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Minimal OpenOCD TCL server: records each command and answers it with `reply`
async fn fake_openocd(reply: &'static str) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut framer = TclFramer::new();
        let mut buf = [0u8; 512];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for command in framer.push(&buf[..n]) {
                let _ = tx.send(command.clone());
                let mut out = format!("{}:{}", reply, command).into_bytes();
                out.push(TCL_TERMINATOR);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    });
    (port, rx)
}

fn rtt_session(port: u16) -> SessionConfig {
    let mut ports = HashMap::new();
    ports.insert(TCL_PORT_NAME.to_string(), port);
    SessionConfig {
        gdb_target: "127.0.0.1:3333".to_string(),
        executable: Some("build/zephyr/zephyr.elf".to_string()),
        rtt_config: RttConfig {
            enabled: true,
            address: "0x20000000".to_string(),
            search_size: 16,
            rtt_start_retry: Some(2),
            ..RttConfig::default()
        },
        ports,
        ..SessionConfig::default()
    }
}

/// Poll `cond` until it holds or two seconds pass
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_full_launch_lifecycle() {
    let (port, mut commands) = fake_openocd("ok").await;
    let (mut controller, mut events) = ExternalServerController::with_platform(
        SessionConfig {
            swo_config: SwoConfig {
                enabled: true,
                source: SwoSource::Socket,
                swo_port: Some(5555),
                ..SwoConfig::default()
            },
            ..rtt_session(port)
        },
        Platform::Unix,
    )
    .unwrap();

    controller.server_launch_started();
    controller.server_launch_completed();
    assert_eq!(
        events.try_recv().unwrap(),
        ControllerEvent::SwoConfigure(SwoTransport::Socket { port: 5555 })
    );

    let mut gdb = controller.init_commands().unwrap();
    gdb.extend(controller.launch_commands().unwrap());
    gdb.extend(controller.rtt_commands());
    assert_eq!(gdb[0], "target-select extended-remote 127.0.0.1:3333");
    assert!(gdb.iter().any(|c| c == "file-exec-and-symbols \"build/zephyr/zephyr.elf\""));
    assert_eq!(gdb.last().unwrap(), "interpreter-exec console \"monitor rtt start\"");

    let session = Arc::new(EventSession::default());
    controller.debugger_launch_started(session.clone());
    controller.debugger_launch_completed();
    assert!(eventually(|| session.subscriber_count() == 1).await);

    // Entry stop never retries; the next two pauses use the whole budget
    session.stopped(STOP_REASON_ENTRY);
    for _ in 0..3 {
        session.stopped("breakpoint-hit");
    }
    for _ in 0..2 {
        let sent = tokio::time::timeout(Duration::from_secs(2), commands.recv()).await.unwrap();
        assert_eq!(sent.as_deref(), Some("rtt start"));
    }
    let monitor = controller.rtt_monitor().unwrap();
    assert!(eventually(|| monitor.status().retries_issued == 2).await);
    assert!(tokio::time::timeout(Duration::from_millis(200), commands.recv()).await.is_err());

    // Output split mid-line still finds the marker
    session.output("Info : rtt: Control block fo");
    session.output("und at 0x20000410\n");
    assert!(tokio::time::timeout(Duration::from_secs(2), monitor.wait_started()).await.unwrap());

    // Manual TCL traffic shares the same connection
    assert_eq!(controller.tcl_command("targets").await.unwrap(), "ok:targets");

    controller.shutdown().await;
    assert!(eventually(|| session.subscriber_count() == 0).await);
}

#[tokio::test]
async fn test_openocd_with_native_polling_gets_no_retries() {
    let (port, mut commands) = fake_openocd("").await;
    let (mut controller, _events) = ExternalServerController::new(rtt_session(port)).unwrap();

    let session = Arc::new(EventSession::default());
    controller.debugger_launch_started(session.clone());
    controller.debugger_launch_completed();

    session.output("Info : rtt: No control block found, will retry\r\n");
    let monitor = controller.rtt_monitor().unwrap();
    assert!(eventually(|| monitor.status().auto_detected).await);

    session.stopped("breakpoint-hit");
    assert!(tokio::time::timeout(Duration::from_millis(300), commands.recv()).await.is_err());
    assert_eq!(monitor.status().retries_issued, 0);
    assert!(monitor.is_running());
}

#[tokio::test]
async fn test_pipelined_tcl_commands_resolve_in_order() {
    let (port, _commands) = fake_openocd("r").await;
    let channel = TclChannel::new("127.0.0.1", port, Diagnostics::default());
    channel.connect().await.unwrap();

    let first = channel.submit("halt").await.unwrap();
    let second = channel.submit("reg pc").await.unwrap();
    let third = channel.submit("resume").await.unwrap();
    assert!(first.id() < second.id() && second.id() < third.id());

    assert_eq!(third.await.unwrap(), "r:resume");
    assert_eq!(first.await.unwrap(), "r:halt");
    assert_eq!(second.await.unwrap(), "r:reg pc");
    assert_eq!(channel.pending_count().await, 0);
}

#[tokio::test]
async fn test_missing_openocd_is_reported_once() {
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (mut controller, _events) = ExternalServerController::new(rtt_session(port)).unwrap();

    let err = controller.tcl_command("targets").await.unwrap_err();
    assert!(matches!(err, ControllerError::ConnectionFailed(_)));
    let err = controller.tcl_command("targets").await.unwrap_err();
    assert!(matches!(err, ControllerError::ChannelClosed));
}

#[test]
fn test_session_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(
        &path,
        r#"{
            "gdbTarget": "192.168.1.20:3333",
            "request": "attach",
            "rttConfig": {"enabled": true, "address": "0x20000000", "polling_interval": 50},
            "ports": {"tclPort": 6666}
        }"#,
    )
    .unwrap();

    let config = SessionConfig::load(&path).unwrap();
    let (controller, _events) = ExternalServerController::new(config).unwrap();
    assert_eq!(
        controller.rtt_commands(),
        vec![
            "interpreter-exec console \"monitor rtt setup 0x20000000 16 {SEGGER RTT}\"",
            "interpreter-exec console \"monitor rtt polling_interval 50\"",
            "interpreter-exec console \"monitor rtt start\"",
        ]
    );
    assert_eq!(controller.attach_commands(), vec!["interpreter-exec console \"monitor halt\""]);
}
