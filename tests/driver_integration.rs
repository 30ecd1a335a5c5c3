//! End-to-end tests against a scripted mock controller on a local TCP port.
//!
//! The mock accepts connections, tracks per-axis positions, and answers the
//! handful of commands the driver issues, which is enough to exercise the
//! whole pipeline: manager, poller, writer, dispatcher and transport
//! together.

use kohzu_aries::config::DriverConfig;
use kohzu_aries::controller::AriesManager;
use kohzu_aries::error::{AriesError, AriesResult};
use kohzu_aries::protocol::{Reply, ReplyKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Minimal ARIES look-alike: answers APS/RPS/RDP/STR/CERR on every accepted
/// connection.
struct MockDevice {
    port: u16,
    task: JoinHandle<()>,
}

impl MockDevice {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let positions: Arc<Mutex<HashMap<u32, i64>>> = Arc::new(Mutex::new(HashMap::new()));
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let positions = Arc::clone(&positions);
                tokio::spawn(async move {
                    let (rh, mut wh) = stream.into_split();
                    let mut lines = BufReader::new(rh).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Some(reply) = respond(&positions, &line).await else {
                            continue;
                        };
                        if wh.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self { port, task }
    }

    fn config(&self) -> DriverConfig {
        DriverConfig {
            host: "127.0.0.1".into(),
            port: self.port,
            ..Default::default()
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(positions: &Mutex<HashMap<u32, i64>>, line: &str) -> Option<String> {
    let (cmd, rest) = match line.split_once('\t') {
        Some((cmd, rest)) => (cmd, rest),
        None => (line, ""),
    };
    let params: Vec<&str> = rest.split('/').collect();
    match cmd {
        "APS" | "RPS" => {
            let axis: u32 = params.first()?.parse().ok()?;
            let value: i64 = params.get(2)?.parse().ok()?;
            let mut positions = positions.lock().await;
            let entry = positions.entry(axis).or_insert(0);
            if cmd == "APS" {
                *entry = value;
            } else {
                *entry += value;
            }
            Some(format!("C\t{cmd}{axis}\r\n"))
        }
        "RDP" => {
            let axis: u32 = params.first()?.parse().ok()?;
            let pos = *positions.lock().await.get(&axis).unwrap_or(&0);
            Some(format!("C\tRDP{axis}\t{pos}\r\n"))
        }
        "STR" => {
            let axis: u32 = params.first()?.parse().ok()?;
            Some(format!("C\tSTR{axis}\t0\t0\t0\t0\t0\t0\r\n"))
        }
        "CERR" => Some("C\tCERR\t0\r\n".to_string()),
        _ => Some("E\tSYS\t102\r\n".to_string()),
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn absolute_move_completes_and_settles_cache() {
    let device = MockDevice::spawn().await;
    let manager = AriesManager::new(device.config()).unwrap();
    manager.set_poll_axes(vec![1]);
    manager.start().await.unwrap();
    assert!(manager.is_connected());

    let (tx, mut rx) = mpsc::channel::<AriesResult<Reply>>(1);
    manager
        .move_absolute_async(1, 1000, 0, 0, move |result| {
            let _ = tx.try_send(result);
        })
        .unwrap();

    // The optimistic running flag appears before any reply.
    let optimistic = manager.snapshot_state();
    assert_eq!(optimistic[&1].running, Some(true));

    let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("move callback fired")
        .unwrap()
        .unwrap();
    assert_eq!(reply.kind, ReplyKind::Completion);
    assert_eq!(reply.cmd, "APS");
    assert_eq!(reply.axis, "1");

    // Final reads settle position and running; the counter returns to zero.
    let settled = wait_until(Duration::from_secs(2), || {
        let snap = manager.snapshot_state();
        snap.get(&1)
            .map(|s| s.position == Some(1000) && s.running == Some(false))
            .unwrap_or(false)
    })
    .await;
    assert!(settled, "cache did not settle: {:?}", manager.snapshot_state());

    assert!(
        wait_until(Duration::from_secs(1), || manager.active_operations() == 0).await,
        "active-operation counter did not return to zero"
    );

    manager.stop().await;
}

#[tokio::test]
async fn relative_move_accumulates_position() {
    let device = MockDevice::spawn().await;
    let manager = AriesManager::new(device.config()).unwrap();
    manager.set_poll_axes(vec![2]);
    manager.start().await.unwrap();

    let (tx, mut rx) = mpsc::channel::<AriesResult<Reply>>(2);
    let tx2 = tx.clone();
    manager
        .move_absolute_async(2, 500, 0, 0, move |r| {
            let _ = tx.try_send(r);
        })
        .unwrap();
    rx.recv().await.unwrap().unwrap();

    manager
        .move_relative_async(2, 250, 0, 0, move |r| {
            let _ = tx2.try_send(r);
        })
        .unwrap();
    rx.recv().await.unwrap().unwrap();

    assert_eq!(manager.read_position(2).await.unwrap(), 750);
    manager.stop().await;
}

#[tokio::test]
async fn typed_reads_and_last_error() {
    let device = MockDevice::spawn().await;
    let manager = AriesManager::new(device.config()).unwrap();
    manager.start().await.unwrap();

    assert_eq!(manager.read_position(3).await.unwrap(), 0);

    let status = manager.read_status(3).await.unwrap();
    assert_eq!(status.driving_state, 0);

    let err_reply = manager.read_last_error().await.unwrap();
    assert_eq!(err_reply.cmd, "CERR");
    assert_eq!(err_reply.params, vec!["0".to_string()]);

    let snap = manager.snapshot_state();
    assert_eq!(snap[&3].position, Some(0));
    assert_eq!(snap[&3].running, Some(false));

    manager.stop().await;
}

#[tokio::test]
async fn unknown_command_surfaces_as_spontaneous_sys_error() {
    let device = MockDevice::spawn().await;
    let manager = AriesManager::new(device.config()).unwrap();
    manager.start().await.unwrap();

    let (tx, mut rx) = mpsc::channel::<Reply>(1);
    manager.register_spontaneous_handler(Arc::new(move |reply| {
        let _ = tx.try_send(reply.clone());
    }));

    // The mock answers unknown mnemonics with an E SYS line whose key
    // (SYS:-1) matches no pending request (the request key is XYZ:-1).
    let controller = manager.motor_controller().unwrap();
    let err = controller
        .send_sync("XYZ", &[], Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(err, AriesError::Timeout);

    let sys = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("SYS routed to spontaneous handler")
        .unwrap();
    assert_eq!(sys.kind, ReplyKind::Error);
    assert_eq!(sys.cmd, "SYS");
    assert_eq!(sys.axis, "");
    assert_eq!(sys.params, vec!["102".to_string()]);

    manager.stop().await;
}

#[tokio::test]
async fn disconnect_mid_flight_cancels_and_releases_counter() {
    // Device accepts one connection, swallows one line, then drops the link.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rh, _wh) = stream.into_split();
        let mut lines = BufReader::new(rh).lines();
        let _ = lines.next_line().await;
        // Dropping both halves closes the socket with the APS unanswered.
    });

    let config = DriverConfig {
        host: "127.0.0.1".into(),
        port,
        ..Default::default()
    };
    let manager = AriesManager::new(config).unwrap();
    manager.start().await.unwrap();

    let (tx, mut rx) = mpsc::channel::<AriesResult<Reply>>(1);
    manager
        .move_absolute_async(1, 1000, 0, 0, move |r| {
            let _ = tx.try_send(r);
        })
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("waiter resolved after disconnect")
        .unwrap();
    assert!(matches!(result, Err(AriesError::Cancelled(_))));

    assert!(
        wait_until(Duration::from_secs(2), || manager.active_operations() == 0).await,
        "counter not released after disconnect"
    );

    device.await.unwrap();
    manager.stop().await;
}

#[tokio::test]
async fn auto_reconnect_recovers_after_device_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener); // Nothing listening yet: the first attempts must fail.

    let config = DriverConfig {
        host: "127.0.0.1".into(),
        port,
        auto_reconnect: true,
        reconnect_interval_ms: 100,
        ..Default::default()
    };
    let manager = AriesManager::new(config).unwrap();
    manager.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!manager.is_connected());

    // Bring the device up on the same port; the loop should latch on.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let device = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Hold the connection open until the test ends.
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    assert!(
        wait_until(Duration::from_secs(3), || manager.is_connected()).await,
        "manager did not reconnect"
    );

    manager.stop().await;
    device.abort();
}
