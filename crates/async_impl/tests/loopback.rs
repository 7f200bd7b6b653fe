use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use async_impl::{run_emulator_task, spawn};
use common::emulator::ArrayEmulator;
use common::{
    CommandFrame, CommandTag, LinkStatus, LoopEvent, ScanMethod, TestbedConfig, TestbedController,
};

fn link_config(peer: SocketAddr) -> TestbedConfig {
    let mut config = TestbedConfig::default();
    config.network.bind = "127.0.0.1:0".parse().unwrap();
    config.network.peer = peer;
    config.network.recv_timeout_ready_ms = 200;
    config.network.recv_timeout_busy_ms = 200;
    config.network.poll_interval_ms = 1;
    config.log.enable_csv = false;
    config
}

async fn wait_for<F: FnMut(&LoopEvent) -> bool>(
    events: &mut mpsc::Receiver<LoopEvent>,
    mut pred: F,
) -> LoopEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("link task ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

#[tokio::test]
async fn scan_round_trip_against_emulator() {
    let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_socket.local_addr().unwrap();
    let emulator = ArrayEmulator::from_config(&TestbedConfig::default()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let server = tokio::spawn(run_emulator_task(server_socket, emulator, Arc::clone(&stop)));

    let mut controller = spawn(&link_config(server_addr)).await.unwrap();
    assert!(controller.issue_command(CommandFrame::Scan(ScanMethod::FullSweep)));
    assert!(!controller.issue_command(CommandFrame::SetLoss(3)));

    wait_for(controller.events(), |e| *e == LoopEvent::Started(CommandTag::Scan)).await;
    let finished = wait_for(controller.events(), |e| {
        matches!(e, LoopEvent::Finished { tag: CommandTag::Scan, .. })
    })
    .await;
    let LoopEvent::Finished { snapshot, .. } = finished else {
        unreachable!()
    };
    let d = snapshot.peripherals[1].direction;
    assert!((d.theta_deg - 20.0).abs() <= 5.0, "{d:?}");
    assert_eq!(snapshot.link, LinkStatus::Ready);

    controller.stop().await;
    stop.store(true, Ordering::Relaxed);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn silent_peer_reports_disconnected() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut controller = spawn(&link_config(silent.local_addr().unwrap())).await.unwrap();

    wait_for(controller.events(), |e| *e == LoopEvent::Disconnected).await;
    assert!(controller.diagnostics().timeouts >= 1);
    controller.stop().await;
}

#[tokio::test]
async fn first_command_is_accepted_right_after_spawn() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let controller = spawn(&link_config(silent.local_addr().unwrap())).await.unwrap();

    // the link task has not been polled yet on this runtime
    assert!(controller.issue_command(CommandFrame::Reset));
    assert_eq!(controller.diagnostics().busy_rejections, 0);
    controller.stop().await;
}
