//! Two sessions wired back to back over an in-process duplex pipe:
//! chat, the in-band start handshake, and test lifecycle around both.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use sppbench::link::{
    AcceptFuture, BindFuture, BoxStream, ClientLink, DialFuture, ServerLink,
};
use sppbench::session::{LinkHandle, Session, SessionEvent};
use sppbench::speed::{TestConfig, ThroughputResult};
use sppbench::LinkState;

fn one_shot_dial(stream: BoxStream) -> impl Fn() -> DialFuture + Send + Sync + 'static {
    let slot = Mutex::new(Some(stream));
    move || {
        let taken = slot.lock().take();
        Box::pin(async move {
            taken.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "dial exhausted")
            })
        })
    }
}

/// Binder whose accept resolves immediately with the canned stream.
fn instant_bind(stream: BoxStream) -> impl Fn() -> BindFuture + Send + Sync + 'static {
    let slot = Mutex::new(Some(stream));
    move || {
        let taken = slot.lock().take();
        Box::pin(async move {
            let stream = taken.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "already bound")
            })?;
            let accept: AcceptFuture = Box::pin(async move { Ok(stream) });
            Ok(accept)
        })
    }
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session closed its event stream")
}

async fn wait_for_state(rx: &mut mpsc::Receiver<SessionEvent>, want: LinkState) {
    loop {
        if let SessionEvent::State(state) = next_event(rx).await {
            if state == want {
                return;
            }
        }
    }
}

async fn wait_inbound(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<u8> {
    loop {
        if let SessionEvent::Inbound(data) = next_event(rx).await {
            return data;
        }
    }
}

async fn wait_finished(rx: &mut mpsc::Receiver<SessionEvent>) -> ThroughputResult {
    loop {
        match next_event(rx).await {
            SessionEvent::TestFinished(report) => return report,
            SessionEvent::TestFailed(reason) => panic!("test failed: {}", reason),
            _ => {}
        }
    }
}

/// Client and server sessions joined by a duplex pipe, both `Connected`.
async fn session_pair() -> (
    Session,
    mpsc::Receiver<SessionEvent>,
    Session,
    mpsc::Receiver<SessionEvent>,
) {
    let (near, far) = tokio::io::duplex(512 * 1024);
    let (client, client_states) = ClientLink::new(one_shot_dial(Box::new(near)));
    let (server, server_states) = ServerLink::new(instant_bind(Box::new(far)));
    let (a, mut a_events) = Session::spawn(LinkHandle::client(client), client_states, 1024);
    let (b, mut b_events) = Session::spawn(LinkHandle::server(server), server_states, 1024);
    a.connect().await;
    b.connect().await;
    wait_for_state(&mut a_events, LinkState::Connected).await;
    wait_for_state(&mut b_events, LinkState::Connected).await;
    (a, a_events, b, b_events)
}

#[tokio::test]
async fn chat_flows_both_ways() {
    let (a, mut a_events, b, mut b_events) = session_pair().await;

    a.send(b"hello".to_vec()).await;
    assert_eq!(wait_inbound(&mut b_events).await, b"hello");

    b.send(b"hi back".to_vec()).await;
    assert_eq!(wait_inbound(&mut a_events).await, b"hi back");
}

#[tokio::test]
async fn control_lookalikes_fall_through_as_chat() {
    let (_a, mut a_events, b, _b_events) = session_pair().await;

    // Each send is acknowledged before the next so chunks cannot coalesce.
    b.send(b"START:abc;".to_vec()).await;
    assert_eq!(wait_inbound(&mut a_events).await, b"START:abc;");

    // A zero target is not a command.
    b.send(b"START:0;".to_vec()).await;
    assert_eq!(wait_inbound(&mut a_events).await, b"START:0;");

    // An ack nobody asked for is just data.
    b.send(b"START_ACK".to_vec()).await;
    assert_eq!(wait_inbound(&mut a_events).await, b"START_ACK");

    // Same for a stray EOF.
    b.send(b"EOF".to_vec()).await;
    assert_eq!(wait_inbound(&mut a_events).await, b"EOF");
}

#[tokio::test]
async fn remote_request_runs_end_to_end() {
    let (a, mut a_events, b, mut b_events) = session_pair().await;
    let target = 2048u64;

    a.request_remote_rx(target, 512).await;

    // The receiving side announces the request, runs, and reports.
    loop {
        match next_event(&mut b_events).await {
            SessionEvent::RemoteTestRequested { target: got } => {
                assert_eq!(got, target);
                break;
            }
            SessionEvent::State(_) => {}
            other => panic!("unexpected event before the request: {:?}", other),
        }
    }
    let b_report = wait_finished(&mut b_events).await;
    assert_eq!(b_report.rx_total_bytes, target);
    assert_eq!(b_report.tx_total_bytes, 0);

    // The requesting side sees the ack, its own report, then the peer's EOF.
    loop {
        match next_event(&mut a_events).await {
            SessionEvent::PeerReady => break,
            SessionEvent::State(_) | SessionEvent::Sample(_) => {}
            other => panic!("unexpected event before the ack: {:?}", other),
        }
    }
    let a_report = wait_finished(&mut a_events).await;
    assert_eq!(a_report.tx_total_bytes, target);
    assert_eq!(a_report.rx_total_bytes, 0);
    loop {
        if let SessionEvent::PeerEof = next_event(&mut a_events).await {
            break;
        }
    }

    // Both endpoints are back on chat duty.
    a.send(b"after".to_vec()).await;
    assert_eq!(wait_inbound(&mut b_events).await, b"after");
}

#[tokio::test(start_paused = true)]
async fn unanswered_remote_request_times_out() {
    // Raw peer that never replies, with its end of the pipe held open.
    let (near, silent) = tokio::io::duplex(512 * 1024);
    let (client, client_states) = ClientLink::new(one_shot_dial(Box::new(near)));
    let (a, mut a_events) = Session::spawn(LinkHandle::client(client), client_states, 1024);
    a.connect().await;
    wait_for_state(&mut a_events, LinkState::Connected).await;

    a.request_remote_rx(4096, 512).await;

    // Well past the ack deadline; under the paused clock this resolves as
    // soon as the deadline fires.
    let reason = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match a_events.recv().await.expect("session closed its event stream") {
                SessionEvent::TestFailed(reason) => break reason,
                SessionEvent::State(_) => {}
                other => panic!("unexpected event while awaiting the deadline: {:?}", other),
            }
        }
    })
    .await
    .expect("the ack deadline never fired");
    assert_eq!(reason, "timed out waiting for START_ACK");
    drop(silent);
}

#[tokio::test]
async fn bounded_send_streams_payload_to_a_chatting_peer() {
    let (a, mut a_events, _b, mut b_events) = session_pair().await;
    let target = 16_384u64;

    a.start_test(TestConfig::bounded_tx(target)).await;

    // The peer never left chat mode, so the payload surfaces as inbound
    // data there.
    let drained = tokio::spawn(async move {
        let mut total = 0u64;
        while total < target {
            if let SessionEvent::Inbound(data) = next_event(&mut b_events).await {
                total += data.len() as u64;
            }
        }
        total
    });

    let report = wait_finished(&mut a_events).await;
    assert_eq!(report.tx_total_bytes, target);
    assert_eq!(drained.await.unwrap(), target);
}

#[tokio::test]
async fn stop_ends_a_run_with_a_partial_report() {
    let (a, mut a_events, _b, mut b_events) = session_pair().await;

    a.start_test(TestConfig::free_running(Duration::from_secs(10)))
        .await;
    tokio::spawn(async move { while b_events.recv().await.is_some() {} });

    tokio::time::sleep(Duration::from_millis(150)).await;
    a.stop_test().await;

    let report = wait_finished(&mut a_events).await;
    assert!(report.elapsed_ms < 10_000);
    assert!(report.tx_total_bytes > 0);
}

#[tokio::test]
async fn disconnect_mid_run_discards_the_report() {
    let (a, mut a_events, _b, mut b_events) = session_pair().await;

    a.start_test(TestConfig::free_running(Duration::from_secs(10)))
        .await;
    tokio::spawn(async move { while b_events.recv().await.is_some() {} });

    tokio::time::sleep(Duration::from_millis(100)).await;
    a.disconnect().await;
    wait_for_state(&mut a_events, LinkState::Closed).await;

    // The abandoned run must not surface a report after the teardown.
    let leaked = tokio::time::timeout(Duration::from_millis(700), async {
        loop {
            match a_events.recv().await {
                Some(SessionEvent::TestFinished(_)) | Some(SessionEvent::TestFailed(_)) => break,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "abandoned run surfaced a report");
}

#[tokio::test]
async fn peer_disconnect_surfaces_as_closed() {
    let (_a, mut a_events, b, mut b_events) = session_pair().await;

    b.disconnect().await;
    wait_for_state(&mut b_events, LinkState::Closed).await;
    wait_for_state(&mut a_events, LinkState::Closed).await;
}
