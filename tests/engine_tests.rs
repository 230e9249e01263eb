//! End-to-end engine runs over an in-process duplex pipe.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use sppbench::link::{Endpoint, EndpointReader};
use sppbench::speed::{
    self, EngineError, PayloadPattern, Progress, ProgressFn, TestConfig, TestLimit, TestMode,
    ThroughputSample, BOUNDED_RUN_GUARD,
};

fn pair() -> (Endpoint, Endpoint) {
    let (a, b) = tokio::io::duplex(512 * 1024);
    (Endpoint::open(Box::new(a)), Endpoint::open(Box::new(b)))
}

fn capture(samples: Arc<Mutex<Vec<ThroughputSample>>>) -> ProgressFn {
    Box::new(move |progress| {
        if let Progress::Sample(sample) = progress {
            samples.lock().push(sample);
        }
    })
}

async fn read_exactly(reader: &mut EndpointReader, n: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(n);
    let mut buf = vec![0u8; n];
    while out.len() < n {
        let got = reader.read_chunk(&mut buf[..n - out.len()]).await.unwrap();
        assert!(got > 0, "stream ended early");
        out.extend_from_slice(&buf[..got]);
    }
    out
}

#[tokio::test]
async fn duplex_run_moves_bytes_both_ways() {
    let (a, b) = pair();
    let mut config = TestConfig::free_running(Duration::from_millis(500));
    config.verify = true;

    let peer = tokio::spawn(speed::run(
        b,
        TestConfig::free_running(Duration::from_millis(500)),
        None,
        CancellationToken::new(),
    ));

    let samples = Arc::new(Mutex::new(Vec::new()));
    let done = speed::run(
        a,
        config,
        Some(capture(samples.clone())),
        CancellationToken::new(),
    )
    .await;

    let report = done.outcome.unwrap();
    assert!(done.endpoint.is_some());
    assert!(report.tx_total_bytes > 0);
    assert!(report.rx_total_bytes > 0);
    assert!(report.elapsed_ms >= 500);

    // Samples are cumulative and monotonic, and the last one carries the
    // exact totals the report does.
    let samples = samples.lock();
    assert!(!samples.is_empty());
    for window in samples.windows(2) {
        assert!(window[1].elapsed_ms >= window[0].elapsed_ms);
        assert!(window[1].tx_total_bytes >= window[0].tx_total_bytes);
        assert!(window[1].rx_total_bytes >= window[0].rx_total_bytes);
    }
    let last = samples.last().unwrap();
    assert_eq!(last.tx_total_bytes, report.tx_total_bytes);
    assert_eq!(last.rx_total_bytes, report.rx_total_bytes);

    // Averages anchor at the first byte moved, so they can only be faster
    // than a whole-run average.
    let elapsed_secs = report.elapsed_ms as f64 / 1000.0;
    let floor = report.tx_total_bytes as f64 / elapsed_secs;
    assert!(report.tx_avg_bps >= floor * 0.999);

    let peer_done = peer.await.unwrap();
    assert!(peer_done.outcome.is_ok());
}

#[tokio::test]
async fn bounded_rx_counts_exactly_across_fragmented_writes() {
    let (a, b) = pair();
    let target = 10_000u64;

    let writer = tokio::spawn(async move {
        let mut ep = b;
        let pattern = PayloadPattern::Ramp;
        let mut offset = 0u64;
        let mut buf = vec![0u8; 700];
        while offset < target {
            let n = (target - offset).min(700) as usize;
            pattern.fill(&mut buf[..n], offset);
            ep.writer.write_chunk(&buf[..n]).await.unwrap();
            offset += n as u64;
        }
        ep
    });

    let mut config = TestConfig::bounded_rx(target);
    config.verify = true;
    let done = speed::run(a, config, None, CancellationToken::new()).await;

    let report = done.outcome.unwrap();
    assert_eq!(report.rx_total_bytes, target);
    assert_eq!(report.tx_total_bytes, 0);
    assert!(done.endpoint.is_some());
    let _ = writer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stalled_bounded_run_ends_at_the_guard() {
    let (a, b) = pair();
    let delivered = 1_000u64;

    // A fraction of the target arrives up front, then the peer goes quiet
    // with the stream still open.
    let mut peer = b;
    let mut partial = vec![0u8; delivered as usize];
    PayloadPattern::Ramp.fill(&mut partial, 0);
    peer.writer.write_chunk(&partial).await.unwrap();

    let done = speed::run(
        a,
        TestConfig::bounded_rx(1_000_000),
        None,
        CancellationToken::new(),
    )
    .await;

    // The guard ends the run with whatever actually arrived.
    let report = done.outcome.unwrap();
    assert_eq!(report.rx_total_bytes, delivered);
    assert_eq!(report.tx_total_bytes, 0);
    assert_eq!(report.elapsed_ms, BOUNDED_RUN_GUARD.as_millis() as u64);
    assert!(done.endpoint.is_some());
    drop(peer);
}

#[tokio::test]
async fn corrupt_batch_is_dropped_without_poisoning_the_count() {
    let (a, b) = pair();

    let writer = tokio::spawn(async move {
        let mut ep = b;
        // Bytes that cannot be a ramp starting at offset zero.
        ep.writer.write_chunk(&[0xAA; 512]).await.unwrap();
        // Give the receiver time to take the bad batch on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut good = vec![0u8; 4096];
        PayloadPattern::Ramp.fill(&mut good, 0);
        ep.writer.write_chunk(&good).await.unwrap();
        ep
    });

    let mut config = TestConfig::bounded_rx(4096);
    config.verify = true;
    let done = speed::run(a, config, None, CancellationToken::new()).await;

    // Only the clean batch counts, and it verifies from offset zero.
    let report = done.outcome.unwrap();
    assert_eq!(report.rx_total_bytes, 4096);
    let _ = writer.await.unwrap();
}

#[tokio::test]
async fn remote_ceremony_acks_then_signals_eof() {
    let (a, b) = pair();
    let target = 2048u64;

    let peer = tokio::spawn(async move {
        let mut ep = b;
        let ack = read_exactly(&mut ep.reader, 9).await;
        assert_eq!(&ack, b"START_ACK");

        let mut payload = vec![0u8; target as usize];
        PayloadPattern::Ramp.fill(&mut payload, 0);
        for chunk in payload.chunks(600) {
            ep.writer.write_chunk(chunk).await.unwrap();
        }

        let eof = read_exactly(&mut ep.reader, 3).await;
        assert_eq!(&eof, b"EOF");
        ep
    });

    let done = speed::run(
        a,
        TestConfig::remote_rx(target),
        None,
        CancellationToken::new(),
    )
    .await;

    let report = done.outcome.unwrap();
    assert_eq!(report.rx_total_bytes, target);
    assert!(done.endpoint.is_some());
    let _ = peer.await.unwrap();
}

#[tokio::test]
async fn failed_ready_ack_aborts_the_run() {
    let (a, b) = pair();
    // No peer: the START_ACK write has nowhere to go.
    drop(b);

    let samples = Arc::new(Mutex::new(Vec::new()));
    let done = speed::run(
        a,
        TestConfig::remote_rx(4096),
        Some(capture(samples.clone())),
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(done.outcome, Err(EngineError::Handshake)));
    assert!(done.endpoint.is_none());
    // The abort lands before any accounting, so no sample ever fired.
    assert!(samples.lock().is_empty());
}

#[tokio::test]
async fn peer_hangup_mid_run_yields_no_result() {
    let (a, b) = pair();

    let done = tokio::spawn(speed::run(
        a,
        TestConfig::free_running(Duration::from_secs(5)),
        None,
        CancellationToken::new(),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(b);

    let done = done.await.unwrap();
    assert!(done.outcome.is_err());
    assert!(done.endpoint.is_none());
}

#[tokio::test]
async fn byte_limit_applies_to_rx_in_duplex() {
    let (a, b) = pair();
    let target = 8_192u64;

    // Peer sends exactly the target, then keeps its end open until we
    // close ours.
    let peer = tokio::spawn(async move {
        let (mut reader, mut writer) = b.into_halves();
        let mut payload = vec![0u8; target as usize];
        PayloadPattern::Ramp.fill(&mut payload, 0);
        writer.write_chunk(&payload).await.unwrap();
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = reader.read_chunk(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let config = TestConfig {
        mode: TestMode::Duplex,
        limit: TestLimit::Bytes(target),
        ..TestConfig::default()
    };
    let done = speed::run(a, config, None, CancellationToken::new()).await;

    let report = done.outcome.unwrap();
    assert_eq!(report.rx_total_bytes, target);
    // The tx side ran free until the rx target ended the run.
    assert!(report.tx_total_bytes > 0);
    assert!(done.endpoint.is_some());
    drop(done.endpoint);
    peer.await.unwrap();
}
