use std::time::{Duration, Instant};

use gsp_rpc::doorbell::NoDoorbell;
use gsp_rpc::queue::{Endpoint, QueueTransport};
use gsp_rpc::shmem::SharedRegion;
use gsp_rpc::sim::{self, GspPeer, Reply};
use gsp_rpc::{Device, Function, RpcError, RpcMessage, TransportConfig};

const SLACK: Duration = Duration::from_secs(1);

fn config(timeout_ms: u64) -> TransportConfig {
    TransportConfig {
        page_size: 64,
        cmd_queue_bytes: 5 * 64,
        status_queue_bytes: 5 * 64,
        timeout_ms,
        quiet: true,
        ..TransportConfig::default()
    }
}

fn attach(config: &TransportConfig) -> (SharedRegion, Device<QueueTransport<NoDoorbell>>) {
    let region = SharedRegion::new(config.layout().unwrap(), 0);
    let transport = QueueTransport::from_config(Endpoint::cpu(&region), NoDoorbell, config);
    let device = Device::attach(3, transport, config.clone()).unwrap();
    (region, device)
}

#[test]
fn missing_response_times_out_near_the_deadline() {
    let config = config(100);
    let (_region, device) = attach(&config);

    let start = Instant::now();
    let err = device
        .lock()
        .unwrap()
        .call(RpcMessage::new(Function::ALLOC_ROOT, Vec::new()))
        .unwrap_err();
    let elapsed = start.elapsed();

    let RpcError::Timeout(timeout) = err else {
        panic!("expected a timeout, got {err}");
    };
    assert_eq!(timeout.timeout, Duration::from_millis(100));
    assert!(timeout.elapsed >= timeout.timeout);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(100) + SLACK, "took {elapsed:?}");
}

#[test]
fn full_queue_reports_busy() {
    let config = config(50);
    let (_region, device) = attach(&config);
    let mut rpc = device.lock().unwrap();

    // Four slots, one always empty: three single-slot messages fit.
    for _ in 0..3 {
        rpc.call_async(&RpcMessage::new(Function::NOP, Vec::new())).unwrap();
    }
    let start = Instant::now();
    let err = rpc.call_async(&RpcMessage::new(Function::NOP, Vec::new())).unwrap_err();
    assert!(matches!(err, RpcError::Busy));
    assert!(!err.is_fatal());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn late_response_is_skipped_by_the_next_call() {
    let config = config(100);
    let (region, device) = attach(&config);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap().with_handler(|req| {
        if req.function == Function::ALLOC_ROOT {
            std::thread::sleep(Duration::from_millis(300));
        }
        Reply::Default
    }));

    let mut rpc = device.lock().unwrap();
    let err = rpc
        .call(RpcMessage::new(Function::ALLOC_ROOT, Vec::new()))
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    // The stale ALLOC_ROOT answer goes to the event sink, not to this call.
    std::thread::sleep(Duration::from_millis(300));
    let resp = rpc
        .call(RpcMessage::new(Function::ALLOC_OBJECT, vec![5]))
        .unwrap();
    assert_eq!(resp.function, Function::ALLOC_OBJECT);
    assert_eq!(resp.body, vec![5]);
    drop(rpc);
    peer.stop().unwrap();
}
