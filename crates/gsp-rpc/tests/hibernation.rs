use std::time::{Duration, Instant};

use gsp_rpc::config::HibernationConfig;
use gsp_rpc::doorbell::NoDoorbell;
use gsp_rpc::hibernation::{HibernationBuffer, HibernationError, HibernationStream};
use gsp_rpc::queue::{Endpoint, QueueTransport};
use gsp_rpc::shmem::SharedRegion;
use gsp_rpc::sim::{self, GspPeer, RESULT_NOT_SUPPORTED};
use gsp_rpc::{Device, Function, RpcError, TransportConfig};
use pretty_assertions::assert_eq;

fn config() -> TransportConfig {
    TransportConfig {
        page_size: 64,
        cmd_queue_bytes: 9 * 64,
        status_queue_bytes: 9 * 64,
        timeout_ms: 2000,
        ..TransportConfig::default()
    }
}

fn attach(config: &TransportConfig) -> (SharedRegion, Device<QueueTransport<NoDoorbell>>) {
    let region = SharedRegion::new(config.layout().unwrap(), 0x3000_0000);
    let transport = QueueTransport::from_config(Endpoint::cpu(&region), NoDoorbell, config);
    let device = Device::attach(2, transport, config.clone()).unwrap();
    (region, device)
}

fn blob(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn save_then_restore_blobs_larger_than_the_ring() {
    let config = config();
    // size * k + r bytes through a 100 byte ring leave the cursors r bytes in,
    // however many laps k the stream took.
    for laps in [0usize, 1, 3, 7] {
        let (region, device) = attach(&config);
        let buf = HibernationBuffer::new(100);
        let saved = blob(laps * 100 + 17, 5);
        let peer = sim::spawn(
            GspPeer::new(&region, &config)
                .unwrap()
                .with_hibernation(buf.clone(), saved.clone()),
        );
        let stream = HibernationStream::new(buf.clone(), config.hibernation.timeout());

        let got = device.lock().unwrap().save_hibernation_data(&stream).unwrap();
        assert_eq!(got, saved);
        assert_eq!(buf.cursors().save_put, 17, "laps = {laps}");
        assert_eq!(buf.cursors().save_get, 17, "laps = {laps}");

        let back = blob(laps * 100 + 42, 9);
        device
            .lock()
            .unwrap()
            .restore_hibernation_data(&stream, &back)
            .unwrap();
        let cursors = buf.cursors();
        assert_eq!(cursors.restore_put, 42, "laps = {laps}");
        assert_eq!(cursors.restore_get, 42, "laps = {laps}");

        let peer = peer.stop().unwrap();
        assert_eq!(peer.restored(), back.as_slice());
        assert_eq!(
            peer.served(),
            &[Function::SAVE_HIBERNATION_DATA, Function::RESTORE_HIBERNATION_DATA]
        );
    }
}

#[test]
fn empty_save_returns_an_empty_blob() {
    let config = config();
    let (region, device) = attach(&config);
    let buf = HibernationBuffer::new(64);
    let peer = sim::spawn(
        GspPeer::new(&region, &config)
            .unwrap()
            .with_hibernation(buf.clone(), Vec::new()),
    );
    let stream = HibernationStream::new(buf, config.hibernation.timeout());

    let got = device.lock().unwrap().save_hibernation_data(&stream).unwrap();
    assert!(got.is_empty());
    peer.stop().unwrap();
}

#[test]
fn staging_limit_aborts_the_save() {
    let config = TransportConfig {
        hibernation: HibernationConfig {
            staging_initial_bytes: 16,
            staging_max_bytes: 128,
            timeout_ms: 200,
            ..HibernationConfig::default()
        },
        ..config()
    };
    let (region, device) = attach(&config);
    let buf = HibernationBuffer::new(64);
    let peer = GspPeer::new(&region, &config)
        .unwrap()
        .with_hibernation(buf.clone(), blob(1000, 1));
    let peer = sim::spawn(peer);
    let stream = HibernationStream::new(buf, config.hibernation.timeout());

    let err = device
        .lock()
        .unwrap()
        .save_hibernation_data(&stream)
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Hibernation(HibernationError::StagingOverflow { max: 128, .. })
    ));
    // The peer gives up once nobody drains the ring.
    peer.stop().unwrap();
}

#[test]
fn peer_without_hibernation_support_reports_it() {
    let config = config();
    let (region, device) = attach(&config);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap());

    // The peer never touches the ring; its answer must win over the stalled
    // stream long before the stream deadline.
    let stream = HibernationStream::new(HibernationBuffer::new(32), Duration::from_secs(5));
    let start = Instant::now();
    let err = device
        .lock()
        .unwrap()
        .save_hibernation_data(&stream)
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Peer { function: Function::SAVE_HIBERNATION_DATA, code: RESULT_NOT_SUPPORTED }
    ));
    assert!(start.elapsed() < Duration::from_secs(5));

    // Nobody drains the restore ring either, so the push stalls once it is full.
    let start = Instant::now();
    let err = device
        .lock()
        .unwrap()
        .restore_hibernation_data(&stream, &blob(200, 3))
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Peer { function: Function::RESTORE_HIBERNATION_DATA, code: RESULT_NOT_SUPPORTED }
    ));
    assert!(start.elapsed() < Duration::from_secs(5));

    // A blob that fits the ring is pushed in full, then the verdict is read.
    let err = device
        .lock()
        .unwrap()
        .restore_hibernation_data(
            &HibernationStream::new(HibernationBuffer::new(32), Duration::from_millis(50)),
            b"tiny",
        )
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Peer { code: RESULT_NOT_SUPPORTED, .. }
    ));
    peer.stop().unwrap();
}
