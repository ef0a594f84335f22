use std::sync::mpsc;

use gsp_rpc::doorbell::NoDoorbell;
use gsp_rpc::message::RESULT_SUCCESS;
use gsp_rpc::queue::{Endpoint, QueueTransport};
use gsp_rpc::shmem::SharedRegion;
use gsp_rpc::sim::{self, GspPeer, Reply, RESULT_VERSION_MISMATCH};
use gsp_rpc::version::{
    encode_version, GuestInfo, ProtocolVersion, RpcInterface, UnloadRequest, CURRENT_VERSION,
    MIN_SUPPORTED_VERSION, PM_LEVEL_VERSION,
};
use gsp_rpc::{Device, Function, RpcError, RpcMessage, TransportConfig};
use pretty_assertions::assert_eq;

const DRIVER: &str = "570.86";

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
    let region = SharedRegion::new(config.layout().unwrap(), 0x2000_0000);
    let transport = QueueTransport::from_config(Endpoint::cpu(&region), NoDoorbell, config);
    let device = Device::attach(1, transport, config.clone()).unwrap();
    (region, device)
}

fn handshake_reply(private: u32, version: ProtocolVersion) -> Reply {
    Reply::Respond(RpcMessage {
        function: Function::SET_GUEST_SYSTEM_INFO,
        rpc_result: RESULT_SUCCESS,
        rpc_result_private: private,
        body: encode_version(version),
    })
}

#[test]
fn same_version_agrees_first_time() {
    let config = config();
    let (region, device) = attach(&config);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap());

    let mut rpc = device.lock().unwrap();
    let interface = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap();
    assert_eq!(interface, RpcInterface::PmLevel);
    assert_eq!(rpc.context().handshake().version(), Some(CURRENT_VERSION));
    drop(rpc);

    let peer = peer.stop().unwrap();
    assert_eq!(peer.served(), &[Function::SET_GUEST_SYSTEM_INFO]);
}

#[test]
fn older_supported_peer_gets_exactly_one_retry() {
    let config = config();
    let (region, device) = attach(&config);
    let older = ProtocolVersion::new(0x1C, 0x04);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap().with_version(older));

    let mut rpc = device.lock().unwrap();
    let interface = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap();
    assert_eq!(interface, RpcInterface::Base);
    assert_eq!(rpc.context().handshake().version(), Some(older));
    drop(rpc);

    let peer = peer.stop().unwrap();
    assert_eq!(
        peer.served(),
        &[Function::SET_GUEST_SYSTEM_INFO, Function::SET_GUEST_SYSTEM_INFO]
    );
}

#[test]
fn newer_peer_gets_exactly_one_retry() {
    let config = config();
    let (region, device) = attach(&config);
    let newer = ProtocolVersion::new(CURRENT_VERSION.major + 1, 0x00);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap().with_version(newer));

    let mut rpc = device.lock().unwrap();
    let interface = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap();
    assert_eq!(interface, RpcInterface::PmLevel);
    assert_eq!(rpc.context().handshake().version(), Some(newer));
    drop(rpc);

    let peer = peer.stop().unwrap();
    assert_eq!(
        peer.served(),
        &[Function::SET_GUEST_SYSTEM_INFO, Function::SET_GUEST_SYSTEM_INFO]
    );
}

#[test]
fn too_old_peer_fails_the_instance() {
    let config = config();
    let (region, device) = attach(&config);
    let ancient = ProtocolVersion::new(0x02, 0x00);
    let peer = sim::spawn(GspPeer::new(&region, &config).unwrap().with_version(ancient));

    let mut rpc = device.lock().unwrap();
    let err = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::VersionTooOld { peer, min } if peer == ancient && min == MIN_SUPPORTED_VERSION
    ));
    assert!(rpc.context().handshake().is_failed());

    // Nothing else leaves the CPU once the handshake failed.
    let err = rpc.call(RpcMessage::new(Function::NOP, Vec::new())).unwrap_err();
    assert!(matches!(err, RpcError::HandshakeFailed));
    let err = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap_err();
    assert!(matches!(err, RpcError::HandshakeFailed));
    drop(rpc);

    let peer = peer.stop().unwrap();
    assert_eq!(peer.served(), &[Function::SET_GUEST_SYSTEM_INFO]);
}

#[test]
fn peer_that_keeps_moving_fails_after_the_retry() {
    let config = config();
    let (region, device) = attach(&config);
    let mut answers = 0x20u32;
    let gsp = GspPeer::new(&region, &config).unwrap().with_handler(move |req| {
        if req.function != Function::SET_GUEST_SYSTEM_INFO {
            return Reply::Default;
        }
        answers += 1;
        handshake_reply(RESULT_VERSION_MISMATCH, ProtocolVersion::new(answers, 0))
    });
    let peer = sim::spawn(gsp);

    let err = device
        .lock()
        .unwrap()
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap_err();
    assert!(matches!(err, RpcError::HandshakeFailed));

    let peer = peer.stop().unwrap();
    assert_eq!(peer.served().len(), 2);
}

#[test]
fn version_change_across_resume_is_rejected() {
    let config = config();
    let (region, device) = attach(&config);
    let mut calls = 0;
    let gsp = GspPeer::new(&region, &config).unwrap().with_handler(move |req| {
        if req.function != Function::SET_GUEST_SYSTEM_INFO {
            return Reply::Default;
        }
        calls += 1;
        match calls {
            // After "resume" the peer only speaks 1F.07.
            2 => handshake_reply(RESULT_VERSION_MISMATCH, PM_LEVEL_VERSION),
            _ => {
                let guest = GuestInfo::decode(&req.body).unwrap();
                handshake_reply(RESULT_SUCCESS, guest.version)
            }
        }
    });
    let peer = sim::spawn(gsp);

    let mut rpc = device.lock().unwrap();
    rpc.negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap();
    let err = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidState(_)));
    assert_eq!(rpc.context().handshake().version(), Some(CURRENT_VERSION));
    drop(rpc);

    peer.stop().unwrap();
}

#[test]
fn unload_uses_the_negotiated_layout() {
    let config = config();
    let (region, device) = attach(&config);
    let (seen_tx, seen_rx) = mpsc::channel();
    let gsp = GspPeer::new(&region, &config)
        .unwrap()
        .with_version(ProtocolVersion::new(0x1F, 0x06))
        .with_handler(move |req| {
            if req.function == Function::UNLOADING_GUEST_DRIVER {
                seen_tx.send(req.body.clone()).unwrap();
            }
            Reply::Default
        });
    let peer = sim::spawn(gsp);

    let req = UnloadRequest {
        in_pm_transition: true,
        gc6_entering: true,
        new_pm_level: 2,
    };
    let mut rpc = device.lock().unwrap();
    let err = rpc.unload_guest_driver(&req).unwrap_err();
    assert!(matches!(err, RpcError::InvalidState(_)));

    let interface = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, DRIVER)
        .unwrap();
    assert_eq!(interface, RpcInterface::Base);
    rpc.unload_guest_driver(&req).unwrap();
    drop(rpc);

    // The pre-1F.07 layout has no power level word.
    assert_eq!(seen_rx.recv().unwrap(), vec![1, 0, 0, 0, 1, 0, 0, 0]);
    peer.stop().unwrap();
}
