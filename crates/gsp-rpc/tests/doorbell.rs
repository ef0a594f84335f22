use std::time::Duration;

use gsp_rpc::doorbell::{
    Aperture, BufferDescriptor, DoorbellChannel, DoorbellPages, NoDoorbell, SetupBuffers, SizeClass,
};
use gsp_rpc::error::TransportFault;
use gsp_rpc::sim::{self, PluginPeer, Reply};
use gsp_rpc::{Function, RpcEngine, RpcError, RpcMessage, TransportConfig};
use pretty_assertions::assert_eq;

const TIMEOUT: Duration = Duration::from_secs(2);

fn buffers() -> SetupBuffers {
    let sys = |addr| BufferDescriptor::new(addr, Aperture::SysMem, SizeClass::Size4K).unwrap();
    SetupBuffers {
        message_buffer: sys(0x10_0000),
        shared_memory: BufferDescriptor::new(0x20_0000, Aperture::FbMem, SizeClass::Size2M)
            .unwrap()
            .with_alias(0xd000_0000),
        event_ring: sys(0x30_0000),
        debug_buffer: BufferDescriptor::new(0x40_0000, Aperture::SysMem, SizeClass::Size128K).unwrap(),
    }
}

#[test]
fn setup_then_calls_through_the_plugin() {
    let pages = DoorbellPages::new(4096, SizeClass::Size4K).unwrap();
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin.with_handler(|req| match req.function {
        Function::FREE => Reply::Respond(RpcMessage::response(Function::FREE, 0x1f, Vec::new())),
        _ => Reply::Default,
    }));

    let mut channel = DoorbellChannel::new(pages, bell, TIMEOUT);
    channel.setup(&buffers()).unwrap();
    assert!(channel.is_setup());

    let mut rpc = RpcEngine::new(channel, TransportConfig::default()).unwrap();
    assert_eq!(rpc.record_capacity(), 4096 - 16);

    let resp = rpc
        .call(RpcMessage::new(Function::ALLOC_OBJECT, b"object".to_vec()))
        .unwrap();
    assert_eq!(resp.body, b"object");

    // The async response is discarded before the next request reuses the page.
    rpc.call_async(&RpcMessage::new(Function::LOG, b"note".to_vec()))
        .unwrap();
    let err = rpc.call(RpcMessage::new(Function::FREE, Vec::new())).unwrap_err();
    assert!(matches!(err, RpcError::Peer { code: 0x1f, .. }));

    let plugin = plugin.stop().unwrap();
    assert_eq!(plugin.setup_buffers(), Some(&buffers()));
    assert_eq!(
        plugin.served(),
        &[Function::ALLOC_OBJECT, Function::LOG, Function::FREE]
    );
}

#[test]
fn messages_before_setup_are_refused() {
    let pages = DoorbellPages::new(4096, SizeClass::Size4K).unwrap();
    let channel = DoorbellChannel::new(pages, NoDoorbell, TIMEOUT);
    let mut rpc = RpcEngine::new(channel, TransportConfig::default()).unwrap();

    let err = rpc.call(RpcMessage::new(Function::NOP, Vec::new())).unwrap_err();
    assert!(matches!(err, RpcError::InvalidState(_)));
}

#[test]
fn rejected_setup_is_reported() {
    let pages = DoorbellPages::new(4096, SizeClass::Size4K).unwrap();
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin.with_setup_status(0x22));

    let mut channel = DoorbellChannel::new(pages, bell, TIMEOUT);
    let err = channel.setup(&buffers()).unwrap_err();
    assert!(matches!(err, RpcError::SetupRejected { status: 0x22 }));
    assert!(!channel.is_setup());

    let plugin = plugin.stop().unwrap();
    assert!(plugin.setup_buffers().is_none());
}

#[test]
fn silent_plugin_times_out_setup() {
    let pages = DoorbellPages::new(4096, SizeClass::Size4K).unwrap();
    let mut channel = DoorbellChannel::new(pages, NoDoorbell, Duration::from_millis(20));
    let err = channel.setup(&buffers()).unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
}

#[test]
fn records_are_bounded_by_the_message_buffer() {
    // Response page larger than the 4 KiB message buffer.
    let pages = DoorbellPages::new(8192, SizeClass::Size4K).unwrap();
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin);

    let mut channel = DoorbellChannel::new(pages, bell, TIMEOUT);
    channel.setup(&buffers()).unwrap();
    assert_eq!(channel.message_buffer(), Some(&buffers().message_buffer));
    let mut rpc = RpcEngine::new(channel, TransportConfig::default()).unwrap();
    assert_eq!(rpc.record_capacity(), 4096);

    let err = rpc
        .call_async(&RpcMessage::new(Function::NOP, vec![0; 4096 - 16 + 1]))
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Transport(TransportFault::RecordTooLarge { len: 4097, max: 4096 })
    ));
    let resp = rpc.call(RpcMessage::new(Function::NOP, vec![7; 4096 - 16])).unwrap();
    assert_eq!(resp.body, vec![7; 4096 - 16]);

    let plugin = plugin.stop().unwrap();
    assert_eq!(plugin.served(), &[Function::NOP]);
}

#[test]
fn setup_must_describe_the_mapped_message_buffer() {
    let pages = DoorbellPages::new(4096, SizeClass::Size128K).unwrap();
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin);

    let mut channel = DoorbellChannel::new(pages, bell, TIMEOUT);
    let err = channel.setup(&buffers()).unwrap_err();
    assert!(matches!(err, RpcError::Config(_)));
    assert!(!channel.is_setup());

    let plugin = plugin.stop().unwrap();
    assert!(plugin.setup_buffers().is_none());
}

#[test]
fn plugin_rejection_is_a_peer_error() {
    let pages = DoorbellPages::new(4096, SizeClass::Size4K).unwrap();
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin.with_handler(|req| match req.function {
        Function::ALLOC_MEMORY => Reply::Reject(0x33),
        _ => Reply::Default,
    }));

    let mut channel = DoorbellChannel::new(pages, bell, TIMEOUT);
    channel.setup(&buffers()).unwrap();
    let mut rpc = RpcEngine::new(channel, TransportConfig::default()).unwrap();

    let err = rpc
        .call(RpcMessage::new(Function::ALLOC_MEMORY, vec![1, 2]))
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Peer { function: Function::ALLOC_MEMORY, code: 0x33 }
    ));
    assert!(!err.is_fatal());

    // The channel keeps working after a rejection.
    let resp = rpc.call(RpcMessage::new(Function::ALLOC_OBJECT, vec![3])).unwrap();
    assert_eq!(resp.body, vec![3]);

    let plugin = plugin.stop().unwrap();
    assert_eq!(plugin.served(), &[Function::ALLOC_MEMORY, Function::ALLOC_OBJECT]);
}
