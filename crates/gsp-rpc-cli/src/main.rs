use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use gsp_rpc::doorbell::{
    Aperture, BufferDescriptor, DoorbellChannel, DoorbellPages, DoorbellToken, NoDoorbell, SetupBuffers,
    SizeClass,
};
use gsp_rpc::hibernation::{HibernationBuffer, HibernationStream};
use gsp_rpc::layout::RpcHeader;
use gsp_rpc::queue::{Endpoint, QueueTransport};
use gsp_rpc::records::{AllocMemory, PteDesc, RmControl};
use gsp_rpc::shmem::SharedRegion;
use gsp_rpc::sim::{self, GspPeer, PluginPeer};
use gsp_rpc::version::{ProtocolVersion, UnloadRequest, CURRENT_VERSION, MIN_SUPPORTED_VERSION};
use gsp_rpc::{Device, Function, RpcEngine, RpcMessage, TransportConfig};
use tracing_subscriber::EnvFilter;

/// Bus address the simulated shared region claims to live at.
const REGION_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Parser)]
#[command(name = "gsp-rpc", version, about = "Drive the GSP RPC transport against a software peer")]
struct Cli {
    /// JSON transport configuration. `GSP_RPC_*` variables override its fields.
    #[arg(long, env = "GSP_RPC_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Attach a device to a simulated GSP over the command and status queues.
    Loopback(LoopbackArgs),
    /// Talk to a simulated vGPU plugin over the doorbell pages.
    Doorbell(DoorbellArgs),
}

#[derive(Debug, clap::Args)]
struct LoopbackArgs {
    /// Number of RM control round trips.
    #[arg(long, default_value_t = 16)]
    calls: u32,

    /// Parameter bytes per RM control; anything past one element goes out as continuation records.
    #[arg(long, default_value_t = 256)]
    params_bytes: usize,

    /// Bytes of simulated firmware state pushed through the hibernation stream.
    #[arg(long, default_value_t = 1 << 20)]
    hibernation_bytes: usize,

    /// Protocol version the simulated GSP speaks (hex `MAJOR.MINOR`).
    #[arg(long, default_value = "2A.01", value_parser = parse_version)]
    peer_version: ProtocolVersion,
}

#[derive(Debug, clap::Args)]
struct DoorbellArgs {
    /// Number of echo calls.
    #[arg(long, default_value_t = 8)]
    calls: u32,

    /// Size of each doorbell page.
    #[arg(long, default_value_t = 4096)]
    page_size: usize,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Loopback(args) => loopback(&config, &args),
        Commands::Doorbell(args) => doorbell(&config, &args),
    }
}

fn load_config(path: Option<&Path>) -> Result<TransportConfig> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            TransportConfig::from_json(&text).with_context(|| format!("parse {}", path.display()))?
        }
        None => TransportConfig::default(),
    };
    config
        .apply_overrides(|key| std::env::var(key).ok())
        .context("apply GSP_RPC_* overrides")?;
    config.validate().context("invalid transport configuration")?;
    Ok(config)
}

fn parse_version(s: &str) -> Result<ProtocolVersion> {
    let (major, minor) = s
        .split_once('.')
        .ok_or_else(|| anyhow!("expected MAJOR.MINOR, got {s:?}"))?;
    Ok(ProtocolVersion::new(
        u32::from_str_radix(major, 16).with_context(|| format!("major version {major:?}"))?,
        u32::from_str_radix(minor, 16).with_context(|| format!("minor version {minor:?}"))?,
    ))
}

fn loopback(config: &TransportConfig, args: &LoopbackArgs) -> Result<()> {
    let layout = config.layout()?;
    let region = SharedRegion::new(layout, REGION_BASE);
    let hib_size = u32::try_from(config.hibernation.buffer_bytes).context("hibernation buffer size")?;
    let hib = HibernationBuffer::new(hib_size);
    let saved_state: Vec<u8> = (0..args.hibernation_bytes).map(|i| (i % 251) as u8).collect();

    let peer = GspPeer::new(&region, config)?
        .with_version(args.peer_version)
        .with_hibernation(hib.clone(), saved_state.clone());
    let peer = sim::spawn(peer);

    let transport = QueueTransport::from_config(Endpoint::cpu(&region), NoDoorbell, config);
    let device = Device::attach(0, transport, config.clone())?;
    tracing::info!(
        total_bytes = layout.total_bytes,
        cmdq_slots = layout.cmdq.slots,
        statq_slots = layout.statq.slots,
        "shared region ready"
    );

    let stream = HibernationStream::new(hib, config.hibernation.timeout());
    let result = run_loopback(&device, &stream, &saved_state, args);
    let peer = peer.stop().map_err(|_| anyhow!("GSP peer thread panicked"))?;
    result?;

    tracing::info!(requests = peer.served().len(), "GSP peer finished");
    if config.meter {
        for entry in device.meter_entries()? {
            let micros = entry.duration().map(|d| d.as_micros()).unwrap_or_default();
            println!("{:<32} {micros:>8} us", entry.function.to_string());
        }
    }
    device.detach()?;
    Ok(())
}

fn run_loopback(
    device: &Device<QueueTransport<NoDoorbell>>,
    stream: &HibernationStream,
    saved_state: &[u8],
    args: &LoopbackArgs,
) -> Result<()> {
    let mut rpc = device.lock()?;
    let interface = rpc
        .negotiate_version(CURRENT_VERSION, MIN_SUPPORTED_VERSION, env!("CARGO_PKG_VERSION"))
        .context("version handshake")?;
    tracing::info!(?interface, capacity = rpc.record_capacity(), "attached");

    for i in 0..args.calls {
        let ctrl = RmControl {
            h_client: 0xc1d0_0000 | i,
            h_object: 0x2080_0000,
            cmd: 0x2080_0100 + i,
            params: (0..args.params_bytes).map(|b| (b as u32 ^ i) as u8).collect(),
        };
        let answer = rpc.rm_control(&ctrl).with_context(|| format!("RM control {i}"))?;
        ensure!(answer == ctrl, "RM control {i} came back altered");
    }

    rpc.alloc_memory(&AllocMemory {
        h_client: 0xc1d0_0000,
        h_device: 0xcaf0_0000,
        h_memory: 0xcaf0_0001,
        h_class: 0x3e,
        flags: 0,
        pte_desc: PteDesc::contiguous(0x8000_0000, 1024),
    })
    .context("alloc memory")?;
    rpc.call_async(&RpcMessage::new(Function::LOG, b"loopback".to_vec()))?;

    let saved = rpc.save_hibernation_data(stream).context("save hibernation data")?;
    if saved != saved_state {
        bail!("saved {} bytes, expected {}", saved.len(), saved_state.len());
    }
    rpc.restore_hibernation_data(stream, &saved)
        .context("restore hibernation data")?;

    rpc.unload_guest_driver(&UnloadRequest {
        in_pm_transition: true,
        gc6_entering: false,
        new_pm_level: 3,
    })?;
    tracing::info!(calls = args.calls, hibernation_bytes = saved.len(), "loopback complete");
    Ok(())
}

fn doorbell(config: &TransportConfig, args: &DoorbellArgs) -> Result<()> {
    let pages = DoorbellPages::new(args.page_size, SizeClass::Size4K).context("doorbell pages")?;
    let (plugin, bell) = PluginPeer::new(pages.clone());
    let plugin = sim::spawn(plugin);

    let channel = DoorbellChannel::new(pages, bell, config.timeout());
    let result = run_doorbell(channel, config, args);
    let plugin = plugin.stop().map_err(|_| anyhow!("plugin thread panicked"))?;
    result?;

    tracing::info!(
        requests = plugin.served().len(),
        setup = ?plugin.setup_buffers(),
        "doorbell run complete"
    );
    Ok(())
}

fn run_doorbell(
    mut channel: DoorbellChannel<Sender<DoorbellToken>>,
    config: &TransportConfig,
    args: &DoorbellArgs,
) -> Result<()> {
    channel.setup(&setup_buffers()?).context("doorbell setup")?;
    let mut rpc = RpcEngine::new(channel, config.clone())?;
    let max_body = rpc.record_capacity() - RpcHeader::SIZE_BYTES;
    for i in 0..args.calls {
        let body = vec![i as u8; (i as usize * 7) % (max_body + 1)];
        let resp = rpc.call(RpcMessage::new(Function::ALLOC_OBJECT, body.clone()))?;
        ensure!(resp.body == body, "doorbell call {i} came back altered");
    }
    Ok(())
}

fn setup_buffers() -> Result<SetupBuffers> {
    Ok(SetupBuffers {
        message_buffer: BufferDescriptor::new(0x10_0000, Aperture::SysMem, SizeClass::Size4K)?,
        shared_memory: BufferDescriptor::new(0x20_0000, Aperture::SysMem, SizeClass::Size2M)?,
        event_ring: BufferDescriptor::new(0x40_0000, Aperture::SysMem, SizeClass::Size128K)?,
        debug_buffer: BufferDescriptor::new(0x50_0000, Aperture::SysMem, SizeClass::Size4K)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_argument_is_hex() {
        assert_eq!(parse_version("1F.07").unwrap(), ProtocolVersion::new(0x1F, 0x07));
        assert!(parse_version("1F").is_err());
        assert!(parse_version("zz.01").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["gsp-rpc", "loopback", "--calls", "3", "--peer-version", "1C.04"]);
        match cli.command {
            Commands::Loopback(args) => {
                assert_eq!(args.calls, 3);
                assert_eq!(args.peer_version, ProtocolVersion::new(0x1C, 0x04));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
