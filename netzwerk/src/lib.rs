//! Network handler: wires up the single interface a container gets,
//! either bridged onto the host's main NIC or split off it via
//! macvtap, following the original implementation's `network_linux.go`.
//!
//! The handler trait in `llif` is synchronous; `rtnetlink` is not. Each
//! public entry point opens a short-lived current-thread runtime via
//! `block_on` rather than threading an executor through the handler
//! pipeline.

mod macvtap;
mod netlink;
mod tun;

use std::{future::Future, net::Ipv4Addr};

use anyhow::{anyhow, Context, Error};
use bundle::NetworkMode;
use fehler::throws;
use ipnetwork::Ipv4Network;
use llif::{HState, Input, NetworkHandler};

use netlink::Netlink;

/// Master NIC the bridge enslaves and the macvtap parent link attaches
/// to. Hardcoded rather than discovered, mirroring the original
/// implementation's assumption of a single `eth0`-named primary
/// interface inside the network namespace the runtime operates in.
const MASTER_NIC: &str = "eth0";
const BRIDGE_NAME: &str = "br0";

/// Overwritten onto the master NIC once it's enslaved to the bridge, so
/// the container's tap interface can claim the NIC's original address
/// without a MAC collision on the wire. Matches the fixed value the
/// original implementation hardcodes in `network_linux.go`.
const BRIDGE_MASTER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start netzwerk's single-threaded runtime")
        .block_on(future)
}

pub struct Handler;

impl NetworkHandler for Handler {
    #[throws]
    fn create(&self, input: &Input) -> HState {
        block_on(create(input))?
    }

    #[throws]
    fn run(&self, input: &Input) -> HState {
        block_on(run(input))?
    }

    #[throws]
    fn destroy(&self, input: &Input) -> HState {
        block_on(destroy(input))?
    }
}

#[throws]
async fn create(input: &Input) -> HState {
    tun::ensure_tun_device()?;

    let name = tun::tap_name(&input.container_id);
    tun::create_tap_device(&name)?;

    HState::default().with_option("TapName", &name)
}

#[throws]
async fn run(input: &Input) -> HState {
    let name = input
        .net_state
        .option("TapName")
        .ok_or_else(|| anyhow!("network state is missing TapName; create phase didn't run"))?
        .to_owned();

    let netlink = Netlink::connect().await?;

    let info = match input.config.network_mode() {
        NetworkMode::Bridge => setup_bridge(&netlink, &name).await?,
        NetworkMode::Macvtap => setup_macvtap(&netlink, &name).await?,
    };

    let mut state = input.net_state.clone();
    if let Some(address) = info.address {
        state = state.with_option("IPAddress", address.to_string());
    }
    if let Some(gateway) = info.gateway {
        state = state.with_option("Gateway", gateway.to_string());
    }
    if let Some(mask) = info.mask {
        state = state.with_option("IPMask", mask.to_string());
    }
    if let Some(mac) = info.mac {
        state = state.with_option("Mac", format_mac(mac));
    }

    state
}

#[derive(Default)]
struct LinkInfo {
    address: Option<Ipv4Addr>,
    gateway: Option<Ipv4Addr>,
    mask: Option<u8>,
    mac: Option<[u8; 6]>,
}

fn format_mac(mac: [u8; 6]) -> String {
    mac.iter().map(|byte| format!("{:02x}", byte)).collect::<Vec<_>>().join(":")
}

#[throws]
async fn setup_bridge(netlink: &Netlink, tap: &str) -> LinkInfo {
    let master_index = netlink.link_index(MASTER_NIC).await?;

    let bridge_index = if netlink.link_exists(BRIDGE_NAME).await {
        netlink.link_index(BRIDGE_NAME).await?
    } else {
        netlink.add_bridge(BRIDGE_NAME).await?
    };

    let tap_index = netlink.link_index(tap).await?;

    // Harvest the master's address before enslaving it: once it's a
    // bridge port its own address becomes meaningless and gets
    // replaced with the well-known one below.
    let harvested = netlink.first_address(master_index).await.ok();
    let gateway = netlink.default_gateway(master_index).await.ok();

    netlink.flush_addresses(master_index).await?;
    netlink.set_master(master_index, bridge_index).await?;
    netlink.set_hardware_address(master_index, BRIDGE_MASTER_MAC).await?;

    netlink.set_link_up(bridge_index).await?;
    netlink.set_link_up(master_index).await?;

    netlink.set_master(tap_index, bridge_index).await?;
    netlink.set_link_up(tap_index).await?;

    let mut mask = None;

    if let Some(info) = &harvested {
        let prefix = widen_slash_32(info.prefix);
        mask = Some(prefix);
        let network = Ipv4Network::new(info.address, prefix).context("building tap address")?;

        netlink.add_address(bridge_index, network).await?;
    }

    if let Some(gateway) = gateway {
        netlink.add_default_route(bridge_index, gateway).await?;
    }

    LinkInfo {
        address: harvested.map(|info| info.address),
        gateway,
        mask,
        mac: None,
    }
}

#[throws]
async fn setup_macvtap(netlink: &Netlink, tap: &str) -> LinkInfo {
    macvtap::create_macvtap_device(netlink, tap, MASTER_NIC).await?;

    let master_index = netlink.link_index(MASTER_NIC).await?;
    let tap_index = netlink.link_index(tap).await?;

    let harvested = netlink.first_address(master_index).await.ok();
    let gateway = netlink.default_gateway(master_index).await.ok();
    let mac = netlink.hardware_address(tap_index).await.ok();

    LinkInfo {
        address: harvested.map(|info| info.address),
        gateway,
        mask: harvested.map(|info| widen_slash_32(info.prefix)),
        mac,
    }
}

/// `/32` addresses have no room for a gateway route to attach to;
/// rewriting to `/1` is the same workaround `network_linux.go` applies
/// so the tap side can still reach the harvested gateway. Applies to
/// both the bridge and macvtap paths -- either one can harvest a
/// `/32` off the master NIC.
fn widen_slash_32(prefix: u8) -> u8 {
    if prefix == 32 {
        1
    } else {
        prefix
    }
}

#[throws]
async fn destroy(input: &Input) -> HState {
    if let Some(name) = input.net_state.option("TapName") {
        let netlink = Netlink::connect().await?;
        netlink.delete_link(name).await?;
    }

    HState::default()
}

/// Exposed for the monitor handler, which needs the tap name to pass
/// on the unikernel command line, and for `store`'s kill/delete paths
/// that clean up network state without re-deriving it.
pub fn tap_name(container_id: &str) -> String {
    tun::tap_name(container_id)
}
