//! Thin async rtnetlink wrapper. The handler pipeline (`llif::NetworkHandler`)
//! is synchronous end to end, so `super::block_on` is the only place that
//! reaches into this module from outside tests.

use anyhow::{anyhow, Context, Error};
use futures_util::stream::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::rtnl::link::nlas::{Info, InfoKind, Nla};
use rtnetlink::{packet::LinkMessage, Handle};
use std::net::Ipv4Addr;

pub struct Netlink {
    handle: Handle,
}

pub struct AddressInfo {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Netlink {
    pub async fn connect() -> Result<Self, Error> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("creating netlink connection")?;
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    pub async fn link_index(&self, name: &str) -> Result<u32, Error> {
        let link = self
            .handle
            .link()
            .get()
            .set_name_filter(name.into())
            .execute()
            .try_next()
            .await
            .context("listing links")?
            .ok_or_else(|| anyhow!("no link named {}", name))?;

        Ok(link.header.index)
    }

    pub async fn link_exists(&self, name: &str) -> bool {
        self.link_index(name).await.is_ok()
    }

    pub async fn hardware_address(&self, index: u32) -> Result<[u8; 6], Error> {
        let link = self.link_message(index).await?;

        for nla in &link.nlas {
            if let Nla::Address(bytes) = nla {
                let mut mac = [0u8; 6];
                let len = bytes.len().min(6);
                mac[..len].copy_from_slice(&bytes[..len]);
                return Ok(mac);
            }
        }

        Err(anyhow!("link {} has no hardware address", index))
    }

    async fn link_message(&self, index: u32) -> Result<LinkMessage, Error> {
        self.handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_next()
            .await
            .context("getting link")?
            .ok_or_else(|| anyhow!("no link with index {}", index))
    }

    pub async fn set_link_up(&self, index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .context("setting link up")
    }

    pub async fn set_link_down(&self, index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .context("setting link down")
    }

    pub async fn set_master(&self, index: u32, master_index: u32) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .context("enslaving link to master")
    }

    pub async fn set_hardware_address(&self, index: u32, mac: [u8; 6]) -> Result<(), Error> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .context("setting hardware address")
    }

    pub async fn add_bridge(&self, name: &str) -> Result<u32, Error> {
        self.handle
            .link()
            .add()
            .bridge(name.into())
            .execute()
            .await
            .context("creating bridge")?;

        self.link_index(name).await
    }

    /// Creates a macvtap device `name` as a child of `master_index`.
    /// rtnetlink's `LinkAddRequest` only ships convenience builders for
    /// a handful of link kinds (bridge, veth, vlan, ...), not macvtap,
    /// so this pushes the `IFLA_LINKINFO`/`IFLA_LINK` NLAs by hand the
    /// same way those builders do internally.
    pub async fn add_macvtap(&self, name: &str, master_index: u32) -> Result<(), Error> {
        let mut message = LinkMessage::default();
        message.nlas.push(Nla::IfName(name.to_owned()));
        message.nlas.push(Nla::Link(master_index));
        message.nlas.push(Nla::Info(vec![Info::Kind(InfoKind::Other("macvtap".into()))]));

        self.handle
            .link()
            .add(message)
            .execute()
            .await
            .context("creating macvtap link")?;

        Ok(())
    }

    pub async fn delete_link(&self, name: &str) -> Result<(), Error> {
        if let Ok(index) = self.link_index(name).await {
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .context("deleting link")?;
        }

        Ok(())
    }

    /// First IPv4 address assigned to a link, with its prefix length.
    pub async fn first_address(&self, index: u32) -> Result<AddressInfo, Error> {
        let mut addresses = self.handle.address().get().set_link_index_filter(index).execute();

        let message = addresses
            .try_next()
            .await
            .context("listing addresses")?
            .ok_or_else(|| anyhow!("link {} has no addresses", index))?;

        let prefix = message.header.prefix_len;
        for nla in message.nlas {
            if let netlink_packet_route::address::nlas::Nla::Address(bytes) = nla {
                if bytes.len() == 4 {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&bytes);
                    return Ok(AddressInfo {
                        address: Ipv4Addr::from(octets),
                        prefix,
                    });
                }
            }
        }

        Err(anyhow!("link {} has no IPv4 address", index))
    }

    pub async fn add_address(&self, index: u32, network: Ipv4Network) -> Result<(), Error> {
        self.handle
            .address()
            .add(index, network.ip().into(), network.prefix())
            .execute()
            .await
            .context("adding address")
    }

    pub async fn flush_addresses(&self, index: u32) -> Result<(), Error> {
        let mut addresses = self.handle.address().get().set_link_index_filter(index).execute();

        while let Some(message) = addresses.try_next().await.context("listing addresses")? {
            self.handle
                .address()
                .del(message)
                .execute()
                .await
                .context("removing address")?;
        }

        Ok(())
    }

    pub async fn add_default_route(&self, index: u32, gateway: Ipv4Addr) -> Result<(), Error> {
        self.handle
            .route()
            .add()
            .v4()
            .output_interface(index)
            .gateway(gateway)
            .execute()
            .await
            .context("adding default route")
    }

    /// Default-route gateway for a link, by scanning the IPv4 route
    /// table for the first route without a destination prefix whose
    /// output interface matches `index`.
    pub async fn default_gateway(&self, index: u32) -> Result<Ipv4Addr, Error> {
        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();

        while let Some(route) = routes.try_next().await.context("listing routes")? {
            let is_default = route.header.destination_prefix_length == 0;
            let out_index = route.output_interface();
            let gateway = route.gateway();

            if is_default && out_index == Some(index) {
                if let Some(addr) = gateway {
                    return Ok(addr);
                }
            }
        }

        Err(anyhow!("no default route found for link {}", index))
    }
}
