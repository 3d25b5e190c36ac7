use std::net::Ipv4Addr;

use futures::TryStreamExt;
use getset::Getters;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVrf, LinkAttribute, LinkInfo, LinkMessage,
};
use rtnetlink::Handle;
use tracing::debug;

use crate::{error::netlink_errno, PeerpodError, PeerpodResult};

use super::{HardwareAddr, Namespace};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The kind of a link to create.
#[derive(Debug, Clone)]
pub enum LinkKind {
    /// A veth pair. The peer is moved into `peer_ns` when given.
    Veth {
        /// The name of the peer end.
        peer: String,

        /// The namespace the peer end is moved into.
        peer_ns: Option<Namespace>,
    },

    /// A bridge.
    Bridge,

    /// A VXLAN endpoint talking to a single remote peer.
    Vxlan {
        /// The remote endpoint address.
        group: Ipv4Addr,

        /// The VXLAN network identifier.
        id: u32,

        /// The UDP destination port.
        port: u16,
    },

    /// A VRF device bound to a routing table.
    Vrf {
        /// The routing table of the VRF.
        table: u32,
    },
}

/// A network link in a namespace, bound to that namespace's netlink handle.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Link {
    #[getset(skip)]
    handle: Handle,

    /// The interface index.
    index: u32,

    /// The interface name.
    name: String,

    /// The link kind reported by the kernel, such as `veth` or `vxlan`.
    kind: Option<String>,

    /// The MTU.
    mtu: u32,

    /// The hardware address.
    hw_addr: HardwareAddr,

    /// The index of the controller (master) device.
    controller: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Namespace {
    /// Creates a link and returns it.
    pub async fn link_add(&self, name: &str, kind: LinkKind) -> PeerpodResult<Link> {
        let handle = self.handle().clone();
        let request = handle.link().add();

        match &kind {
            LinkKind::Veth { peer, .. } => {
                request.veth(name.to_string(), peer.clone()).execute().await?
            }
            LinkKind::Bridge => request.bridge(name.to_string()).execute().await?,
            LinkKind::Vxlan { group, id, port } => {
                request
                    .vxlan(name.to_string(), *id)
                    .group(*group)
                    .port(*port)
                    .execute()
                    .await?
            }
            LinkKind::Vrf { table } => {
                let mut request = request;
                let message = request.message_mut();
                message.attributes.push(LinkAttribute::IfName(name.to_string()));
                message.attributes.push(LinkAttribute::LinkInfo(vec![
                    LinkInfo::Kind(InfoKind::Vrf),
                    LinkInfo::Data(InfoData::Vrf(vec![InfoVrf::TableId(*table)])),
                ]));
                request.execute().await?
            }
        }

        debug!(name, ns = %self.path().display(), ?kind, "created link");

        if let LinkKind::Veth {
            peer,
            peer_ns: Some(peer_ns),
        } = &kind
        {
            self.link_find(peer).await?.set_namespace(peer_ns).await?;
        }

        self.link_find(name).await
    }

    /// Finds a link by name.
    pub async fn link_find(&self, name: &str) -> PeerpodResult<Link> {
        let mut links = self
            .handle()
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(Link::from_message(self.handle().clone(), message)),
            Ok(None) => Err(link_not_found(name, self)),
            Err(e) if is_missing(&e) => Err(link_not_found(name, self)),
            Err(e) => Err(e.into()),
        }
    }

    /// Finds a link by interface index.
    pub async fn link_find_by_index(&self, index: u32) -> PeerpodResult<Link> {
        let mut links = self.handle().link().get().match_index(index).execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(Link::from_message(self.handle().clone(), message)),
            Ok(None) => Err(link_not_found(&format!("#{index}"), self)),
            Err(e) if is_missing(&e) => Err(link_not_found(&format!("#{index}"), self)),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every link of the namespace.
    pub async fn link_list(&self) -> PeerpodResult<Vec<Link>> {
        let mut links = self.handle().link().get().execute();
        let mut result = Vec::new();
        while let Some(message) = links.try_next().await? {
            result.push(Link::from_message(self.handle().clone(), message));
        }

        Ok(result)
    }
}

impl Link {
    fn from_message(handle: Handle, message: LinkMessage) -> Self {
        let mut link = Self {
            handle,
            index: message.header.index,
            name: String::new(),
            kind: None,
            mtu: 0,
            hw_addr: HardwareAddr::default(),
            controller: None,
        };

        for attribute in message.attributes {
            match attribute {
                LinkAttribute::IfName(name) => link.name = name,
                LinkAttribute::Mtu(mtu) => link.mtu = mtu,
                LinkAttribute::Address(address) => link.hw_addr = HardwareAddr::new(address),
                LinkAttribute::Controller(index) => link.controller = Some(index),
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(kind) = info {
                            link.kind = Some(kind_name(&kind));
                        }
                    }
                }
                _ => {}
            }
        }

        link
    }

    /// The netlink handle of the namespace the link lives in.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Brings the link up.
    pub async fn set_up(&self) -> PeerpodResult<()> {
        self.handle.link().set(self.index).up().execute().await?;
        Ok(())
    }

    /// Brings the link down.
    pub async fn set_down(&self) -> PeerpodResult<()> {
        self.handle.link().set(self.index).down().execute().await?;
        Ok(())
    }

    /// Renames the link.
    pub async fn set_name(&mut self, name: &str) -> PeerpodResult<()> {
        self.handle
            .link()
            .set(self.index)
            .name(name.to_string())
            .execute()
            .await?;
        self.name = name.to_string();
        Ok(())
    }

    /// Sets the MTU of the link.
    pub async fn set_mtu(&mut self, mtu: u32) -> PeerpodResult<()> {
        self.handle.link().set(self.index).mtu(mtu).execute().await?;
        self.mtu = mtu;
        Ok(())
    }

    /// Sets the hardware address of the link.
    pub async fn set_hardware_addr(&mut self, hw_addr: &HardwareAddr) -> PeerpodResult<()> {
        self.handle
            .link()
            .set(self.index)
            .address(hw_addr.as_bytes().to_vec())
            .execute()
            .await?;
        self.hw_addr = hw_addr.clone();
        Ok(())
    }

    /// Enslaves the link to a controller device such as a bridge or a VRF.
    pub async fn set_master(&mut self, master: &Link) -> PeerpodResult<()> {
        self.handle
            .link()
            .set(self.index)
            .controller(master.index)
            .execute()
            .await?;
        self.controller = Some(master.index);
        Ok(())
    }

    /// Moves the link into another namespace and returns it as seen from there.
    pub async fn set_namespace(self, target: &Namespace) -> PeerpodResult<Link> {
        self.handle
            .link()
            .set(self.index)
            .setns_by_fd(target.fd())
            .execute()
            .await?;

        debug!(name = %self.name, ns = %target.path().display(), "moved link");
        target.link_find(&self.name).await
    }

    /// Deletes the link.
    pub async fn delete(self) -> PeerpodResult<()> {
        match self.handle.link().del(self.index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Err(PeerpodError::NotFound(format!(
                "link {} not found",
                self.name
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) fn is_missing(error: &rtnetlink::Error) -> bool {
    matches!(
        netlink_errno(error),
        Some(libc::ENODEV) | Some(libc::ENOENT) | Some(libc::ESRCH)
    )
}

fn link_not_found(name: &str, ns: &Namespace) -> PeerpodError {
    PeerpodError::NotFound(format!(
        "link {name} not found in {}",
        ns.path().display()
    ))
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".into(),
        InfoKind::Bridge => "bridge".into(),
        InfoKind::Vxlan => "vxlan".into(),
        InfoKind::Vrf => "vrf".into(),
        InfoKind::Dummy => "dummy".into(),
        InfoKind::Tun => "tun".into(),
        InfoKind::Vlan => "vlan".into(),
        InfoKind::Other(other) => other.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_find_loopback() -> anyhow::Result<()> {
        let ns = Namespace::open_current().await?;
        let lo = ns.link_find("lo").await?;
        assert_eq!(lo.get_name(), "lo");
        assert!(*lo.get_index() > 0);

        let same = ns.link_find_by_index(*lo.get_index()).await?;
        assert_eq!(same.get_name(), "lo");

        let links = ns.link_list().await?;
        assert!(links.iter().any(|l| l.get_name() == "lo"));
        Ok(())
    }

    #[tokio::test]
    async fn test_link_find_missing_is_not_found() -> anyhow::Result<()> {
        let ns = Namespace::open_current().await?;
        let err = ns.link_find("ppnonexistent0").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn test_link_veth_pair_across_namespaces() -> anyhow::Result<()> {
        let name = format!("pptest{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
        let peer_ns = Namespace::create_named(&name).await?;
        let ns = Namespace::open_current().await?;

        let mut veth = ns
            .link_add(
                "ppvethtest0",
                LinkKind::Veth {
                    peer: "eth9".into(),
                    peer_ns: Some(peer_ns.clone()),
                },
            )
            .await?;
        veth.set_mtu(1400).await?;
        veth.set_up().await?;
        assert_eq!(*veth.get_mtu(), 1400);

        let peer = peer_ns.link_find("eth9").await?;
        assert_eq!(peer.get_kind().as_deref(), Some("veth"));

        veth.delete().await?;
        drop(peer_ns);
        Namespace::delete_named(&name)?;
        Ok(())
    }
}
