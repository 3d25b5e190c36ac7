use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnetwork::{IpNetwork, Ipv4Network};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use tracing::debug;

use crate::{PeerpodError, PeerpodResult};

use super::{Link, Namespace};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Link {
    /// Assigns an IPv4 prefix to the link.
    pub async fn add_addr(&self, addr: Ipv4Network) -> PeerpodResult<()> {
        self.handle()
            .address()
            .add(*self.get_index(), IpAddr::V4(addr.ip()), addr.prefix())
            .execute()
            .await?;

        debug!(link = %self.get_name(), %addr, "added address");
        Ok(())
    }

    /// Lists the IPv4 prefixes assigned to the link, in kernel order.
    pub async fn get_addr(&self) -> PeerpodResult<Vec<Ipv4Network>> {
        Ok(self
            .address_messages()
            .await?
            .iter()
            .filter_map(|message| match message_network(message) {
                Some(IpNetwork::V4(network)) => Some(network),
                _ => None,
            })
            .collect())
    }

    /// Removes an IPv4 prefix from the link.
    pub async fn del_addr(&self, addr: Ipv4Network) -> PeerpodResult<()> {
        let message = self
            .address_messages()
            .await?
            .into_iter()
            .find(|message| message_network(message) == Some(IpNetwork::V4(addr)))
            .ok_or_else(|| {
                PeerpodError::NotFound(format!("address {addr} not found on {}", self.get_name()))
            })?;

        self.handle().address().del(message).execute().await?;
        Ok(())
    }

    async fn address_messages(&self) -> PeerpodResult<Vec<AddressMessage>> {
        let mut messages = self
            .handle()
            .address()
            .get()
            .set_link_index_filter(*self.get_index())
            .execute();

        let mut result = Vec::new();
        while let Some(message) = messages.try_next().await? {
            result.push(message);
        }

        Ok(result)
    }
}

impl Namespace {
    /// Finds the single link that has `ip` assigned.
    pub async fn link_find_by_addr(&self, ip: Ipv4Addr) -> PeerpodResult<Link> {
        let mut found = Vec::new();
        for link in self.link_list().await? {
            if link.get_addr().await?.iter().any(|addr| addr.ip() == ip) {
                found.push(link);
            }
        }

        match found.len() {
            0 => Err(PeerpodError::NotFound(format!(
                "no interface has {ip} in {}",
                self.path().display()
            ))),
            1 => Ok(found.remove(0)),
            _ => Err(PeerpodError::Internal(format!(
                "more than one interface has {ip} in {}",
                self.path().display()
            ))),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn message_network(message: &AddressMessage) -> Option<IpNetwork> {
    message.attributes.iter().find_map(|attribute| match attribute {
        AddressAttribute::Address(ip) => {
            IpNetwork::new(*ip, message.header.prefix_len).ok()
        }
        _ => None,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
