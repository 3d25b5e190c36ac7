use std::{fmt, net::IpAddr, net::Ipv4Addr, str::FromStr};

use futures::TryStreamExt;
use getset::Getters;
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourState as NlNeighbourState,
};
use rtnetlink::IpVersion;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::{PeerpodError, PeerpodResult};

use super::{HardwareAddr, Namespace};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An IPv4 neighbor (ARP) entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Neighbor {
    /// The neighbor's IP address.
    ip: Ipv4Addr,

    /// The neighbor's hardware address.
    #[serde(rename = "hw-addr")]
    hw_addr: HardwareAddr,

    /// The device the entry belongs to.
    #[builder(setter(into))]
    dev: String,

    /// The entry state.
    #[builder(default = NeighborState::Permanent)]
    state: NeighborState,
}

/// The state of a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighborState {
    /// No state.
    None,

    /// Resolution in progress.
    Incomplete,

    /// Confirmed reachable.
    Reachable,

    /// Reachability unconfirmed.
    Stale,

    /// Waiting for confirmation.
    Delay,

    /// Probing.
    Probe,

    /// Resolution failed.
    Failed,

    /// No ARP needed.
    Noarp,

    /// Static entry.
    Permanent,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NeighborState {
    fn bits(&self) -> u16 {
        match self {
            NeighborState::None => 0x00,
            NeighborState::Incomplete => 0x01,
            NeighborState::Reachable => 0x02,
            NeighborState::Stale => 0x04,
            NeighborState::Delay => 0x08,
            NeighborState::Probe => 0x10,
            NeighborState::Failed => 0x20,
            NeighborState::Noarp => 0x40,
            NeighborState::Permanent => 0x80,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0x01 => NeighborState::Incomplete,
            0x02 => NeighborState::Reachable,
            0x04 => NeighborState::Stale,
            0x08 => NeighborState::Delay,
            0x10 => NeighborState::Probe,
            0x20 => NeighborState::Failed,
            0x40 => NeighborState::Noarp,
            0x80 => NeighborState::Permanent,
            _ => NeighborState::None,
        }
    }
}

impl Namespace {
    /// Adds a neighbor entry. The entry must carry a state other than `none`.
    pub async fn neighbor_add(&self, neighbor: &Neighbor) -> PeerpodResult<()> {
        if neighbor.state == NeighborState::None {
            return Err(PeerpodError::InvalidInput(format!(
                "neighbor {} needs a state",
                neighbor.ip
            )));
        }

        let link = self.link_find(&neighbor.dev).await?;
        self.handle()
            .neighbours()
            .add(*link.get_index(), IpAddr::V4(neighbor.ip))
            .link_local_address(neighbor.hw_addr.as_bytes())
            .state(NlNeighbourState::from(neighbor.state.bits()))
            .execute()
            .await?;

        debug!(ip = %neighbor.ip, dev = %neighbor.dev, "added neighbor");
        Ok(())
    }

    /// Lists IPv4 neighbor entries, optionally restricted to one device and one state.
    pub async fn neighbor_list(
        &self,
        dev: Option<&str>,
        state: Option<NeighborState>,
    ) -> PeerpodResult<Vec<Neighbor>> {
        let names = self.link_names().await?;
        let mut messages = self
            .handle()
            .neighbours()
            .get()
            .set_family(IpVersion::V4)
            .execute();

        let mut result = Vec::new();
        while let Some(message) = messages.try_next().await? {
            let Some(dev_name) = names.get(&message.header.ifindex).cloned() else {
                continue;
            };

            let mut ip = None;
            let mut hw_addr = HardwareAddr::default();
            for attribute in &message.attributes {
                match attribute {
                    NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                        ip = Some(*addr)
                    }
                    NeighbourAttribute::LinkLocalAddress(addr) => {
                        hw_addr = HardwareAddr::new(addr.clone())
                    }
                    _ => {}
                }
            }

            let Some(ip) = ip else { continue };
            let neighbor = Neighbor {
                ip,
                hw_addr,
                dev: dev_name,
                state: NeighborState::from_bits(u16::from(message.header.state)),
            };

            if dev.is_some_and(|d| d != neighbor.dev) {
                continue;
            }
            if state.is_some_and(|s| s != neighbor.state) {
                continue;
            }
            result.push(neighbor);
        }

        Ok(result)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for NeighborState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NeighborState::None => "none",
            NeighborState::Incomplete => "incomplete",
            NeighborState::Reachable => "reachable",
            NeighborState::Stale => "stale",
            NeighborState::Delay => "delay",
            NeighborState::Probe => "probe",
            NeighborState::Failed => "failed",
            NeighborState::Noarp => "noarp",
            NeighborState::Permanent => "permanent",
        };
        write!(f, "{name}")
    }
}

impl FromStr for NeighborState {
    type Err = PeerpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => NeighborState::None,
            "incomplete" => NeighborState::Incomplete,
            "reachable" => NeighborState::Reachable,
            "stale" => NeighborState::Stale,
            "delay" => NeighborState::Delay,
            "probe" => NeighborState::Probe,
            "failed" => NeighborState::Failed,
            "noarp" => NeighborState::Noarp,
            "permanent" => NeighborState::Permanent,
            other => {
                return Err(PeerpodError::InvalidInput(format!(
                    "unknown neighbor state: {other}"
                )))
            }
        })
    }
}

impl Serialize for NeighborState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NeighborState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbor_json_shape() -> anyhow::Result<()> {
        let neighbor = Neighbor::builder()
            .ip("172.16.0.1".parse()?)
            .hw_addr("ee:ee:ee:ee:ee:ee".parse()?)
            .dev("eth0")
            .build();

        let json = serde_json::to_value(&neighbor)?;
        assert_eq!(
            json,
            serde_json::json!({
                "ip": "172.16.0.1",
                "hw-addr": "ee:ee:ee:ee:ee:ee",
                "dev": "eth0",
                "state": "permanent",
            })
        );

        let parsed: Neighbor = serde_json::from_value(json)?;
        assert_eq!(parsed, neighbor);
        Ok(())
    }

    #[test]
    fn test_neighbor_state_bits() {
        for state in [
            NeighborState::Incomplete,
            NeighborState::Reachable,
            NeighborState::Stale,
            NeighborState::Permanent,
            NeighborState::Noarp,
        ] {
            assert_eq!(NeighborState::from_bits(state.bits()), state);
        }
        assert_eq!(NeighborState::from_bits(0x81), NeighborState::None);
        assert!("bogus".parse::<NeighborState>().is_err());
    }

    #[tokio::test]
    async fn test_neighbor_add_rejects_none_state() -> anyhow::Result<()> {
        let ns = Namespace::open_current().await?;
        let neighbor = Neighbor::builder()
            .ip("172.16.0.1".parse()?)
            .hw_addr("ee:ee:ee:ee:ee:ee".parse()?)
            .dev("lo")
            .state(NeighborState::None)
            .build();

        let err = ns.neighbor_add(&neighbor).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
        Ok(())
    }
}
