use std::{collections::HashMap, fmt, net::Ipv4Addr, str::FromStr};

use futures::TryStreamExt;
use getset::Getters;
use ipnetwork::Ipv4Network;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol as NlRouteProtocol,
    RouteScope as NlRouteScope,
};
use rtnetlink::IpVersion;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::{PeerpodError, PeerpodResult};

use super::Namespace;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The main routing table.
pub const RT_TABLE_MAIN: u32 = 254;

/// The local routing table.
pub const RT_TABLE_LOCAL: u32 = 255;

const RTN_UNICAST: u8 = 1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An IPv4 route.
///
/// Only `dst`, `gw`, `dev`, `protocol` and `scope` travel over the wire; the remaining fields are
/// local to the namespace the route is read from or written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Route {
    /// The destination prefix. `0.0.0.0/0` is the default route.
    #[builder(default = default_dst())]
    #[serde(
        default = "default_dst",
        serialize_with = "serialize_dst",
        deserialize_with = "deserialize_dst"
    )]
    pub(crate) dst: Ipv4Network,

    /// The next hop.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_gw"
    )]
    pub(crate) gw: Option<Ipv4Addr>,

    /// The output device name.
    #[builder(default, setter(into))]
    #[serde(default)]
    pub(crate) dev: String,

    /// The routing protocol that installed the route.
    #[builder(default)]
    #[serde(default)]
    pub(crate) protocol: RouteProtocol,

    /// The route scope.
    #[builder(default)]
    #[serde(default)]
    pub(crate) scope: RouteScope,

    /// The routing table.
    #[builder(default = RT_TABLE_MAIN)]
    #[serde(skip, default = "main_table")]
    pub(crate) table: u32,

    /// The route metric.
    #[builder(default)]
    #[serde(skip)]
    pub(crate) priority: u32,

    /// Whether the gateway is reachable on the device without a covering prefix.
    #[builder(default)]
    #[serde(skip)]
    pub(crate) onlink: bool,

    /// The route type, unicast unless read from the kernel.
    #[builder(default = RTN_UNICAST)]
    #[serde(skip, default = "unicast")]
    pub(crate) kind: u8,
}

/// The routing protocol of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RouteProtocol {
    /// Unknown.
    #[default]
    Unspec,

    /// Installed by an ICMP redirect.
    Redirect,

    /// Installed by the kernel.
    Kernel,

    /// Installed during boot.
    Boot,

    /// Installed by an administrator.
    Static,

    /// Installed by a DHCP client.
    Dhcp,

    /// Any other protocol number.
    Other(u8),
}

/// The scope of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RouteScope {
    /// Global.
    #[default]
    Universe,

    /// Interior to the site.
    Site,

    /// Directly attached to the link.
    Link,

    /// Local to the host.
    Host,

    /// Unreachable destination.
    Nowhere,

    /// Any other scope number.
    Other(u8),
}

/// Selects routes returned by [`Namespace::route_list`].
///
/// The default filter keeps unicast routes of the main table installed by the `static`, `boot`,
/// `dhcp` or `kernel` protocols.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RouteFilter {
    /// Only routes from this table. `None` matches every table.
    #[builder(default = Some(RT_TABLE_MAIN))]
    pub table: Option<u32>,

    /// Only routes through this device.
    #[builder(default, setter(strip_option, into))]
    pub dev: Option<String>,

    /// Only routes to exactly this prefix.
    #[builder(default, setter(strip_option))]
    pub dst: Option<Ipv4Network>,

    /// Only routes installed by one of these protocols. Empty matches every protocol.
    #[builder(default = default_protocols())]
    pub protocols: Vec<RouteProtocol>,

    /// Only unicast routes.
    #[builder(default = true)]
    pub unicast_only: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Route {
    /// Whether the route is a default route.
    pub fn is_default(&self) -> bool {
        self.dst.prefix() == 0
    }

    fn sort_key(&self) -> (u32, u32, u8, u32) {
        (
            self.table,
            u32::from(self.dst.network()),
            self.dst.prefix(),
            self.priority,
        )
    }
}

impl RouteFilter {
    fn matches(&self, route: &Route) -> bool {
        if let Some(table) = self.table {
            if route.table != table {
                return false;
            }
        }
        if let Some(dev) = &self.dev {
            if &route.dev != dev {
                return false;
            }
        }
        if let Some(dst) = &self.dst {
            if &route.dst != dst {
                return false;
            }
        }
        if !self.protocols.is_empty() && !self.protocols.contains(&route.protocol) {
            return false;
        }
        if self.unicast_only && route.kind != RTN_UNICAST {
            return false;
        }
        true
    }
}

impl Namespace {
    /// Adds a route.
    pub async fn route_add(&self, route: &Route) -> PeerpodResult<()> {
        let oif = if route.dev.is_empty() {
            None
        } else {
            Some(*self.link_find(&route.dev).await?.get_index())
        };

        if let (true, Some(gw), Some(_)) = (route.onlink, route.gw, oif) {
            // The gateway must be reachable on the device before the route that uses it.
            let gw_route = Route::builder()
                .dst(Ipv4Network::new(gw, 32)?)
                .dev(route.dev.clone())
                .table(route.table)
                .scope(RouteScope::Link)
                .protocol(route.protocol)
                .build();
            match self.route_add_with_oif(&gw_route, oif).await {
                Err(e) if !e.is_already_exists() => return Err(e),
                _ => {}
            }
        }

        self.route_add_with_oif(route, oif).await
    }

    async fn route_add_with_oif(&self, route: &Route, oif: Option<u32>) -> PeerpodResult<()> {
        let scope = match (route.scope, route.gw) {
            (RouteScope::Universe, None) if oif.is_some() && route.dst.prefix() > 0 => {
                RouteScope::Link
            }
            (scope, _) => scope,
        };

        let mut request = self
            .handle()
            .route()
            .add()
            .v4()
            .destination_prefix(route.dst.network(), route.dst.prefix())
            .table_id(route.table)
            .protocol(NlRouteProtocol::from(u8::from(route.protocol)))
            .scope(NlRouteScope::from(u8::from(scope)));

        if let Some(gw) = route.gw {
            request = request.gateway(gw);
        }
        if let Some(index) = oif {
            request = request.output_interface(index);
        }
        if route.priority > 0 {
            request = request.priority(route.priority);
        }

        request.execute().await?;
        debug!(dst = %route.dst, gw = ?route.gw, dev = %route.dev, table = route.table, "added route");
        Ok(())
    }

    /// Deletes the first route matching the destination, table and, when set, gateway and device.
    pub async fn route_del(&self, route: &Route) -> PeerpodResult<()> {
        let names = self.link_names().await?;
        let message = self
            .route_messages()
            .await?
            .into_iter()
            .find(|message| {
                let candidate = route_from_message(message, &names);
                candidate.dst == route.dst
                    && candidate.table == route.table
                    && (route.gw.is_none() || candidate.gw == route.gw)
                    && (route.dev.is_empty() || candidate.dev == route.dev)
            })
            .ok_or_else(|| {
                PeerpodError::NotFound(format!(
                    "route {} (table {}) not found in {}",
                    route.dst,
                    route.table,
                    self.path().display()
                ))
            })?;

        self.handle().route().del(message).execute().await?;
        debug!(dst = %route.dst, table = route.table, "deleted route");
        Ok(())
    }

    /// Lists IPv4 routes matching the filter, sorted by table, destination and priority.
    pub async fn route_list(&self, filter: &RouteFilter) -> PeerpodResult<Vec<Route>> {
        let names = self.link_names().await?;
        let mut routes: Vec<Route> = self
            .route_messages()
            .await?
            .iter()
            .map(|message| route_from_message(message, &names))
            .filter(|route| filter.matches(route))
            .collect();

        sort_routes(&mut routes);
        Ok(routes)
    }

    async fn route_messages(&self) -> PeerpodResult<Vec<RouteMessage>> {
        let mut messages = self.handle().route().get(IpVersion::V4).execute();
        let mut result = Vec::new();
        while let Some(message) = messages.try_next().await? {
            result.push(message);
        }

        Ok(result)
    }

    pub(super) async fn link_names(&self) -> PeerpodResult<HashMap<u32, String>> {
        Ok(self
            .link_list()
            .await?
            .into_iter()
            .map(|link| (*link.get_index(), link.get_name().clone()))
            .collect())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sorts routes by table, destination address, prefix length and priority.
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by_key(Route::sort_key);
}

fn route_from_message(message: &RouteMessage, names: &HashMap<u32, String>) -> Route {
    let mut dst_ip = Ipv4Addr::UNSPECIFIED;
    let mut gw = None;
    let mut dev = String::new();
    let mut table = u32::from(message.header.table);
    let mut priority = 0;

    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => dst_ip = *ip,
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => gw = Some(*ip),
            RouteAttribute::Oif(index) => dev = names.get(index).cloned().unwrap_or_default(),
            RouteAttribute::Table(id) => table = *id,
            RouteAttribute::Priority(metric) => priority = *metric,
            _ => {}
        }
    }

    let dst = Ipv4Network::new(dst_ip, message.header.destination_prefix_length)
        .unwrap_or_else(|_| default_dst());

    Route {
        dst,
        gw,
        dev,
        protocol: RouteProtocol::from(u8::from(message.header.protocol)),
        scope: RouteScope::from(u8::from(message.header.scope)),
        table,
        priority,
        onlink: false,
        kind: u8::from(message.header.kind),
    }
}

fn default_dst() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

fn default_protocols() -> Vec<RouteProtocol> {
    vec![
        RouteProtocol::Static,
        RouteProtocol::Boot,
        RouteProtocol::Dhcp,
        RouteProtocol::Kernel,
    ]
}

fn main_table() -> u32 {
    RT_TABLE_MAIN
}

fn unicast() -> u8 {
    RTN_UNICAST
}

fn serialize_dst<S>(dst: &Ipv4Network, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&dst.to_string())
}

fn deserialize_dst<'de, D>(deserializer: D) -> Result<Ipv4Network, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        return Ok(default_dst());
    }
    s.parse().map_err(serde::de::Error::custom)
}

fn deserialize_gw<'de, D>(deserializer: D) -> Result<Option<Ipv4Addr>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for RouteFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<u8> for RouteProtocol {
    fn from(value: u8) -> Self {
        match value {
            0 => RouteProtocol::Unspec,
            1 => RouteProtocol::Redirect,
            2 => RouteProtocol::Kernel,
            3 => RouteProtocol::Boot,
            4 => RouteProtocol::Static,
            16 => RouteProtocol::Dhcp,
            other => RouteProtocol::Other(other),
        }
    }
}

impl From<RouteProtocol> for u8 {
    fn from(value: RouteProtocol) -> Self {
        match value {
            RouteProtocol::Unspec => 0,
            RouteProtocol::Redirect => 1,
            RouteProtocol::Kernel => 2,
            RouteProtocol::Boot => 3,
            RouteProtocol::Static => 4,
            RouteProtocol::Dhcp => 16,
            RouteProtocol::Other(other) => other,
        }
    }
}

impl From<u8> for RouteScope {
    fn from(value: u8) -> Self {
        match value {
            0 => RouteScope::Universe,
            200 => RouteScope::Site,
            253 => RouteScope::Link,
            254 => RouteScope::Host,
            255 => RouteScope::Nowhere,
            other => RouteScope::Other(other),
        }
    }
}

impl From<RouteScope> for u8 {
    fn from(value: RouteScope) -> Self {
        match value {
            RouteScope::Universe => 0,
            RouteScope::Site => 200,
            RouteScope::Link => 253,
            RouteScope::Host => 254,
            RouteScope::Nowhere => 255,
            RouteScope::Other(other) => other,
        }
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteProtocol::Unspec => write!(f, "unspec"),
            RouteProtocol::Redirect => write!(f, "redirect"),
            RouteProtocol::Kernel => write!(f, "kernel"),
            RouteProtocol::Boot => write!(f, "boot"),
            RouteProtocol::Static => write!(f, "static"),
            RouteProtocol::Dhcp => write!(f, "dhcp"),
            RouteProtocol::Other(other) => write!(f, "{other}"),
        }
    }
}

impl FromStr for RouteProtocol {
    type Err = PeerpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "unspec" => RouteProtocol::Unspec,
            "redirect" => RouteProtocol::Redirect,
            "kernel" => RouteProtocol::Kernel,
            "boot" => RouteProtocol::Boot,
            "static" => RouteProtocol::Static,
            "dhcp" => RouteProtocol::Dhcp,
            other => RouteProtocol::from(other.parse::<u8>().map_err(|_| {
                PeerpodError::InvalidInput(format!("unknown route protocol: {other}"))
            })?),
        })
    }
}

impl fmt::Display for RouteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteScope::Universe => write!(f, "universe"),
            RouteScope::Site => write!(f, "site"),
            RouteScope::Link => write!(f, "link"),
            RouteScope::Host => write!(f, "host"),
            RouteScope::Nowhere => write!(f, "nowhere"),
            RouteScope::Other(other) => write!(f, "{other}"),
        }
    }
}

impl FromStr for RouteScope {
    type Err = PeerpodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "universe" => RouteScope::Universe,
            "site" => RouteScope::Site,
            "link" => RouteScope::Link,
            "host" => RouteScope::Host,
            "nowhere" => RouteScope::Nowhere,
            other => RouteScope::from(other.parse::<u8>().map_err(|_| {
                PeerpodError::InvalidInput(format!("unknown route scope: {other}"))
            })?),
        })
    }
}

impl Serialize for RouteProtocol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RouteProtocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for RouteScope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RouteScope {
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
