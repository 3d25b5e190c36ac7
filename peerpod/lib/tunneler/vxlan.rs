//! The VXLAN tunnel.
//!
//! On the worker a VXLAN endpoint is created in the host namespace, moved into the pod namespace
//! as `vxlan1`, and wired to the pod interface with a pair of tc redirects. On the pod VM the peer
//! endpoint takes over the pod interface's name, MAC, MTU and address. Both sides bypass conntrack
//! for the tunnel's UDP flow with NOTRACK rules tagged by the VXLAN id.

use std::{net::Ipv4Addr, path::Path};

use tracing::{debug, info, warn};

use crate::{
    netops::{split_rule, Iptables, LinkKind, Namespace},
    PeerpodError, PeerpodResult,
};

use super::NetworkConfig;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MTU ceiling of a VXLAN-backed pod interface.
pub const VXLAN_MAX_MTU: u32 = 1450;

const HOST_VXLAN_PREFIX: &str = "ppvxlan";

const HOST_VXLAN_MAX_INDEX: u32 = 5;

const POD_VXLAN_INTERFACE: &str = "vxlan1";

const PODVM_HOST_VXLAN_INTERFACE: &str = "vxlan0";

const RAW_TABLE: &str = "raw";

const OUTPUT_CHAIN: &str = "peerpod-OUTPUT";

const PREROUTING_CHAIN: &str = "peerpod-PREROUTING";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct NotrackRule {
    base: &'static str,
    chain: &'static str,
    spec: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(super) async fn worker_setup(
    ns_path: &Path,
    pod_node_ips: &[Ipv4Addr],
    config: &NetworkConfig,
) -> PeerpodResult<()> {
    let dst = tunnel_destination(pod_node_ips, config.dedicated)?;

    let host_ns = Namespace::open_current().await?;
    let pod_ns = Namespace::open(ns_path).await?;

    iptables_setup(&host_ns, dst, config.vxlan_port, config.vxlan_id).await?;

    let existing: Vec<String> = host_ns
        .link_list()
        .await?
        .into_iter()
        .map(|link| link.get_name().clone())
        .collect();

    let mut created = None;
    for index in 1..=HOST_VXLAN_MAX_INDEX {
        let name = format!("{HOST_VXLAN_PREFIX}{index}");
        if existing.contains(&name) {
            continue;
        }

        let kind = LinkKind::Vxlan {
            group: dst,
            id: config.vxlan_id,
            port: config.vxlan_port,
        };
        match host_ns.link_add(&name, kind).await {
            Ok(link) => {
                info!(%name, remote = %dst, port = config.vxlan_port, id = config.vxlan_id, "created vxlan interface");
                created = Some(link);
                break;
            }
            Err(e) if e.is_already_exists() => {
                debug!(%name, "vxlan interface name taken, trying the next one");
            }
            Err(e) => return Err(e),
        }
    }

    let host_link = created.ok_or_else(|| {
        PeerpodError::Unavailable(format!(
            "failed to create a vxlan interface: {HOST_VXLAN_PREFIX}1..{HOST_VXLAN_PREFIX}{HOST_VXLAN_MAX_INDEX} are all taken"
        ))
    })?;

    let mut pod_link = host_link.set_namespace(&pod_ns).await?;
    pod_link.set_name(POD_VXLAN_INTERFACE).await?;
    pod_link.set_up().await?;

    let pod_interface = &config.interface_name;
    info!(%pod_interface, ns = %ns_path.display(), "adding tc redirects between {pod_interface} and {POD_VXLAN_INTERFACE}");
    pod_ns.redirect_add(pod_interface, POD_VXLAN_INTERFACE).await?;
    pod_ns.redirect_add(POD_VXLAN_INTERFACE, pod_interface).await?;

    Ok(())
}

/// Removes the worker side of the tunnel.
///
/// The host NOTRACK rules are always removed, even when the pod namespace is already gone. The first
/// failure is returned after every step has run.
pub(super) async fn worker_teardown(ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()> {
    let host_ns = Namespace::open_current().await?;

    let pod_side = match Namespace::open(ns_path).await {
        Ok(pod_ns) => worker_pod_teardown(&pod_ns, config).await,
        Err(e) if e.is_not_found() => {
            debug!(ns = %ns_path.display(), "pod namespace already gone");
            Ok(())
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &pod_side {
        warn!(ns = %ns_path.display(), error = %e, "failed to remove the vxlan interface from the pod namespace");
    }

    let host_side = iptables_teardown(&host_ns, config.vxlan_id).await;
    pod_side.and(host_side)
}

async fn worker_pod_teardown(pod_ns: &Namespace, config: &NetworkConfig) -> PeerpodResult<()> {
    let mut first_error = None;
    for interface in [config.interface_name.as_str(), POD_VXLAN_INTERFACE] {
        match pod_ns.redirect_del(interface).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(%interface, "no tc redirect to delete");
            }
            Err(e) => {
                warn!(%interface, error = %e, "failed to delete tc redirect");
                first_error.get_or_insert(e);
            }
        }
    }

    let deleted = match pod_ns.link_find(POD_VXLAN_INTERFACE).await {
        Ok(link) => link.delete().await,
        Err(e) if e.is_not_found() => {
            debug!("vxlan interface already gone");
            Ok(())
        }
        Err(e) => Err(e),
    };

    match first_error {
        Some(e) => Err(e),
        None => deleted,
    }
}

pub(super) async fn podvm_setup(ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()> {
    if config.interface_name.is_empty() {
        return Err(PeerpodError::InvalidInput(
            "interface name is not specified".into(),
        ));
    }

    let worker_ip = config.worker_node_ip.ip();
    let host_ns = Namespace::open_current().await?;
    let pod_ns = Namespace::open(ns_path).await?;

    iptables_setup(&host_ns, worker_ip, config.vxlan_port, config.vxlan_id).await?;

    info!(
        group = %worker_ip,
        id = config.vxlan_id,
        port = config.vxlan_port,
        "creating vxlan interface {PODVM_HOST_VXLAN_INTERFACE}"
    );
    let host_link = host_ns
        .link_add(
            PODVM_HOST_VXLAN_INTERFACE,
            LinkKind::Vxlan {
                group: worker_ip,
                id: config.vxlan_id,
                port: config.vxlan_port,
            },
        )
        .await?;

    let mut link = host_link.set_namespace(&pod_ns).await?;
    link.set_name(&config.interface_name).await?;
    if !config.pod_hw_addr.is_empty() {
        link.set_hardware_addr(&config.pod_hw_addr).await?;
    }
    link.set_mtu(config.mtu.min(VXLAN_MAX_MTU)).await?;
    link.add_addr(config.pod_ip).await?;
    link.set_up().await?;

    Ok(())
}

pub(super) async fn podvm_teardown(ns_path: &Path, config: &NetworkConfig) -> PeerpodResult<()> {
    let host_ns = Namespace::open_current().await?;

    let pod_side = match Namespace::open(ns_path).await {
        Ok(pod_ns) => match pod_ns.link_find(&config.interface_name).await {
            Ok(link) => link.delete().await,
            Err(e) if e.is_not_found() => {
                warn!(interface = %config.interface_name, "vxlan interface already gone");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Err(e) if e.is_not_found() => {
            debug!(ns = %ns_path.display(), "pod namespace already gone");
            Ok(())
        }
        Err(e) => Err(e),
    };

    let host_side = iptables_teardown(&host_ns, config.vxlan_id).await;
    pod_side.and(host_side)
}

/// Picks the pod VM address the tunnel points at.
pub(super) fn tunnel_destination(
    pod_node_ips: &[Ipv4Addr],
    dedicated: bool,
) -> PeerpodResult<Ipv4Addr> {
    match (pod_node_ips, dedicated) {
        ([], _) => Err(PeerpodError::InvalidInput("pod node has no IPs".into())),
        ([_], true) => Err(PeerpodError::InvalidInput(
            "dedicated tunnel missing destination address".into(),
        )),
        ([_, second, ..], true) => Ok(*second),
        ([first, ..], false) => Ok(*first),
    }
}

fn vni_comment(id: u32) -> String {
    format!("peerpod [vni:{id}]")
}

fn notrack_rules(addr: Ipv4Addr, port: u16, id: u32) -> Vec<NotrackRule> {
    let rule = |direction: &str| -> Vec<String> {
        [
            "-m",
            "comment",
            "--comment",
            &vni_comment(id),
            direction,
            &addr.to_string(),
            "-p",
            "udp",
            "-m",
            "udp",
            "--dport",
            &port.to_string(),
            "-j",
            "NOTRACK",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    };

    vec![
        NotrackRule {
            base: "OUTPUT",
            chain: OUTPUT_CHAIN,
            spec: rule("-d"),
        },
        NotrackRule {
            base: "PREROUTING",
            chain: PREROUTING_CHAIN,
            spec: rule("-s"),
        },
    ]
}

async fn iptables_setup(ns: &Namespace, addr: Ipv4Addr, port: u16, id: u32) -> PeerpodResult<()> {
    ns.run_blocking(move || {
        let _guard = Iptables::lock();
        let ipt = Iptables::new(RAW_TABLE);

        for rule in notrack_rules(addr, port, id) {
            ipt.ensure_chain(rule.base, rule.chain)?;
            ipt.append_unique(rule.chain, &rule.spec)?;
        }

        Ok(())
    })
    .await
}

async fn iptables_teardown(ns: &Namespace, id: u32) -> PeerpodResult<()> {
    let comment = vni_comment(id);
    ns.run_blocking(move || {
        let _guard = Iptables::lock();
        let ipt = Iptables::new(RAW_TABLE);

        for (base, chain) in [("OUTPUT", OUTPUT_CHAIN), ("PREROUTING", PREROUTING_CHAIN)] {
            if !ipt.chain_exists(chain)? {
                continue;
            }

            for line in ipt.list(chain)? {
                let args = split_rule(&line);
                if args.first().map(String::as_str) != Some("-A") || !args.contains(&comment) {
                    continue;
                }
                ipt.delete(chain, &args[2..])?;
            }

            ipt.remove_chain_if_empty(base, chain)?;
        }

        Ok(())
    })
    .await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use crate::netops::NETNS_RUN_DIR;

    use super::*;

    async fn notrack_lines(ns: &Namespace, id: u32) -> PeerpodResult<Vec<String>> {
        let comment = vni_comment(id);
        ns.run_blocking(move || {
            let ipt = Iptables::new(RAW_TABLE);
            let mut lines = Vec::new();
            for chain in [OUTPUT_CHAIN, PREROUTING_CHAIN] {
                if ipt.chain_exists(chain)? {
                    lines.extend(ipt.list(chain)?.into_iter().filter(|line| line.contains(&comment)));
                }
            }
            Ok(lines)
        })
        .await
    }

    #[test]
    fn test_tunnel_destination() -> anyhow::Result<()> {
        let a: Ipv4Addr = "192.168.10.5".parse()?;
        let b: Ipv4Addr = "192.168.20.5".parse()?;

        assert_eq!(tunnel_destination(&[a, b], false)?, a);
        assert_eq!(tunnel_destination(&[a, b], true)?, b);
        assert!(tunnel_destination(&[], false).is_err());
        assert!(tunnel_destination(&[a], true).is_err());
        Ok(())
    }

    #[test]
    fn test_notrack_rules() {
        let rules = notrack_rules("10.0.0.5".parse().unwrap(), 4789, 555001);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].base, "OUTPUT");
        assert_eq!(rules[0].chain, "peerpod-OUTPUT");
        assert_eq!(
            rules[0].spec.join(" "),
            "-m comment --comment peerpod [vni:555001] -d 10.0.0.5 -p udp -m udp --dport 4789 -j NOTRACK"
        );

        assert_eq!(rules[1].base, "PREROUTING");
        assert_eq!(rules[1].chain, "peerpod-PREROUTING");
        assert!(rules[1].spec.contains(&"-s".to_string()));
        assert!(rules[1].spec.contains(&"peerpod [vni:555001]".to_string()));
    }

    #[test]
    fn test_teardown_rule_selection_by_vni() {
        let line = r#"-A peerpod-OUTPUT -d 10.0.0.5/32 -p udp -m comment --comment "peerpod [vni:555001]" -m udp --dport 4789 -j NOTRACK"#;
        let args = split_rule(line);
        assert!(args.contains(&vni_comment(555001)));
        assert!(!args.contains(&vni_comment(555002)));
        assert_eq!(args[1], "peerpod-OUTPUT");
        assert_eq!(args[2], "-d");
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    #[serial]
    async fn test_worker_teardown_after_pod_namespace_is_gone() -> anyhow::Result<()> {
        let name = format!("ppvx{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
        let pod_ns = Namespace::create_named(&name).await?;
        let host_ns = Namespace::open_current().await?;

        let config = NetworkConfig::builder()
            .pod_ip("172.16.0.2/24".parse()?)
            .interface_name("eth0")
            .worker_node_ip("10.224.0.4/16".parse()?)
            .vxlan_port(4789)
            .vxlan_id(555917)
            .build();
        iptables_setup(&host_ns, "192.0.2.10".parse()?, config.vxlan_port, config.vxlan_id).await?;
        assert_eq!(notrack_lines(&host_ns, config.vxlan_id).await?.len(), 2);

        drop(pod_ns);
        Namespace::delete_named(&name)?;

        let ns_path = Path::new(NETNS_RUN_DIR).join(&name);
        worker_teardown(&ns_path, &config).await?;
        assert!(notrack_lines(&host_ns, config.vxlan_id).await?.is_empty());
        Ok(())
    }
}
