use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use super::config::ConnectionConfig;
use super::driver::Host;
use crate::common::{ConnectorError, ConnectorResult};

/// Live hosts sharing a datacenter with the reachable contact hosts
///
/// The datacenters of the contact hosts present (and up) in `topology` define
/// the local set; hosts with an unknown datacenter are kept as well. Falls
/// back to `contact_hosts` when nothing qualifies.
pub fn dc_local_hosts(contact_hosts: &BTreeSet<IpAddr>, topology: &[Host]) -> BTreeSet<IpAddr> {
    let local_dcs: HashSet<&str> = topology
        .iter()
        .filter(|host| host.is_up && contact_hosts.contains(&host.address))
        .filter_map(|host| host.datacenter.as_deref())
        .collect();

    let local: BTreeSet<IpAddr> = topology
        .iter()
        .filter(|host| host.is_up)
        .filter(|host| match host.datacenter.as_deref() {
            None => true,
            Some(dc) => local_dcs.contains(dc),
        })
        .map(|host| host.address)
        .collect();

    if local.is_empty() {
        contact_hosts.clone()
    } else {
        local
    }
}

/// Configs that must resolve to the same cached cluster as `config`
///
/// One config per dc-local host plus one covering the whole dc-local set.
pub fn alternative_configs(config: &ConnectionConfig, topology: &[Host]) -> HashSet<ConnectionConfig> {
    let local = dc_local_hosts(&config.hosts, topology);

    let mut keys: HashSet<ConnectionConfig> = local
        .iter()
        .map(|host| config.with_hosts([*host]))
        .collect();
    keys.insert(config.with_hosts(local));
    keys
}

/// Datacenter holding most of the live contact hosts
///
/// Ties go to the alphabetically first datacenter. `None` when no live
/// contact host reports one.
pub fn infer_local_datacenter(contact_hosts: &BTreeSet<IpAddr>, topology: &[Host]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for dc in topology
        .iter()
        .filter(|host| host.is_up && contact_hosts.contains(&host.address))
        .filter_map(|host| host.datacenter.as_deref())
    {
        *counts.entry(dc).or_default() += 1;
    }

    let max = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, count)| *count == max)
        .map(|(dc, _)| dc.to_string())
}

/// Pick a live host in the local datacenter, or any live host
///
/// The local datacenter is `local_datacenter` when configured, otherwise the
/// datacenters of the live `own_hosts`. Own hosts win among local candidates;
/// the remaining choices are uniformly random.
pub fn closest_live_host(
    own_hosts: &BTreeSet<IpAddr>,
    local_datacenter: Option<&str>,
    topology: &[Host],
) -> ConnectorResult<IpAddr> {
    let live: Vec<&Host> = topology.iter().filter(|host| host.is_up).collect();
    if live.is_empty() {
        return Err(ConnectorError::NoLiveHosts);
    }

    let local_dcs: HashSet<&str> = match local_datacenter {
        Some(dc) => HashSet::from([dc]),
        None => live
            .iter()
            .filter(|host| own_hosts.contains(&host.address))
            .filter_map(|host| host.datacenter.as_deref())
            .collect(),
    };

    let local: Vec<IpAddr> = live
        .iter()
        .filter(|host| host.datacenter.as_deref().is_some_and(|dc| local_dcs.contains(dc)))
        .map(|host| host.address)
        .collect();

    if let Some(own) = local.iter().find(|address| own_hosts.contains(address)) {
        return Ok(*own);
    }

    let candidates: Vec<IpAddr> = if local.is_empty() {
        live.iter().map(|host| host.address).collect()
    } else {
        local
    };

    Ok(candidates[rand::random_range(0..candidates.len())])
}
