//! `cloudstack_firewall`: the set of firewall rules on a public IP address.
//!
//! One configured `rule` block can stand for several remote rules: tcp and
//! udp rules are created once per entry in `ports`, icmp and all rules once
//! per block. The remote IDs are kept in the block's `uuids` map, keyed by
//! port (`"80"`, `"1000-2000"`), `"icmp"` or `"all"`.
//!
//! Remote rules are created and deleted one at a time.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{remote, Resource, FIREWALL};
use crate::client::{CloudStackApi, CreateFirewallRule, FirewallRule};
use crate::error::ProviderError;
use crate::schema::{Attribute, Block, Diagnostic, NestedBlock, Schema};
use crate::state::ResourceState;

/// Handler for `cloudstack_firewall`. The resource ID is the IP address ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct Firewall;

/// One `rule` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Rule {
    #[serde(default, deserialize_with = "null_as_default")]
    cidr_list: Vec<String>,
    #[serde(default)]
    protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icmp_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icmp_code: Option<i32>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    uuids: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// What a rule means, ignoring the IDs of its remote rules.
#[derive(Debug, PartialEq, Eq)]
struct RuleKey {
    protocol: String,
    cidr_list: Vec<String>,
    icmp_type: Option<i32>,
    icmp_code: Option<i32>,
    ports: Vec<String>,
}

impl Rule {
    fn key(&self) -> RuleKey {
        let mut cidr_list = self.cidr_list.clone();
        cidr_list.sort();
        let mut ports = self.ports.clone();
        ports.sort();
        RuleKey {
            protocol: self.protocol.to_lowercase(),
            cidr_list,
            icmp_type: self.icmp_type,
            icmp_code: self.icmp_code,
            ports,
        }
    }

    fn uses_ports(&self) -> bool {
        matches!(self.protocol.to_lowercase().as_str(), "tcp" | "udp")
    }

    /// The `uuids` key of a remote rule without ports.
    fn portless_key(&self) -> String {
        self.protocol.to_lowercase()
    }

    fn check(&self) -> Result<(), String> {
        match self.protocol.to_lowercase().as_str() {
            "icmp" => {
                let fields = [("icmp_type", self.icmp_type), ("icmp_code", self.icmp_code)];
                for (field, value) in fields {
                    if value.is_none() {
                        return Err(format!(
                            "Parameter {} is a required parameter when using protocol 'icmp'",
                            field
                        ));
                    }
                }
            },
            "all" => {},
            "tcp" | "udp" => {
                if self.ports.is_empty() {
                    return Err(format!(
                        "Parameter ports is a required parameter when using protocol '{}'",
                        self.protocol
                    ));
                }
                for port in &self.ports {
                    parse_port_range(port)?;
                }
            },
            other => {
                return Err(format!(
                    "{} is not a valid protocol. Valid options are 'tcp', 'udp', 'icmp' and 'all'",
                    other
                ))
            },
        }
        Ok(())
    }
}

/// Parse `"80"` or `"1000-2000"` into a start and end port.
fn parse_port_range(port: &str) -> Result<(u16, u16), String> {
    let invalid = || {
        format!(
            "{} is not a valid port value. Valid options are '80' or '80-90'",
            port
        )
    };
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());

    let (start, end) = match port.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let single = parse(port)?;
            (single, single)
        },
    };
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

fn port_label(rule: &FirewallRule) -> Option<String> {
    match (rule.start_port, rule.end_port) {
        (Some(start), Some(end)) if start != end => Some(format!("{}-{}", start, end)),
        (Some(start), _) => Some(start.to_string()),
        _ => None,
    }
}

fn split_cidrs(cidr_list: &str) -> Vec<String> {
    cidr_list
        .split(',')
        .map(str::trim)
        .filter(|cidr| !cidr.is_empty())
        .map(str::to_string)
        .collect()
}

fn rules_from_state(state: &ResourceState) -> Result<Vec<Rule>, ProviderError> {
    match state.get("rule") {
        None => Ok(Vec::new()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

fn set_rules(state: &mut ResourceState, rules: &[Rule]) -> Result<(), ProviderError> {
    state.set("rule", serde_json::to_value(rules)?);
    Ok(())
}

/// Create the remote rules of `rule` that are not in its `uuids` yet.
async fn create_rule(
    api: &dyn CloudStackApi,
    ip_address_id: &str,
    rule: &mut Rule,
) -> Result<(), ProviderError> {
    rule.check().map_err(ProviderError::Validation)?;

    let base = CreateFirewallRule {
        ip_address_id: ip_address_id.to_string(),
        protocol: rule.protocol.to_lowercase(),
        cidr_list: rule.cidr_list.clone(),
        ..Default::default()
    };

    if !rule.uses_ports() {
        let key = rule.portless_key();
        if rule.uuids.contains_key(&key) {
            return Ok(());
        }
        let params = CreateFirewallRule {
            icmp_type: rule.icmp_type.filter(|_| key == "icmp"),
            icmp_code: rule.icmp_code.filter(|_| key == "icmp"),
            ..base
        };
        let created = api
            .create_firewall_rule(&params)
            .await
            .map_err(remote(format!(
                "Error creating {} firewall rule on {}",
                key, ip_address_id
            )))?;
        debug!(id = %created.id, protocol = %key, "Created firewall rule");
        rule.uuids.insert(key, created.id);
        return Ok(());
    }

    for port in rule.ports.clone() {
        if rule.uuids.contains_key(&port) {
            continue;
        }
        let (start, end) = parse_port_range(&port).map_err(ProviderError::Validation)?;
        let params = CreateFirewallRule {
            start_port: Some(start),
            end_port: Some(end),
            ..base.clone()
        };
        let created = api
            .create_firewall_rule(&params)
            .await
            .map_err(remote(format!(
                "Error creating firewall rule for port {} on {}",
                port, ip_address_id
            )))?;
        debug!(id = %created.id, port = %port, "Created firewall rule");
        rule.uuids.insert(port, created.id);
    }
    Ok(())
}

async fn delete_remote_rule(api: &dyn CloudStackApi, id: &str) -> Result<(), ProviderError> {
    match api.delete_firewall_rule(id).await {
        Ok(()) => Ok(()),
        Err(err) if err.entity_missing() => {
            warn!(id, "Firewall rule already deleted");
            Ok(())
        },
        Err(err) => Err(remote(format!("Error deleting firewall rule {}", id))(err)),
    }
}

async fn delete_rule(api: &dyn CloudStackApi, rule: &Rule) -> Result<(), ProviderError> {
    for id in rule.uuids.values() {
        delete_remote_rule(api, id).await?;
    }
    Ok(())
}

/// Best-effort removal of rules created by an operation that then failed.
async fn roll_back(api: &dyn CloudStackApi, ip_address_id: &str, created: &[Rule]) {
    warn!(ip_address_id, "Rolling back firewall rules created so far");
    for rule in created {
        if let Err(cleanup) = delete_rule(api, rule).await {
            warn!(error = %cleanup, "Could not roll back firewall rule");
        }
    }
}

/// Build state for a remote rule that is not in the configuration.
fn adopt(stray: &FirewallRule) -> Rule {
    let protocol = stray.protocol.to_lowercase();
    let key = match port_label(stray) {
        Some(port) if protocol == "tcp" || protocol == "udp" => port,
        _ => protocol.clone(),
    };
    Rule {
        cidr_list: split_cidrs(&stray.cidr_list),
        ports: if key == protocol { Vec::new() } else { vec![key.clone()] },
        icmp_type: stray.icmp_type.filter(|_| protocol == "icmp"),
        icmp_code: stray.icmp_code.filter(|_| protocol == "icmp"),
        uuids: BTreeMap::from([(key, stray.id.clone())]),
        protocol,
    }
}

#[async_trait]
impl Resource for Firewall {
    fn type_name(&self) -> &'static str {
        FIREWALL
    }

    fn schema(&self) -> Schema {
        let rule = Block::new()
            .with_attribute("cidr_list", Attribute::required_string_set())
            .with_attribute(
                "protocol",
                Attribute::required_string().with_description("tcp, udp, icmp or all"),
            )
            .with_attribute("icmp_type", Attribute::optional_int64())
            .with_attribute("icmp_code", Attribute::optional_int64())
            .with_attribute(
                "ports",
                Attribute::optional_string_set()
                    .with_description("Ports or port ranges, e.g. 80 or 1000-2000"),
            )
            .with_attribute("uuids", Attribute::computed_string_map())
            .with_description("A firewall rule");

        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("ip_address_id", Attribute::required_string().with_force_new())
            .with_attribute(
                "managed",
                Attribute::optional_bool()
                    .with_description(
                        "Delete rules on the IP address that are not in the configuration",
                    ),
            )
            .with_block("rule", NestedBlock::set(rule).with_min_items(1))
    }

    fn validate(&self, config: &ResourceState) -> Vec<Diagnostic> {
        let Some(Value::Array(items)) = config.get("rule") else {
            return Vec::new();
        };

        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                // type errors are reported by schema validation
                let rule: Rule = serde_json::from_value(item.clone()).ok()?;
                let err = rule.check().err()?;
                Some(
                    Diagnostic::error("Invalid firewall rule")
                        .with_detail(err)
                        .with_attribute(format!("rule.{}", i)),
                )
            })
            .collect()
    }

    async fn create(
        &self,
        api: &dyn CloudStackApi,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let ip_address_id = planned.required_string("ip_address_id")?.to_string();
        let mut rules = rules_from_state(&planned)?;
        for rule in &rules {
            rule.check().map_err(ProviderError::Validation)?;
        }

        info!(ip_address_id = %ip_address_id, rules = rules.len(), "Creating firewall rules");
        for i in 0..rules.len() {
            if let Err(err) = create_rule(api, &ip_address_id, &mut rules[i]).await {
                roll_back(api, &ip_address_id, &rules[..=i]).await;
                return Err(err);
            }
        }

        planned.set("id", ip_address_id);
        set_rules(&mut planned, &rules)?;
        self.read(api, planned).await
    }

    async fn read(
        &self,
        api: &dyn CloudStackApi,
        mut current: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let ip_address_id = current.id()?.to_string();
        let mut remaining: BTreeMap<String, FirewallRule> = api
            .list_firewall_rules(&ip_address_id)
            .await
            .map_err(remote(format!("Error listing firewall rules on {}", ip_address_id)))?
            .into_iter()
            .map(|rule| (rule.id.clone(), rule))
            .collect();

        let mut rules = Vec::new();
        for mut rule in rules_from_state(&current)? {
            let mut found = BTreeMap::new();
            for (key, id) in std::mem::take(&mut rule.uuids) {
                let Some(existing) = remaining.remove(&id) else {
                    debug!(id = %id, key = %key, "Firewall rule no longer exists");
                    continue;
                };
                rule.cidr_list = split_cidrs(&existing.cidr_list);
                if key == "icmp" {
                    rule.icmp_type = existing.icmp_type;
                    rule.icmp_code = existing.icmp_code;
                }
                found.insert(key, id);
            }

            if rule.uses_ports() {
                rule.ports.retain(|port| found.contains_key(port));
            }
            rule.uuids = found;
            if !rule.uuids.is_empty() {
                rules.push(rule);
            }
        }

        if current.bool("managed").unwrap_or(false) {
            for stray in remaining.values() {
                debug!(id = %stray.id, "Adopting unmanaged firewall rule");
                rules.push(adopt(stray));
            }
        }

        if rules.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "no firewall rules left on {}",
                ip_address_id
            )));
        }

        set_rules(&mut current, &rules)?;
        Ok(current)
    }

    async fn update(
        &self,
        api: &dyn CloudStackApi,
        prior: ResourceState,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let ip_address_id = prior.id()?.to_string();
        let old_rules = rules_from_state(&prior)?;
        let new_rules = rules_from_state(&planned)?;

        for rule in &old_rules {
            if !new_rules.iter().any(|new| new.key() == rule.key()) {
                info!(uuids = ?rule.uuids, "Deleting firewall rule");
                delete_rule(api, rule).await?;
            }
        }

        let mut rules = Vec::with_capacity(new_rules.len());
        let mut added = Vec::new();
        for mut rule in new_rules {
            match old_rules.iter().find(|old| old.key() == rule.key()) {
                Some(old) => rule.uuids = old.uuids.clone(),
                None => {
                    rule.uuids.clear();
                    if let Err(err) = create_rule(api, &ip_address_id, &mut rule).await {
                        added.push(rule);
                        roll_back(api, &ip_address_id, &added).await;
                        return Err(err);
                    }
                    added.push(rule.clone());
                },
            }
            rules.push(rule);
        }

        planned.set("id", ip_address_id);
        set_rules(&mut planned, &rules)?;
        self.read(api, planned).await
    }

    async fn delete(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError> {
        let ip_address_id = current.id()?;
        info!(ip_address_id, "Deleting firewall rules");
        for rule in rules_from_state(&current)? {
            delete_rule(api, &rule).await?;
        }
        Ok(())
    }
}
