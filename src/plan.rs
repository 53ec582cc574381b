//! Schema-driven planning.
//!
//! [`plan`] compares prior state with a proposed configuration and decides
//! what the apply step will do:
//!
//! - defaults fill in attributes the configuration leaves out
//! - computed attributes the configuration leaves out keep their prior value
//! - nested blocks that are unchanged apart from computed attributes keep
//!   their prior contents (e.g. the remote rule IDs of a firewall rule)
//! - a change to a force-new attribute or block requires replacement

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::schema::{AttributeType, Block, NestedBlock, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Plan the transition from `prior` (None when creating) to `proposed`
/// (null when deleting).
pub fn plan(
    schema: &Schema,
    prior: Option<&Value>,
    proposed: Value,
) -> Result<PlanResult, ProviderError> {
    let prior = match prior {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            return Err(ProviderError::InvalidRequest(format!(
                "prior state must be an object, got {}",
                other
            )))
        },
    };

    let mut planned = match proposed {
        Value::Null => return Ok(plan_delete(prior)),
        Value::Object(map) => map,
        other => {
            return Err(ProviderError::InvalidRequest(format!(
                "proposed state must be an object, got {}",
                other
            )))
        },
    };

    fill_unset(&schema.block, prior, &mut planned);

    let mut changes = Vec::new();
    let mut requires_replace = false;

    for (name, attr) in &schema.block.attributes {
        let before = non_null(prior.and_then(|p| p.get(name)));
        let after = non_null(planned.get(name));
        if before == after || (after.is_none() && attr.flags.computed) {
            continue;
        }

        changes.push(AttributeChange::new(name.clone(), before.cloned(), after.cloned()));
        requires_replace |= attr.force_new && prior.is_some();
    }

    for (name, nested) in &schema.block.blocks {
        let before = non_null(prior.and_then(|p| p.get(name)));
        let after = non_null(planned.get(name));
        if same_blocks(nested, before, after) {
            continue;
        }

        changes.push(AttributeChange::new(name.clone(), before.cloned(), after.cloned()));
        requires_replace |= nested.force_new && prior.is_some();
    }

    Ok(PlanResult::with_changes(
        Value::Object(planned),
        changes,
        requires_replace,
    ))
}

fn plan_delete(prior: Option<&Map<String, Value>>) -> PlanResult {
    let changes = prior
        .into_iter()
        .flatten()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| AttributeChange::removed(name.clone(), value.clone()))
        .collect();
    PlanResult::with_changes(Value::Null, changes, false)
}

fn fill_unset(block: &Block, prior: Option<&Map<String, Value>>, planned: &mut Map<String, Value>) {
    for (name, attr) in &block.attributes {
        if non_null(planned.get(name)).is_some() {
            continue;
        }

        if let Some(default) = &attr.default {
            planned.insert(name.clone(), default.clone());
        } else if attr.flags.computed {
            if let Some(value) = non_null(prior.and_then(|p| p.get(name))) {
                planned.insert(name.clone(), value.clone());
            }
        }
    }

    for (name, nested) in &block.blocks {
        let Some(Value::Array(prior_items)) = prior.and_then(|p| p.get(name)) else {
            continue;
        };
        let Some(Value::Array(items)) = planned.get_mut(name) else {
            continue;
        };

        for item in items.iter_mut() {
            let wanted = canonical(&nested.block, item);
            if let Some(previous) = prior_items
                .iter()
                .find(|previous| canonical(&nested.block, previous) == wanted)
            {
                *item = previous.clone();
            }
        }
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Compare two block lists as sets, ignoring computed attributes.
fn same_blocks(nested: &NestedBlock, before: Option<&Value>, after: Option<&Value>) -> bool {
    let keys = |value: Option<&Value>| -> Vec<String> {
        let mut keys: Vec<String> = value
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|item| canonical(&nested.block, item).to_string())
            .collect();
        keys.sort();
        keys
    };
    keys(before) == keys(after)
}

/// A block item with computed-only attributes and nulls removed, and set
/// attributes sorted.
fn canonical(block: &Block, item: &Value) -> Value {
    let Value::Object(map) = item else {
        return item.clone();
    };

    let mut out = Map::new();
    for (name, value) in map {
        if value.is_null() {
            continue;
        }
        match block.attributes.get(name) {
            Some(attr) if attr.flags.is_computed_only() => {},
            Some(attr) if matches!(attr.attr_type, AttributeType::Set(_)) => {
                let mut items: Vec<Value> = value.as_array().cloned().unwrap_or_default();
                items.sort_by_key(|v| v.to_string());
                out.insert(name.clone(), Value::Array(items));
            },
            _ => {
                out.insert(name.clone(), value.clone());
            },
        }
    }
    Value::Object(out)
}
