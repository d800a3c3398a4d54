//! Validation and normalization of public-API inputs into wire
//! [`Message`]s. Every entry point validates required fields, injects the
//! library metadata, and produces an immutable message; nothing downstream
//! mutates a message again.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{
    self, Message, MessageKind, Properties, LIB_NAME, LIB_VERSION,
};

const MAX_DISTINCT_ID_LEN: usize = 200;

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::InvalidMessage(format!("{field} must be given")))
    } else {
        Ok(())
    }
}

fn require_distinct_id(distinct_id: &str) -> Result<()> {
    require("distinct_id", distinct_id)?;
    if distinct_id.len() > MAX_DISTINCT_ID_LEN {
        return Err(Error::InvalidMessage(format!(
            "distinct_id must be {MAX_DISTINCT_ID_LEN} characters or fewer"
        )));
    }
    Ok(())
}

/// Base properties carried by every message kind.
fn base_properties(mut properties: Properties) -> Properties {
    properties.insert("$lib".to_owned(), LIB_NAME.into());
    properties.insert("$lib_version".to_owned(), LIB_VERSION.into());
    properties
}

fn build(
    kind: MessageKind,
    event: String,
    distinct_id: String,
    properties: Properties,
    set: Option<Properties>,
    uuid: Option<&str>,
) -> Message {
    Message {
        kind,
        event,
        distinct_id,
        timestamp: message::utc_timestamp(),
        message_id: message::new_message_id(),
        properties,
        set,
        library: LIB_NAME.to_owned(),
        library_version: LIB_VERSION.to_owned(),
        // An unparseable uuid is dropped silently rather than reported.
        uuid: uuid.filter(|u| message::is_valid_uuid(u)).map(str::to_owned),
    }
}

pub(crate) fn capture(
    distinct_id: &str,
    event: &str,
    properties: Properties,
    groups: &HashMap<String, String>,
    feature_variants: &Properties,
    uuid: Option<&str>,
) -> Result<Message> {
    require_distinct_id(distinct_id)?;
    require("event", event)?;

    let mut properties = base_properties(properties);
    if !groups.is_empty() {
        let group_map: Properties = groups
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        properties.insert("$groups".to_owned(), Value::Object(group_map));
    }
    if !feature_variants.is_empty() {
        let mut active: Vec<Value> = Vec::new();
        for (key, value) in feature_variants {
            properties.insert(format!("$feature/{key}"), value.clone());
            if *value != Value::Bool(false) {
                active.push(Value::String(key.clone()));
            }
        }
        properties.insert("$active_feature_flags".to_owned(), Value::Array(active));
    }

    Ok(build(
        MessageKind::Capture,
        event.to_owned(),
        distinct_id.to_owned(),
        properties,
        None,
        uuid,
    ))
}

pub(crate) fn identify(
    distinct_id: &str,
    properties: Properties,
    uuid: Option<&str>,
) -> Result<Message> {
    require_distinct_id(distinct_id)?;

    // Caller properties become the $set payload; the base metadata stays in
    // the regular properties bag.
    Ok(build(
        MessageKind::Identify,
        "$identify".to_owned(),
        distinct_id.to_owned(),
        base_properties(Properties::new()),
        Some(properties),
        uuid,
    ))
}

pub(crate) fn alias(distinct_id: &str, alias: &str, uuid: Option<&str>) -> Result<Message> {
    require_distinct_id(distinct_id)?;
    require("alias", alias)?;

    let mut properties = base_properties(Properties::new());
    properties.insert("distinct_id".to_owned(), distinct_id.into());
    properties.insert("alias".to_owned(), alias.into());

    Ok(build(
        MessageKind::Alias,
        "$create_alias".to_owned(),
        distinct_id.to_owned(),
        properties,
        None,
        uuid,
    ))
}

pub(crate) fn group_identify(
    group_type: &str,
    group_key: &str,
    properties: Properties,
    distinct_id: Option<&str>,
    uuid: Option<&str>,
) -> Result<Message> {
    require("group_type", group_type)?;
    require("group_key", group_key)?;
    let distinct_id = match distinct_id {
        Some(id) => {
            require_distinct_id(id)?;
            id.to_owned()
        }
        None => format!("${group_type}_{group_key}"),
    };

    let mut bag = base_properties(Properties::new());
    bag.insert("$group_type".to_owned(), group_type.into());
    bag.insert("$group_key".to_owned(), group_key.into());
    bag.insert("$group_set".to_owned(), Value::Object(properties));

    Ok(build(
        MessageKind::GroupIdentify,
        "$groupidentify".to_owned(),
        distinct_id,
        bag,
        None,
        uuid,
    ))
}

/// `exception_properties` is the `$exception_*` bag produced by
/// [`crate::exception`].
pub(crate) fn exception(
    distinct_id: &str,
    exception_properties: Properties,
    uuid: Option<&str>,
) -> Result<Message> {
    require_distinct_id(distinct_id)?;

    Ok(build(
        MessageKind::Exception,
        "$exception".to_owned(),
        distinct_id.to_owned(),
        base_properties(exception_properties),
        None,
        uuid,
    ))
}
