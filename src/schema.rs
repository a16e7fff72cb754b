use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;
use trigger_plugin::message::{Checkpoint, DispatchedEvent, Subscription};

use crate::subscription_config::SubscriptionConfig;

/// Writes the JSON schemas a host needs to author configs and consume output.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;
    let schemas = [
        ("subscription-config.schema.json", serde_json::to_string_pretty(&schema_for!(SubscriptionConfig))?),
        ("subscription.schema.json", serde_json::to_string_pretty(&schema_for!(Subscription))?),
        ("checkpoint.schema.json", serde_json::to_string_pretty(&schema_for!(Checkpoint))?),
        ("dispatched-event.schema.json", serde_json::to_string_pretty(&schema_for!(DispatchedEvent))?),
    ];
    let mut written = Vec::with_capacity(schemas.len());
    for (name, body) in schemas {
        fs::write(out_dir.join(name), body)?;
        written.push(name.to_string());
    }
    Ok(written)
}
