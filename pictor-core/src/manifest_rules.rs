//! Install-time manifest semantics.
//!
//! Structural parsing happens in `pictor-model`; this module checks the
//! cross-field rules a manifest must satisfy before anything touches disk:
//! capability/event implications, command event requirements, throttling
//! policy coherence, and JSON-schema well-formedness of `settings` and
//! command `parameters`.

use jsonschema::{Draft, Validator};
use serde_json::Value;

use pictor_model::manifest::{
    Capability, EventName, ExtensionManifest, InstructionGroup,
    SchemaDocument, SchemaDraft,
};

use crate::error::{HostError, Result};

fn invariant(message: impl Into<String>) -> HostError {
    HostError::ManifestInvariantViolated(message.into())
}

/// Validate every semantic rule. Returns the first violation found.
pub fn validate_manifest(manifest: &ExtensionManifest) -> Result<()> {
    if manifest.runtimes.is_empty() {
        return Err(invariant("manifest declares no runtimes"));
    }
    if manifest.instructions.is_empty() {
        return Err(invariant("manifest declares no instruction groups"));
    }

    compile_schema(&manifest.settings)
        .map_err(|err| invariant(format!("settings schema: {err}")))?;

    for (index, group) in manifest.instructions.iter().enumerate() {
        validate_group(index, group)?;
    }
    Ok(())
}

fn validate_group(index: usize, group: &InstructionGroup) -> Result<()> {
    if group.events.is_empty() {
        return Err(invariant(format!(
            "instruction group {index} subscribes to no events"
        )));
    }

    for capability in &group.capabilities {
        require_capability_events(index, group, *capability)?;
    }

    for command in &group.commands {
        let required_run_event = match command.on.entity {
            pictor_model::manifest::CommandEntity::Process => {
                EventName::ProcessRunCommand
            }
            _ => EventName::ImageRunCommand,
        };
        for required in [EventName::ProcessStarted, required_run_event] {
            if !group.events.contains(&required) {
                return Err(invariant(format!(
                    "command '{}' requires event {required}",
                    command.id
                )));
            }
        }
        if let Some(parameters) = &command.parameters {
            compile_schema(parameters).map_err(|err| {
                invariant(format!(
                    "command '{}' parameters schema: {err}",
                    command.id
                ))
            })?;
        }
    }

    for policy in &group.throttling_policies {
        if !policy.has_bound() {
            return Err(invariant(format!(
                "instruction group {index} has a throttling policy with \
                 neither maximumCount nor durationInMilliseconds"
            )));
        }
        for event in &policy.events {
            if !group.events.contains(event) {
                return Err(invariant(format!(
                    "throttling policy names {event} which its group does \
                     not subscribe to"
                )));
            }
        }
    }

    Ok(())
}

fn require_capability_events(
    index: usize,
    group: &InstructionGroup,
    capability: Capability,
) -> Result<()> {
    if !group.events.contains(&EventName::ProcessStarted) {
        return Err(invariant(format!(
            "capability {capability} in instruction group {index} requires \
             ProcessStarted"
        )));
    }
    for required in capability.required_events() {
        if !group.events.contains(required) {
            return Err(invariant(format!(
                "capability {capability} requires event {required}"
            )));
        }
    }
    Ok(())
}

/// Compile an opaque schema document under its declared dialect.
pub fn compile_schema(
    document: &SchemaDocument,
) -> std::result::Result<Validator, String> {
    let draft = match document.draft {
        SchemaDraft::Draft7 => Draft::Draft7,
        SchemaDraft::Draft2020_12 => Draft::Draft202012,
    };
    jsonschema::options()
        .with_draft(draft)
        .build(&document.root)
        .map_err(|err| err.to_string())
}

/// Validate a runtime value (settings blob, command parameters) against a
/// manifest schema.
pub fn check_against_schema(
    document: &SchemaDocument,
    value: &Value,
) -> Result<()> {
    let validator = compile_schema(document)
        .map_err(HostError::ManifestInvariantViolated)?;
    if let Some(error) = validator.iter_errors(value).next() {
        return Err(HostError::ManifestInvariantViolated(format!(
            "value does not match schema: {error}"
        )));
    }
    Ok(())
}
