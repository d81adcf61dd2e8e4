//! Endpoint eligibility: export flag, version gate and identity normalisation.

use crate::transport::{ComponentName, RemoteError, ServiceEntry, ServiceMetadata};
use crate::{META_API_VERSION, TARGET_API_VERSION};
use thiserror::Error;

/// Version reported when the metadata key is missing or not an integer.
pub const UNKNOWN_API_VERSION: i32 = -1;

/// A discovered service that passed eligibility checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub component: ComponentName,
    pub api_version: i32,
}

/// Why an endpoint was left out of the registry.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("adapter {component} is not exported")]
    NotExported { component: ComponentName },
    #[error("adapter {component} has no resolvable metadata: {reason}")]
    MetadataUnavailable {
        component: ComponentName,
        reason: String,
    },
    #[error("adapter {component} is outdated (found: {found}; target: {target})")]
    Outdated {
        component: ComponentName,
        found: i32,
        target: i32,
    },
    #[error("adapter {component} did not connect")]
    NotConnected { component: ComponentName },
    #[error("adapter {component} does not declare any unique name")]
    NoUniqueNames { component: ComponentName },
    #[error("adapter {component} failed identity query: {source}")]
    Remote {
        component: ComponentName,
        source: RemoteError,
    },
}

/// Read the advertised API version, [`UNKNOWN_API_VERSION`] if absent or malformed.
pub fn api_version_of(metadata: &ServiceMetadata) -> i32 {
    metadata
        .get(META_API_VERSION)
        .and_then(|v| v.as_int())
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(UNKNOWN_API_VERSION)
}

/// Apply the export and version checks to a queried service.
pub fn check_endpoint(
    entry: &ServiceEntry,
    metadata: Option<ServiceMetadata>,
) -> Result<EndpointDescriptor, DiscoveryError> {
    if !entry.exported {
        return Err(DiscoveryError::NotExported {
            component: entry.component.clone(),
        });
    }

    let Some(metadata) = metadata else {
        return Err(DiscoveryError::MetadataUnavailable {
            component: entry.component.clone(),
            reason: "service not found".to_string(),
        });
    };

    let api_version = api_version_of(&metadata);
    if api_version < TARGET_API_VERSION {
        return Err(DiscoveryError::Outdated {
            component: entry.component.clone(),
            found: api_version,
            target: TARGET_API_VERSION,
        });
    }

    Ok(EndpointDescriptor {
        component: entry.component.clone(),
        api_version,
    })
}

/// Pick the display name for `unique_name`.
///
/// Falls back to the unique name when the adapter supplied nothing. The second
/// value is true when the result equals the unique name ignoring case, which
/// means the adapter likely forgot to define one.
pub fn resolve_display_name(unique_name: &str, reported: &str) -> (String, bool) {
    let display = if reported.trim().is_empty() {
        unique_name.to_string()
    } else {
        reported.to_string()
    };
    let missing = display.to_lowercase() == unique_name.to_lowercase();
    (display, missing)
}
