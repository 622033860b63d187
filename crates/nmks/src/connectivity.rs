//! Connectivity-check disabling strategy
//!
//! With the connectivity check enabled NetworkManager inflates the route
//! metric of the dummy block-all interface (by 20000), which breaks the
//! priority ordering the kill switch relies on. How the flag is turned off
//! depends on the service version; the table below is the only place
//! that knows the thresholds.

use crate::error::{KillSwitchError, Result};
use crate::service::{PropertyTarget, PropertyValue};
use semver::Version;

/// Way of turning the connectivity check off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityCheckStrategy {
    /// `connectivity_check_set_enabled`, deprecated since 1.22
    LegacySetter,
    /// Generic property write, available from 1.24
    PropertyWrite,
}

/// `(minimum version, strategy)`, ascending.
const STRATEGIES: &[((u64, u64, u64), ConnectivityCheckStrategy)] = &[
    ((0, 0, 0), ConnectivityCheckStrategy::LegacySetter),
    ((1, 24, 0), ConnectivityCheckStrategy::PropertyWrite),
];

pub const NM_OBJECT_PATH: &str = "/org/freedesktop/NetworkManager";
pub const NM_INTERFACE: &str = "org.freedesktop.NetworkManager";
pub const CONNECTIVITY_CHECK_PROPERTY: &str = "ConnectivityCheckEnabled";

impl ConnectivityCheckStrategy {
    /// Strategy for a service version string.
    pub fn for_version(version: &str) -> Result<Self> {
        Ok(Self::select(&parse_service_version(version)?))
    }

    /// Strategy of the highest threshold not above `version`.
    pub fn select(version: &Version) -> Self {
        STRATEGIES
            .iter()
            .rev()
            .find(|((major, minor, patch), _)| *version >= Version::new(*major, *minor, *patch))
            .map(|(_, strategy)| *strategy)
            .unwrap_or(ConnectivityCheckStrategy::LegacySetter)
    }
}

/// Property write that disables the connectivity check.
pub fn disable_property() -> (PropertyTarget, PropertyValue) {
    (
        PropertyTarget {
            object_path: NM_OBJECT_PATH.to_string(),
            interface_name: NM_INTERFACE.to_string(),
            property_name: CONNECTIVITY_CHECK_PROPERTY.to_string(),
        },
        PropertyValue::Bool(false),
    )
}

/// Parse versions as services report them: `1.22`, `1.26.2`,
/// `1.46.0-1.fc39`. Only the numeric `major.minor.patch` prefix counts.
pub fn parse_service_version(raw: &str) -> Result<Version> {
    let numeric = raw
        .trim()
        .split(|c: char| c == '-' || c == '+' || c.is_whitespace())
        .next()
        .unwrap_or_default();

    let mut parts = [0u64; 3];
    let mut count = 0;
    for (slot, piece) in parts.iter_mut().zip(numeric.split('.')) {
        *slot = piece.parse().map_err(|_| {
            KillSwitchError::BackendUnavailable(format!("unrecognized service version {raw:?}"))
        })?;
        count += 1;
    }
    if count == 0 || numeric.split('.').count() > 3 {
        return Err(KillSwitchError::BackendUnavailable(format!(
            "unrecognized service version {raw:?}"
        )));
    }

    Ok(Version::new(parts[0], parts[1], parts[2]))
}
