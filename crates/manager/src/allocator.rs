//! Port validation for new instances.
//!
//! A candidate port is checked against a live listener probe, then against
//! every port already recorded in the registry, then against the allowed
//! range. The first failing check wins, so operators see "not free" before
//! "not valid" even for a privileged port that happens to be open.

use crate::collaborators::PortProbe;
use crate::error::PortError;
use common::InstanceRecord;

/// Lowest port that is never valid. Valid ports are strictly above it.
pub const MIN_PORT: u16 = 1024;
/// Highest port that is never valid. Valid ports are strictly below it.
pub const MAX_PORT: u16 = 65535;

pub fn validate_port<P>(candidate: u16, probe: &P, records: &[InstanceRecord]) -> Result<(), PortError>
where
    P: PortProbe + ?Sized,
{
    if probe.is_listening(candidate) {
        return Err(PortError::PortInUseLocally(candidate));
    }

    // Any port of any record, not just the same role.
    if let Some(owner) = records.iter().find(|r| r.ports().contains(&candidate)) {
        return Err(PortError::PortReservedByInstance {
            port: candidate,
            id: owner.id.clone(),
        });
    }

    if !is_in_range(candidate) {
        return Err(PortError::PortOutOfRange(candidate));
    }

    Ok(())
}

pub fn is_in_range(port: u16) -> bool {
    MIN_PORT < port && port < MAX_PORT
}
