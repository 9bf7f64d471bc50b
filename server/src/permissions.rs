//! Permission gate for inbound viewer calls.

use crate::client_manager::ClientSession;
use crate::error::{RelayError, Result};
use crate::rpc::{lookup_inbound, Permission};
use shared::{Capability, Event};

/// Decides whether `session` may invoke `event`.
///
/// Engine-driver sessions bypass the gate. Unregistered calls are denied. A
/// subscribe/join call aimed at an always-on broadcast lobby is allowed regardless
/// of capabilities. Otherwise the call's permission must be open, or the session
/// must be logged in with at least one of the required capabilities. The outcome
/// depends only on the session's current identity and the call, never on history.
pub fn authorize(
    event: &Event,
    session: &ClientSession,
    is_always_on: impl Fn(&str) -> bool,
) -> Result<()> {
    if session.is_engine_driver {
        return Ok(());
    }

    let entry = lookup_inbound(&event.origin_class, &event.method).ok_or_else(|| {
        RelayError::PermissionDenied(format!("{}.{} is not callable", event.origin_class, event.method))
    })?;

    if entry.targets_lobby_join() && event.arg_id(0).is_some_and(|id| is_always_on(&id)) {
        return Ok(());
    }

    let required = match entry.permission {
        Permission::Open => return Ok(()),
        Permission::AnyOf(required) => required,
    };

    let Some(user) = session.identity() else {
        return Err(RelayError::NotLoggedIn);
    };

    if user.has_any(required) {
        Ok(())
    } else {
        Err(RelayError::PermissionDenied(describe(required)))
    }
}

fn describe(required: &[Capability]) -> String {
    required
        .iter()
        .map(Capability::to_string)
        .collect::<Vec<_>>()
        .join(" or ")
}
