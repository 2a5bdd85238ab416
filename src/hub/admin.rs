//! The hub's provisioning servant.
//!
//! Served in-process on the `WiseAdmin` channel under identity `WiseAdmin`.
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `create_socket` | `ws_name` | `null`; `AlreadyUsedEndpoint` if taken |
//! | `remove_socket` | `ws_name` | `true` if a channel was removed |
//! | `list_sockets` | none | provisioned channel names, sorted |

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use serde_json::Value as JsonValue;

use crate::adapter::Servant;
use crate::error::{Error, Result};
use crate::protocol::{
    ADMIN_WS_NAME, CREATE_SOCKET_METHOD, LIST_SOCKETS_METHOD, REMOVE_SOCKET_METHOD, Value,
};

use super::HubInner;

// ============================================================================
// Servant
// ============================================================================

/// Builds the admin servant for `hub`.
pub(crate) fn servant(hub: Weak<HubInner>) -> Servant {
    let create = hub.clone();
    let remove = hub.clone();
    let list = hub;

    Servant::new()
        .with_method(CREATE_SOCKET_METHOD, move |args| {
            let ws_name: String = args.arg(0)?;
            upgrade(&create)?.create_channel(&ws_name)
        })
        .with_method(REMOVE_SOCKET_METHOD, move |args| {
            let ws_name: String = args.arg(0)?;
            Ok(upgrade(&remove)?.remove_channel(&ws_name))
        })
        .with_method(LIST_SOCKETS_METHOD, move |_| {
            let names = upgrade(&list)?.channel_names();
            Ok(Value::from(JsonValue::from(names)))
        })
}

fn upgrade(hub: &Weak<HubInner>) -> Result<Arc<HubInner>> {
    hub.upgrade()
        .ok_or_else(|| Error::connection_closed(ADMIN_WS_NAME))
}
