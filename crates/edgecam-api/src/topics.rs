// ── MQTT topic table ──
//
// The device speaks a ThingsBoard-style topic layout. The topic set is
// fixed: attributes (with sub-keys), attribute requests, telemetry and
// the RPC channel.

/// Shared attributes pushed by the device, and deployment requests
/// pushed by us.
pub const ATTRIBUTES: &str = "v1/devices/me/attributes";

/// Attribute requests issued by the device.
pub const ATTRIBUTES_REQUEST: &str = "v1/devices/me/attributes/request/+";

/// Periodic telemetry. Only its arrival time is of interest.
pub const TELEMETRY: &str = "v1/devices/me/telemetry";

/// Responses to RPCs we sent.
pub const RPC_RESPONSES: &str = "v1/devices/me/rpc/response/+";

/// Prefix for RPC requests; a request id is appended.
pub const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";

// ── Attribute sub-keys ───────────────────────────────────────────────

/// Canonical device-state sub-key (base64 JSON device configuration).
pub const EA_STATE_TOPIC: &str = "state/backdoor-EA_Main/placeholder";

/// System information sub-key, carries the protocol version.
pub const SYSINFO_TOPIC: &str = "systemInfo";

/// Deployment status sub-key.
pub const DEPLOY_STATUS_TOPIC: &str = "deploymentStatus";

/// Attribute key used when pushing a deployment manifest.
pub const DEPLOYMENT_KEY: &str = "deployment";

/// Every topic the session subscribes to on connect.
pub const SUBSCRIPTIONS: [&str; 4] = [ATTRIBUTES, ATTRIBUTES_REQUEST, TELEMETRY, RPC_RESPONSES];

/// Returns `true` if `key` is a device-state attribute sub-key
/// (`state/<instance>/placeholder`).
pub fn is_state_key(key: &str) -> bool {
    key.strip_prefix("state/")
        .and_then(|rest| rest.strip_suffix("/placeholder"))
        .is_some_and(|instance| !instance.is_empty())
}

/// Build the topic for an outgoing RPC request.
pub fn rpc_request_topic(request_id: &str) -> String {
    format!("{RPC_REQUEST_PREFIX}{request_id}")
}
