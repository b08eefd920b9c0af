//! The serializable value type shared across step arguments, context entries,
//! and tool results. A plain `serde_json::Value` doubles as the wire
//! representation for the JSON-RPC frames in `mcpflow-transport`, so no
//! conversion is needed at the transport boundary.

/// Canonical serializable value used throughout the workflow engine.
pub type Value = serde_json::Value;
