//! HTTP handlers
//!
//! Thin translation between the HTTP surface and the storage/merge
//! layers: parse, look up, delegate, map errors. Write handlers go
//! through the primary store and mirror to the object-store tier for
//! bucket-flagged builds; read handlers route to one tier.

pub mod append;
pub mod builds;
pub mod status;
pub mod views;

use serde::Serialize;

/// Response body for the create/append endpoints: the created resource id
/// (omitted for appends) and its URI.
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub uri: String,
}
