// Copyright 2020 Joyent, Inc.

use serde_derive::{Deserialize, Serialize};

use crate::protocol::CB_COMPOUND_MAX_TAG;

/// RPC program number the client registers for its back channel.
pub const DEFAULT_CB_PROGRAM: u32 = 0x2883A;
pub const DEFAULT_SERVER_TAG: &str = "nfs41-callback";
/// Capacity of each replay cache buffer.
pub const DEFAULT_MAX_CACHE: usize = 1024;
pub const SUPPORTED_MINOR_VERSION: u32 = 1;

/// Immutable settings shared by every session of a callback server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallbackConfig {
    pub program: u32,
    pub server_tag: String,
    pub max_cache: usize,
    pub minor_version: u32,
}

impl Default for CallbackConfig {
    fn default() -> CallbackConfig {
        CallbackConfig {
            program: DEFAULT_CB_PROGRAM,
            server_tag: String::from(DEFAULT_SERVER_TAG),
            max_cache: DEFAULT_MAX_CACHE,
            minor_version: SUPPORTED_MINOR_VERSION,
        }
    }
}

impl CallbackConfig {
    pub fn from_json(json: &str) -> Result<CallbackConfig, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The tag placed in every CB_COMPOUND reply, cut to the wire limit.
    pub fn reply_tag(&self) -> &[u8] {
        let tag = self.server_tag.as_bytes();
        &tag[..tag.len().min(CB_COMPOUND_MAX_TAG)]
    }
}
