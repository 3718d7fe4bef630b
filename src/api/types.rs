// API Types
//
// Response bodies and query parameters shared by the explorer and admin
// endpoints.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannedHeight {
    pub general_scanned_height: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressBalance {
    pub address: String,
    /// Satoshis
    pub balance: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AppsQuery {
    /// Also reindex/rescan the app collections
    #[serde(default)]
    pub apps: bool,
}

// ========== Error Types ==========

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiError {
    pub error: ErrorDetail,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorDetail {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            error: ErrorDetail {
                message: message.into(),
            },
        }
    }
}
