use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of an image job inside the durable queue store.
///
/// There is no `completed` state: on success the row is deleted outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Dead,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InFlight => "in_flight",
            ItemStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "in_flight" => Some(ItemStatus::InFlight),
            "dead" => Some(ItemStatus::Dead),
            _ => None,
        }
    }
}

/// One pending unit of work: an uploaded image awaiting classification.
///
/// `item_id` doubles as the blob key; `row_id` is the store-internal
/// identifier used for recover/delete and is never exposed to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageQueueItem {
    pub row_id: i64,
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub bearing: f64,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}
