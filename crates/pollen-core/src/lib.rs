//! Core domain records and cell-id helpers for the Pollen explorer sync.

use std::fmt;
use std::str::FromStr;

use h3o::{CellIndex, LatLng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pollen-core";

/// Length of a textual H3 cell index as served by the explorer API.
pub const CELL_ID_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid argument {0:?}, should be a comma-separated list of H3 hexes")]
    InvalidHexGroup(String),
    #[error("invalid H3 cell id {0:?}")]
    InvalidCell(String),
}

/// Reverse-geocoded enrichment attached to hexes and flowers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaceInfo {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
    pub suburb: String,
    pub city: String,
    pub state: String,
    pub town: String,
    pub county: String,
}

/// A coverage cell, keyed by its H3 cell id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hex {
    pub id: String,
    pub flower_count: i64,
    pub covered: i64,
    pub place: PlaceInfo,
    pub attach: i64,
    pub flowers: Vec<String>,
    pub flowers_contained: Vec<String>,
    pub bounty_reward: f64,
    pub loot_box_reward: i64,
    pub daily_reward: i64,
    pub bounty: String,
    pub bounty_time: String,
}

/// A device node, keyed by its flower id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Flower {
    pub id: String,
    pub bounty_rewards: i64,
    pub display_name: String,
    pub update_time: String,
    pub daily_bees_seen: Vec<String>,
    pub first_seen: Option<String>,
    pub hbees_seen: Vec<String>,
    pub wallet_address: String,
    pub covered_hexes: Vec<String>,
    pub last_seen: Option<String>,
    pub daily_attaches: i64,
    pub h3_hex: String,
    pub place: PlaceInfo,
    pub active: i64,
    pub flower_rewards: f64,
    pub daily_covered_hexes: Vec<String>,
    pub nft_address: String,
    pub nickname: String,
    pub flower_attaches: i64,
    pub daily_hbees_seen: Vec<String>,
    pub daily_rewards: f64,
    pub image_url: String,
    /// JSON text of the upstream `bees_seen` map.
    pub bees_seen: String,
}

/// One reward ledger entry, keyed by the upstream reward id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reward {
    pub id: String,
    pub pcn: f64,
    pub pic: f64,
    pub rse_ratio: f64,
    pub client: String,
    pub coverage: Vec<String>,
    pub daily_pic: f64,
    pub date: String,
    pub device: String,
    pub device_type: String,
    pub reward: String,
    pub transaction: String,
    pub transaction_status: String,
    pub wallet: String,
}

/// Returns true when every comma-separated token is a 15 character hex cell id.
pub fn is_valid_hex(s: &str) -> bool {
    s.split(',').all(is_valid_cell_token)
}

fn is_valid_cell_token(token: &str) -> bool {
    token.len() == CELL_ID_LEN && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// A validated, caller-supplied bounding area of H3 cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HexGroup(String);

impl HexGroup {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty() || !is_valid_hex(s) {
            return Err(CoreError::InvalidHexGroup(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The comma-joined cell ids, as sent upstream.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.0.split(',')
    }
}

impl FromStr for HexGroup {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HexGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Center of an H3 cell in degrees, as `(lat, lng)`.
pub fn cell_to_lat_lng(cell_id: &str) -> Result<(f64, f64), CoreError> {
    let cell = CellIndex::from_str(cell_id)
        .map_err(|_| CoreError::InvalidCell(cell_id.to_string()))?;
    let center = LatLng::from(cell);
    Ok((center.lat(), center.lng()))
}
