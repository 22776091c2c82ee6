//! Upsert-by-id persistence for hexes, flowers and rewards.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pollen_core::{Flower, Hex, PlaceInfo, Reward};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const HEX_TABLE: &str = "pollen_hexes";
pub const FLOWER_TABLE: &str = "pollen_flowers";
pub const REWARD_TABLE: &str = "pollen_rewards";

const PLACE_COLUMNS: &[&str] = &[
    "lat", "lng", "address", "suburb", "city", "state", "town", "county",
];

const HEX_COLUMNS: &[&str] = &[
    "id",
    "flower_count",
    "covered",
    "lat",
    "lng",
    "address",
    "suburb",
    "city",
    "state",
    "town",
    "county",
    "attach",
    "flowers",
    "flowers_contained",
    "bounty_reward",
    "loot_box_reward",
    "daily_reward",
    "bounty",
    "bounty_time",
];

const FLOWER_COLUMNS: &[&str] = &[
    "id",
    "bounty_rewards",
    "display_name",
    "update_time",
    "daily_bees_seen",
    "first_seen",
    "hbees_seen",
    "wallet_address",
    "covered_hexes",
    "last_seen",
    "daily_attaches",
    "h3_hex",
    "lat",
    "lng",
    "address",
    "suburb",
    "city",
    "state",
    "town",
    "county",
    "active",
    "flower_rewards",
    "daily_covered_hexes",
    "nft_address",
    "nickname",
    "flower_attaches",
    "daily_hbees_seen",
    "daily_rewards",
    "image_url",
    "bees_seen",
];

const REWARD_COLUMNS: &[&str] = &[
    "id",
    "pcn",
    "pic",
    "rse_ratio",
    "client",
    "coverage",
    "daily_pic",
    "date",
    "device",
    "device_type",
    "reward",
    "transaction",
    "transaction_status",
    "wallet",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable store for the three synced record kinds.
///
/// Every upsert overwrites all columns of an existing row and stamps `updated_at`
/// with the write time, whether or not any value changed. When one call carries the
/// same id more than once, the last occurrence wins.
#[async_trait]
pub trait Store: Send + Sync {
    /// Enrichment columns already persisted, keyed by cell id. Hex rows come first,
    /// then flower rows keyed by `h3_hex`.
    async fn cached_places(&self) -> Result<Vec<(String, PlaceInfo)>, StoreError>;

    async fn flower_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn upsert_flowers(&self, flowers: &[Flower], batch_size: usize) -> Result<(), StoreError>;

    async fn upsert_rewards(&self, rewards: &[Reward], batch_size: usize) -> Result<(), StoreError>;

    async fn upsert_hex(&self, hex: &Hex) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Creates the tables and the `(device, date DESC)` reward index if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn load_places(&self, table: &str, key_column: &str) -> Result<Vec<(String, PlaceInfo)>, StoreError> {
        let sql = format!(
            "SELECT {key_column} AS cell, {} FROM {table}",
            PLACE_COLUMNS.join(", ")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, PlaceInfo), StoreError> {
                Ok((row.try_get("cell")?, place_from_row(row)?))
            })
            .collect()
    }
}

fn place_from_row(row: &PgRow) -> Result<PlaceInfo, sqlx::Error> {
    Ok(PlaceInfo {
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        address: row.try_get("address")?,
        suburb: row.try_get("suburb")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        town: row.try_get("town")?,
        county: row.try_get("county")?,
    })
}

fn flower_id(flower: &Flower) -> &str {
    &flower.id
}

fn reward_id(reward: &Reward) -> &str {
    &reward.id
}

/// Keeps only the last row per id; Postgres refuses to update one row twice in a statement.
fn last_by_id<'a, T>(rows: &'a [T], id: fn(&T) -> &str) -> Vec<&'a T> {
    let mut latest = HashMap::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        latest.insert(id(row), index);
    }
    rows.iter()
        .enumerate()
        .filter(|(index, row)| latest.get(id(row)) == Some(index))
        .map(|(_, row)| row)
        .collect()
}

fn quoted(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| format!("\"{c}\"")).collect()
}

fn insert_prefix(table: &str, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {table} ({}, updated_at) ",
        quoted(columns).join(", ")
    )
}

fn upsert_suffix(columns: &[&str]) -> String {
    let assignments = quoted(columns)
        .into_iter()
        .filter(|c| c != "\"id\"")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT (id) DO UPDATE SET {assignments}, updated_at = now()")
}

#[async_trait]
impl Store for PgStore {
    async fn cached_places(&self) -> Result<Vec<(String, PlaceInfo)>, StoreError> {
        let mut places = self.load_places(HEX_TABLE, "id").await?;
        places.extend(self.load_places(FLOWER_TABLE, "h3_hex").await?);
        Ok(places)
    }

    async fn flower_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM pollen_flowers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn upsert_flowers(&self, flowers: &[Flower], batch_size: usize) -> Result<(), StoreError> {
        let flowers = last_by_id(flowers, flower_id);
        for chunk in flowers.chunks(batch_size.max(1)) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(insert_prefix(FLOWER_TABLE, FLOWER_COLUMNS));
            qb.push_values(chunk, |mut b, f| {
                b.push_bind(f.id.clone())
                    .push_bind(f.bounty_rewards)
                    .push_bind(f.display_name.clone())
                    .push_bind(f.update_time.clone())
                    .push_bind(f.daily_bees_seen.clone())
                    .push_bind(f.first_seen.clone())
                    .push_bind(f.hbees_seen.clone())
                    .push_bind(f.wallet_address.clone())
                    .push_bind(f.covered_hexes.clone())
                    .push_bind(f.last_seen.clone())
                    .push_bind(f.daily_attaches)
                    .push_bind(f.h3_hex.clone())
                    .push_bind(f.place.lat)
                    .push_bind(f.place.lng)
                    .push_bind(f.place.address.clone())
                    .push_bind(f.place.suburb.clone())
                    .push_bind(f.place.city.clone())
                    .push_bind(f.place.state.clone())
                    .push_bind(f.place.town.clone())
                    .push_bind(f.place.county.clone())
                    .push_bind(f.active)
                    .push_bind(f.flower_rewards)
                    .push_bind(f.daily_covered_hexes.clone())
                    .push_bind(f.nft_address.clone())
                    .push_bind(f.nickname.clone())
                    .push_bind(f.flower_attaches)
                    .push_bind(f.daily_hbees_seen.clone())
                    .push_bind(f.daily_rewards)
                    .push_bind(f.image_url.clone())
                    .push_bind(f.bees_seen.clone())
                    .push("now()");
            });
            qb.push(upsert_suffix(FLOWER_COLUMNS));
            qb.build().execute(&self.pool).await?;
            debug!(rows = chunk.len(), table = FLOWER_TABLE, "upserted batch");
        }
        Ok(())
    }

    async fn upsert_rewards(&self, rewards: &[Reward], batch_size: usize) -> Result<(), StoreError> {
        let rewards = last_by_id(rewards, reward_id);
        for chunk in rewards.chunks(batch_size.max(1)) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(insert_prefix(REWARD_TABLE, REWARD_COLUMNS));
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.id.clone())
                    .push_bind(r.pcn)
                    .push_bind(r.pic)
                    .push_bind(r.rse_ratio)
                    .push_bind(r.client.clone())
                    .push_bind(r.coverage.clone())
                    .push_bind(r.daily_pic)
                    .push_bind(r.date.clone())
                    .push_bind(r.device.clone())
                    .push_bind(r.device_type.clone())
                    .push_bind(r.reward.clone())
                    .push_bind(r.transaction.clone())
                    .push_bind(r.transaction_status.clone())
                    .push_bind(r.wallet.clone())
                    .push("now()");
            });
            qb.push(upsert_suffix(REWARD_COLUMNS));
            qb.build().execute(&self.pool).await?;
            debug!(rows = chunk.len(), table = REWARD_TABLE, "upserted batch");
        }
        Ok(())
    }

    async fn upsert_hex(&self, hex: &Hex) -> Result<(), StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(HEX_TABLE, HEX_COLUMNS));
        qb.push_values(std::iter::once(hex), |mut b, h| {
            b.push_bind(h.id.clone())
                .push_bind(h.flower_count)
                .push_bind(h.covered)
                .push_bind(h.place.lat)
                .push_bind(h.place.lng)
                .push_bind(h.place.address.clone())
                .push_bind(h.place.suburb.clone())
                .push_bind(h.place.city.clone())
                .push_bind(h.place.state.clone())
                .push_bind(h.place.town.clone())
                .push_bind(h.place.county.clone())
                .push_bind(h.attach)
                .push_bind(h.flowers.clone())
                .push_bind(h.flowers_contained.clone())
                .push_bind(h.bounty_reward)
                .push_bind(h.loot_box_reward)
                .push_bind(h.daily_reward)
                .push_bind(h.bounty.clone())
                .push_bind(h.bounty_time.clone())
                .push("now()");
        });
        qb.push(upsert_suffix(HEX_COLUMNS));
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// A persisted record together with its last write time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow<T> {
    pub record: T,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    hexes: BTreeMap<String, StoredRow<Hex>>,
    flowers: BTreeMap<String, StoredRow<Flower>>,
    rewards: BTreeMap<String, StoredRow<Reward>>,
    last_write: Option<DateTime<Utc>>,
}

impl MemoryTables {
    // Writes never share a timestamp, so later upserts always compare greater.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_write {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_write = Some(stamp);
        stamp
    }
}

/// In-process store with the same upsert semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn hexes(&self) -> Vec<StoredRow<Hex>> {
        self.tables.lock().await.hexes.values().cloned().collect()
    }

    pub async fn flowers(&self) -> Vec<StoredRow<Flower>> {
        self.tables.lock().await.flowers.values().cloned().collect()
    }

    pub async fn rewards(&self) -> Vec<StoredRow<Reward>> {
        self.tables.lock().await.rewards.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn cached_places(&self) -> Result<Vec<(String, PlaceInfo)>, StoreError> {
        let tables = self.tables.lock().await;
        let hexes = tables
            .hexes
            .values()
            .map(|row| (row.record.id.clone(), row.record.place.clone()));
        let flowers = tables
            .flowers
            .values()
            .map(|row| (row.record.h3_hex.clone(), row.record.place.clone()));
        Ok(hexes.chain(flowers).collect())
    }

    async fn flower_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.lock().await.flowers.keys().cloned().collect())
    }

    async fn upsert_flowers(&self, flowers: &[Flower], _batch_size: usize) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for flower in flowers {
            let updated_at = tables.stamp();
            tables.flowers.insert(
                flower.id.clone(),
                StoredRow {
                    record: flower.clone(),
                    updated_at,
                },
            );
        }
        Ok(())
    }

    async fn upsert_rewards(&self, rewards: &[Reward], _batch_size: usize) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for reward in rewards {
            let updated_at = tables.stamp();
            tables.rewards.insert(
                reward.id.clone(),
                StoredRow {
                    record: reward.clone(),
                    updated_at,
                },
            );
        }
        Ok(())
    }

    async fn upsert_hex(&self, hex: &Hex) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let updated_at = tables.stamp();
        tables.hexes.insert(
            hex.id.clone(),
            StoredRow {
                record: hex.clone(),
                updated_at,
            },
        );
        Ok(())
    }
}
