//! Upstream API contracts: the Pollen explorer API and the Nominatim reverse geocoder.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use pollen_core::HexGroup;
use pollen_storage::{FetchError, HttpClientConfig, HttpFetcher, RateLimit, RetryPolicy};
use reqwest::Url;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pollen-adapters";

pub const DEFAULT_EXPLORER_BASE_URL: &str = "https://api.pollenmobile.io";
pub const DEFAULT_EXPLORER_ORIGIN: &str = "https://explorer.pollenmobile.io";
pub const DEFAULT_NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid upstream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Accepts `null` wherever the upstream omits a string or list.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Numbers arrive as JSON numbers or as strings; `null` and `""` read as zero.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    match Option::<RawNumber>::deserialize(deserializer)? {
        None => Ok(0.0),
        Some(RawNumber::Int(n)) => Ok(n as f64),
        Some(RawNumber::Float(n)) => Ok(n),
        Some(RawNumber::Text(s)) if s.trim().is_empty() => Ok(0.0),
        Some(RawNumber::Text(s)) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Option::<RawNumber>::deserialize(deserializer)? {
        None => Ok(0),
        Some(RawNumber::Int(n)) => Ok(n),
        Some(RawNumber::Float(n)) => Ok(n as i64),
        Some(RawNumber::Text(s)) if s.trim().is_empty() => Ok(0),
        Some(RawNumber::Text(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map_err(de::Error::custom)
        }
    }
}

/// Hex grid entry from the area listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HexListItem {
    #[serde(rename = "h3_hex")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub covered: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub flower_count: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HexDetail {
    /// Some hexes come back as `{"hex": null}`; they still sync with listing data only.
    #[serde(default, deserialize_with = "nullable")]
    pub hex: HexDetailBody,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HexDetailBody {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub attach: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub flowers: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub flowers_contained: Vec<String>,
    #[serde(rename = "bountyReward", default, deserialize_with = "lenient_f64")]
    pub bounty_reward: f64,
    #[serde(rename = "lootBoxReward", default, deserialize_with = "lenient_i64")]
    pub loot_box_reward: i64,
    #[serde(rename = "dailyReward", default, deserialize_with = "lenient_i64")]
    pub daily_reward: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub bounty: String,
    #[serde(default, deserialize_with = "nullable")]
    pub bounty_time: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowerListItem {
    #[serde(rename = "flowerID")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bounty_rewards: i64,
    #[serde(rename = "displayname", default, deserialize_with = "nullable")]
    pub display_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub update_time: String,
    #[serde(default, deserialize_with = "nullable")]
    pub daily_bees_seen: Vec<String>,
    #[serde(default)]
    pub first_seen: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub hbees_seen: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub wallet_address: String,
    #[serde(default, deserialize_with = "nullable")]
    pub covered_hexes: Vec<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub daily_attaches: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub h3_hex: String,
    /// The listing reports activity under `attach`.
    #[serde(rename = "attach", default, deserialize_with = "lenient_i64")]
    pub active: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub flower_rewards: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub daily_covered_hexes: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub nft_address: String,
    #[serde(default, deserialize_with = "nullable")]
    pub nickname: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub flower_attaches: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub daily_hbees_seen: Vec<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub daily_rewards: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub image_url: String,
    #[serde(default)]
    pub bees_seen: JsonValue,
}

/// The reward `coverage` field: normally a list of cell ids, but some records carry
/// other shapes (for example the string `"[]"`). Anything that is not a list of
/// strings normalizes to an empty list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Coverage {
    Cells(Vec<String>),
    Malformed(JsonValue),
}

impl Default for Coverage {
    fn default() -> Self {
        Coverage::Cells(Vec::new())
    }
}

impl Coverage {
    pub fn into_cells(self) -> Vec<String> {
        match self {
            Coverage::Cells(cells) => cells,
            Coverage::Malformed(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RewardItem {
    #[serde(rename = "rewardID")]
    pub reward_id: String,
    #[serde(rename = "PCN", default, deserialize_with = "lenient_f64")]
    pub pcn: f64,
    #[serde(rename = "PIC", default, deserialize_with = "lenient_f64")]
    pub pic: f64,
    #[serde(rename = "RSEratio", default, deserialize_with = "lenient_f64")]
    pub rse_ratio: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub client: String,
    #[serde(default)]
    pub coverage: Coverage,
    #[serde(rename = "dailyPIC", default, deserialize_with = "lenient_f64")]
    pub daily_pic: f64,
    #[serde(default, deserialize_with = "nullable")]
    pub date: String,
    #[serde(default, deserialize_with = "nullable")]
    pub device: String,
    #[serde(default, deserialize_with = "nullable")]
    pub device_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub reward: String,
    #[serde(default, deserialize_with = "nullable")]
    pub transaction: String,
    #[serde(rename = "tx_status", default, deserialize_with = "nullable")]
    pub transaction_status: String,
    #[serde(default, deserialize_with = "nullable")]
    pub wallet: String,
}

/// Device reward history as served upstream: date → rewards earned that day.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct DeviceRewards(BTreeMap<String, Option<Vec<RewardItem>>>);

impl DeviceRewards {
    /// All rewards across dates, in ascending date-key order.
    pub fn into_items(self) -> Vec<RewardItem> {
        self.0.into_values().flatten().flatten().collect()
    }
}

#[async_trait]
pub trait ExplorerApi: Send + Sync {
    async fn hexes(&self, area: &HexGroup) -> Result<Vec<HexListItem>, AdapterError>;
    async fn hex_detail(&self, cell_id: &str) -> Result<HexDetail, AdapterError>;
    async fn flowers(&self) -> Result<Vec<FlowerListItem>, AdapterError>;
    async fn device_rewards(&self, device_id: &str) -> Result<Vec<RewardItem>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub origin: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub rate_limit_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EXPLORER_BASE_URL.to_string(),
            api_key: None,
            origin: DEFAULT_EXPLORER_ORIGIN.to_string(),
            user_agent: "Mozilla/5.0 (compatible; pollen-sync/0.1)".to_string(),
            timeout: Duration::from_secs(60),
            rate_limit_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExplorerConfig {
    pub fn http_client_config(&self) -> HttpClientConfig {
        let origin = self.origin.trim_end_matches('/');
        let mut headers = vec![
            ("accept".to_string(), "application/json".to_string()),
            ("origin".to_string(), origin.to_string()),
            ("referer".to_string(), format!("{origin}/")),
        ];
        if let Some(api_key) = &self.api_key {
            headers.push(("x-api-key".to_string(), api_key.clone()));
        }
        HttpClientConfig {
            timeout: self.timeout,
            user_agent: Some(self.user_agent.clone()),
            headers,
            retry: self.retry,
            rate_limit: Some(RateLimit::one_per(self.rate_limit_interval)),
        }
    }
}

fn endpoint(base_url: &str, path: &str, query: &[(&str, &str)]) -> Result<Url, AdapterError> {
    let raw = format!("{}{path}", base_url.trim_end_matches('/'));
    let mut url = Url::parse(&raw).map_err(|err| AdapterError::InvalidUrl {
        url: raw.clone(),
        reason: err.to_string(),
    })?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// Area listing URL. The group is already validated as hex digits and commas, so it is
/// appended as-is and the commas stay literal.
fn hexes_url(base_url: &str, area: &HexGroup) -> Result<Url, AdapterError> {
    let mut url = endpoint(base_url, "/explorer/hexes", &[])?;
    url.set_query(Some(&format!("partial=true&h3_hex_top={area}")));
    Ok(url)
}

/// Explorer API client over a retrying, rate-limited [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpExplorerApi {
    base_url: String,
    http: HttpFetcher,
}

impl HttpExplorerApi {
    pub fn new(config: &ExplorerConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_fetcher(config.base_url.clone(), http))
    }

    pub fn with_fetcher(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AdapterError> {
        let url = endpoint(&self.base_url, path, query)?;
        self.fetch(url).await
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<T, AdapterError> {
        debug!(%url, "explorer request");
        Ok(self.http.fetch_json(url.as_str()).await?)
    }
}

#[async_trait]
impl ExplorerApi for HttpExplorerApi {
    async fn hexes(&self, area: &HexGroup) -> Result<Vec<HexListItem>, AdapterError> {
        let hexes: Option<Vec<HexListItem>> =
            self.fetch(hexes_url(&self.base_url, area)?).await?;
        Ok(hexes.unwrap_or_default())
    }

    async fn hex_detail(&self, cell_id: &str) -> Result<HexDetail, AdapterError> {
        self.get("/explorer/hex", &[("h3_hex", cell_id)]).await
    }

    async fn flowers(&self) -> Result<Vec<FlowerListItem>, AdapterError> {
        let flowers: Option<Vec<FlowerListItem>> = self.get("/explorer/flowers", &[]).await?;
        Ok(flowers.unwrap_or_default())
    }

    async fn device_rewards(&self, device_id: &str) -> Result<Vec<RewardItem>, AdapterError> {
        let rewards: Option<DeviceRewards> = self
            .get("/explorer/device-rewards-all", &[("device", device_id)])
            .await?;
        Ok(rewards.unwrap_or_default().into_items())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ReverseAddress {
    #[serde(default, deserialize_with = "nullable")]
    pub suburb: String,
    #[serde(default, deserialize_with = "nullable")]
    pub city: String,
    #[serde(default, deserialize_with = "nullable")]
    pub state: String,
    #[serde(default, deserialize_with = "nullable")]
    pub town: String,
    #[serde(default, deserialize_with = "nullable")]
    pub county: String,
}

/// Nominatim `/reverse` response, reduced to the fields we persist.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ReversePlace {
    #[serde(default, deserialize_with = "nullable")]
    pub display_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub address: ReverseAddress,
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, lat: f64, lng: f64) -> Result<ReversePlace, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct NominatimConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub rate_limit_interval: Duration,
}

impl Default for NominatimConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_NOMINATIM_BASE_URL.to_string(),
            user_agent: "pollen".to_string(),
            timeout: Duration::from_secs(60),
            rate_limit_interval: Duration::from_secs(1),
        }
    }
}

impl NominatimConfig {
    /// Geocoding failures are not retried.
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.timeout,
            user_agent: Some(self.user_agent.clone()),
            headers: Vec::new(),
            retry: RetryPolicy::none(),
            rate_limit: Some(RateLimit::one_per(self.rate_limit_interval)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    base_url: String,
    http: HttpFetcher,
}

impl NominatimGeocoder {
    pub fn new(config: &NominatimConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_fetcher(config.base_url.clone(), http))
    }

    pub fn with_fetcher(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, lat: f64, lng: f64) -> Result<ReversePlace, AdapterError> {
        let lat = lat.to_string();
        let lng = lng.to_string();
        let url = endpoint(
            &self.base_url,
            "/reverse",
            &[("lat", lat.as_str()), ("lon", lng.as_str()), ("format", "json")],
        )?;
        Ok(self.http.fetch_json(url.as_str()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reward_json(coverage: JsonValue) -> JsonValue {
        json!({
            "rewardID": "r-1",
            "PCN": "1.5",
            "PIC": "2",
            "RSEratio": "0.25",
            "client": "client-a",
            "coverage": coverage,
            "dailyPIC": "3.75",
            "date": "2022-10-01",
            "device": "flower-1",
            "device_type": "flower",
            "reward": "12.5",
            "transaction": "tx-1",
            "tx_status": "confirmed",
            "wallet": "wallet-1"
        })
    }

    #[test]
    fn stringified_empty_coverage_normalizes_to_empty_list() {
        let item: RewardItem =
            serde_json::from_value(reward_json(json!("[]"))).expect("decodes despite bad coverage");
        assert_eq!(item.coverage, Coverage::Malformed(json!("[]")));
        assert!(item.coverage.into_cells().is_empty());
    }

    #[test]
    fn coverage_list_is_kept_and_other_shapes_are_dropped() {
        let listed: RewardItem =
            serde_json::from_value(reward_json(json!(["852a1393fffffff"]))).expect("list");
        assert_eq!(listed.coverage.into_cells(), vec!["852a1393fffffff".to_string()]);

        for odd in [json!(null), json!(7), json!([1, 2]), json!({"a": "b"})] {
            let item: RewardItem = serde_json::from_value(reward_json(odd)).expect("odd coverage");
            assert!(item.coverage.into_cells().is_empty());
        }
    }

    #[test]
    fn reward_numbers_are_read_from_strings() {
        let item: RewardItem = serde_json::from_value(reward_json(json!([]))).expect("reward");
        assert_eq!(item.pcn, 1.5);
        assert_eq!(item.pic, 2.0);
        assert_eq!(item.rse_ratio, 0.25);
        assert_eq!(item.daily_pic, 3.75);
        assert_eq!(item.transaction_status, "confirmed");
    }

    #[test]
    fn flower_listing_tolerates_nulls_and_string_counters() {
        let flower: FlowerListItem = serde_json::from_value(json!({
            "flowerID": "flower-1",
            "bounty_rewards": "4",
            "displayname": null,
            "daily_bees_seen": null,
            "first_seen": null,
            "last_seen": "2022-10-02",
            "daily_attaches": 9,
            "h3_hex": "8a2a1072b59ffff",
            "attach": "1",
            "flower_rewards": "",
            "daily_rewards": "0.5",
            "bees_seen": {"bee-1": "2022-10-01"}
        }))
        .expect("flower");

        assert_eq!(flower.bounty_rewards, 4);
        assert_eq!(flower.display_name, "");
        assert!(flower.daily_bees_seen.is_empty());
        assert_eq!(flower.first_seen, None);
        assert_eq!(flower.last_seen.as_deref(), Some("2022-10-02"));
        assert_eq!(flower.daily_attaches, 9);
        assert_eq!(flower.active, 1);
        assert_eq!(flower.flower_rewards, 0.0);
        assert_eq!(flower.daily_rewards, 0.5);
        assert_eq!(flower.bees_seen, json!({"bee-1": "2022-10-01"}));
    }

    #[test]
    fn non_numeric_counter_is_a_decode_error() {
        let result = serde_json::from_value::<HexListItem>(json!({
            "h3_hex": "852a1393fffffff",
            "covered": "lots"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn device_rewards_flatten_in_date_order() {
        let reward = |id: &str| {
            let mut item = reward_json(json!([]));
            item["rewardID"] = json!(id);
            item
        };
        let rewards: DeviceRewards = serde_json::from_value(json!({
            "2022-10-02": [reward("r-c")],
            "2022-10-01": [reward("r-a"), reward("r-b")],
            "2022-10-03": null,
            "2022-10-04": [reward("r-d")]
        }))
        .expect("rewards");
        let ids = rewards
            .into_items()
            .into_iter()
            .map(|item| item.reward_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["r-a", "r-b", "r-c", "r-d"]);
    }

    #[test]
    fn null_hex_detail_decodes_to_empty_body() {
        let detail: HexDetail = serde_json::from_str(r#"{"hex": null}"#).expect("null hex");
        assert_eq!(detail.hex, HexDetailBody::default());

        let detail: HexDetail = serde_json::from_value(json!({
            "hex": {
                "attach": null,
                "flowers": null,
                "flowers_contained": ["flower-9"],
                "bountyReward": null,
                "lootBoxReward": "",
                "dailyReward": "7",
                "bounty": null,
                "bounty_time": null
            }
        }))
        .expect("detail with nulls");
        assert_eq!(detail.hex.attach, 0);
        assert!(detail.hex.flowers.is_empty());
        assert_eq!(detail.hex.flowers_contained, vec!["flower-9".to_string()]);
        assert_eq!(detail.hex.bounty_reward, 0.0);
        assert_eq!(detail.hex.loot_box_reward, 0);
        assert_eq!(detail.hex.daily_reward, 7);
        assert_eq!(detail.hex.bounty, "");
        assert_eq!(detail.hex.bounty_time, "");
    }

    #[test]
    fn hexes_url_keeps_area_commas_literal() {
        let area = HexGroup::parse("852a1393fffffff,852a104bfffffff").expect("area");
        let url = hexes_url("http://localhost:9000/", &area).expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/explorer/hexes?partial=true&h3_hex_top=852a1393fffffff,852a104bfffffff"
        );
    }

    #[test]
    fn endpoint_encodes_query_and_ignores_trailing_slash() {
        let url = endpoint(
            "http://localhost:9000/",
            "/explorer/hexes",
            &[("partial", "true"), ("h3_hex_top", "852a1393fffffff,852a104bfffffff")],
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/explorer/hexes?partial=true&h3_hex_top=852a1393fffffff%2C852a104bfffffff"
        );

        let bare = endpoint("http://localhost:9000", "/explorer/flowers", &[]).expect("url");
        assert_eq!(bare.as_str(), "http://localhost:9000/explorer/flowers");
    }

    #[test]
    fn explorer_headers_include_key_and_referer() {
        let config = ExplorerConfig {
            api_key: Some("secret".to_string()),
            ..Default::default()
        };
        let http = config.http_client_config();
        assert!(http
            .headers
            .contains(&("x-api-key".to_string(), "secret".to_string())));
        assert!(http.headers.contains(&(
            "referer".to_string(),
            "https://explorer.pollenmobile.io/".to_string()
        )));
        assert_eq!(http.retry, RetryPolicy::default());
        assert_eq!(NominatimConfig::default().http_client_config().retry, RetryPolicy::none());
    }
}
