//! Marketplace data types and their wire representations.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use marketlet_core::{InstanceId, OfferId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A rentable machine as advertised by the marketplace.
///
/// Offers are snapshots: they are produced by a search and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Marketplace offer id.
    pub id: OfferId,
    /// GPU model name, e.g. `RTX 4090`.
    pub gpu_name: String,
    /// Number of GPUs in the offer.
    pub num_gpus: u32,
    /// Memory per GPU in gigabytes.
    pub gpu_memory_gb: f64,
    /// Total price per hour in USD.
    pub price_per_hour: f64,
    /// Host reliability score between 0 and 1.
    pub reliability: f64,
    /// Geolocation code of the host, e.g. `US-CA` or `DE`.
    pub geolocation: String,
    /// Whether the host is verified by the marketplace.
    pub verified: bool,
    /// Downstream bandwidth in Mbps.
    pub inet_down_mbps: f64,
    /// Upstream bandwidth in Mbps.
    pub inet_up_mbps: f64,
    /// How long the host has been listed, in hours.
    pub host_uptime_hours: f64,
}

/// Lifecycle status of a launched instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, image loading or container starting.
    #[default]
    Provisioning,
    /// Container is running.
    Running,
    /// The host reported a failure.
    Error,
    /// Destroyed or stopped for good.
    Terminated,
}

impl InstanceStatus {
    /// Map the marketplace's `actual_status` / `intended_status` pair.
    #[must_use]
    pub fn from_wire(actual: Option<&str>, intended: Option<&str>) -> Self {
        match (actual, intended) {
            (Some("running"), _) => Self::Running,
            (Some("destroyed" | "deleted"), _) | (Some("exited" | "stopped"), Some("stopped")) => {
                Self::Terminated
            }
            (Some("exited" | "offline" | "error" | "unknown"), _) => Self::Error,
            _ => Self::Provisioning,
        }
    }

    /// Check if the instance will never run again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }
}

/// A launched, billable marketplace instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Marketplace instance id.
    pub id: InstanceId,
    /// Offer the instance was launched from, when reported.
    pub offer_id: Option<OfferId>,
    /// Label supplied at launch.
    pub label: Option<String>,
    /// Public IP address of the host, once assigned.
    pub public_address: Option<String>,
    /// Container port to public host port.
    pub ports: BTreeMap<u16, u16>,
    /// Current status.
    pub status: InstanceStatus,
    /// Free-form status message from the host.
    pub status_message: Option<String>,
    /// When the instance was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Publicly reachable `(address, port)` for a container port, if known.
    #[must_use]
    pub fn endpoint_for(&self, container_port: u16) -> Option<(String, u16)> {
        let address = self.public_address.as_ref()?;
        let port = self.ports.get(&container_port)?;
        Some((address.clone(), *port))
    }
}

/// Hard filters for an offer search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Acceptable GPU models; empty means any.
    pub gpu_names: Vec<String>,
    /// Minimum number of GPUs.
    pub min_num_gpus: u32,
    /// Minimum memory per GPU in gigabytes.
    pub min_gpu_memory_gb: Option<f64>,
    /// Maximum total price per hour.
    pub max_price_per_hour: Option<f64>,
    /// Minimum reliability score.
    pub min_reliability: Option<f64>,
    /// Minimum downstream bandwidth in Mbps.
    pub min_inet_down_mbps: Option<f64>,
    /// Minimum upstream bandwidth in Mbps.
    pub min_inet_up_mbps: Option<f64>,
    /// Restrict to these country codes; empty means anywhere.
    pub regions: Vec<String>,
    /// Only verified hosts.
    pub verified_only: bool,
    /// Only offers that can be rented right now.
    pub rentable_only: bool,
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self {
            gpu_names: Vec::new(),
            min_num_gpus: 1,
            min_gpu_memory_gb: None,
            max_price_per_hour: None,
            min_reliability: None,
            min_inet_down_mbps: None,
            min_inet_up_mbps: None,
            regions: Vec::new(),
            verified_only: false,
            rentable_only: true,
        }
    }
}

impl SearchCriteria {
    /// Build the marketplace query object.
    ///
    /// Every constraint becomes `{"field": {"op": value}}`; GPU memory is sent
    /// in megabytes as the marketplace expects.
    #[must_use]
    pub fn to_query(&self) -> Value {
        let mut q = Map::new();
        if !self.gpu_names.is_empty() {
            q.insert("gpu_name".into(), json!({ "in": self.gpu_names }));
        }
        q.insert("num_gpus".into(), json!({ "gte": self.min_num_gpus }));
        if let Some(gb) = self.min_gpu_memory_gb {
            q.insert("gpu_ram".into(), json!({ "gte": gb * 1024.0 }));
        }
        if let Some(price) = self.max_price_per_hour {
            q.insert("dph_total".into(), json!({ "lte": price }));
        }
        if let Some(reliability) = self.min_reliability {
            q.insert("reliability2".into(), json!({ "gte": reliability }));
        }
        if let Some(down) = self.min_inet_down_mbps {
            q.insert("inet_down".into(), json!({ "gte": down }));
        }
        if let Some(up) = self.min_inet_up_mbps {
            q.insert("inet_up".into(), json!({ "gte": up }));
        }
        if !self.regions.is_empty() {
            q.insert("geolocation".into(), json!({ "in": self.regions }));
        }
        if self.verified_only {
            q.insert("verified".into(), json!({ "eq": true }));
        }
        if self.rentable_only {
            q.insert("rentable".into(), json!({ "eq": true }));
        }
        q.insert("type".into(), json!("on-demand"));
        Value::Object(q)
    }
}

/// What to run on a launched instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Container image.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container ports to expose publicly.
    pub ports: Vec<u16>,
    /// Disk size in gigabytes.
    pub disk_gb: u32,
    /// Extra arguments passed to the container runtime.
    pub args: Vec<String>,
    /// Startup command run when the container starts.
    pub onstart: Option<String>,
    /// Label identifying the owning pod.
    pub label: String,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct RawSearchResponse {
    #[serde(default)]
    pub offers: Vec<RawOffer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawOffer {
    id: u64,
    gpu_name: String,
    #[serde(default = "default_num_gpus")]
    num_gpus: u32,
    /// Megabytes.
    #[serde(default)]
    gpu_ram: f64,
    dph_total: f64,
    #[serde(default)]
    reliability2: f64,
    #[serde(default)]
    geolocation: Option<String>,
    #[serde(default)]
    verified: bool,
    #[serde(default)]
    inet_down: f64,
    #[serde(default)]
    inet_up: f64,
    /// Seconds.
    #[serde(default)]
    host_run_time: f64,
}

const fn default_num_gpus() -> u32 {
    1
}

impl From<RawOffer> for Offer {
    fn from(raw: RawOffer) -> Self {
        Self {
            id: OfferId::new(raw.id),
            gpu_name: raw.gpu_name,
            num_gpus: raw.num_gpus,
            gpu_memory_gb: raw.gpu_ram / 1024.0,
            price_per_hour: raw.dph_total,
            reliability: raw.reliability2.clamp(0.0, 1.0),
            geolocation: raw.geolocation.unwrap_or_default(),
            verified: raw.verified,
            inet_down_mbps: raw.inet_down,
            inet_up_mbps: raw.inet_up,
            host_uptime_hours: raw.host_run_time / 3600.0,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RawCreateRequest<'a> {
    pub client_id: &'static str,
    pub image: &'a str,
    pub disk: u32,
    pub env: &'a BTreeMap<String, String>,
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub args: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onstart: Option<&'a str>,
    pub label: &'a str,
    pub runtype: &'static str,
}

impl<'a> RawCreateRequest<'a> {
    pub fn new(spec: &'a LaunchSpec) -> Self {
        Self {
            client_id: "me",
            image: &spec.image,
            disk: spec.disk_gb,
            env: &spec.env,
            ports: spec.ports.iter().map(|p| format!("{p}/tcp")).collect(),
            args: &spec.args,
            onstart: spec.onstart.as_deref(),
            label: &spec.label,
            runtype: if spec.args.is_empty() { "ssh_direct" } else { "args" },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawCreateResponse {
    #[serde(default)]
    pub success: bool,
    pub new_contract: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl RawErrorResponse {
    /// True when the body says the offer was taken.
    pub fn is_offer_gone(&self) -> bool {
        self.error.as_deref() == Some("no_such_ask")
            || self
                .msg
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains("no longer available"))
    }

    pub fn message(self) -> String {
        self.msg
            .or(self.error)
            .unwrap_or_else(|| "no message".to_string())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInstanceResponse {
    pub instances: Option<RawInstance>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInstanceList {
    #[serde(default)]
    pub instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawPortBinding {
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawInstance {
    id: u64,
    #[serde(default)]
    ask_id: Option<u64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    public_ipaddr: Option<String>,
    /// Keyed by `"<port>/tcp"`.
    #[serde(default)]
    ports: Option<HashMap<String, Vec<RawPortBinding>>>,
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(default)]
    intended_status: Option<String>,
    #[serde(default)]
    status_msg: Option<String>,
    /// Seconds since the epoch.
    #[serde(default)]
    start_date: Option<f64>,
}

impl From<RawInstance> for Instance {
    fn from(raw: RawInstance) -> Self {
        let ports = raw
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let container = key.split('/').next()?.parse::<u16>().ok()?;
                let host = bindings.first()?.host_port.parse::<u16>().ok()?;
                Some((container, host))
            })
            .collect();

        #[allow(clippy::cast_possible_truncation)]
        let created_at = raw
            .start_date
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());

        Self {
            id: InstanceId::new(raw.id),
            offer_id: raw.ask_id.map(OfferId::new),
            label: raw.label,
            public_address: raw
                .public_ipaddr
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty()),
            ports,
            status: InstanceStatus::from_wire(
                raw.actual_status.as_deref(),
                raw.intended_status.as_deref(),
            ),
            status_message: raw.status_msg,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_contains_only_set_filters() {
        let criteria = SearchCriteria {
            gpu_names: vec!["RTX 4090".to_string(), "RTX 3090".to_string()],
            max_price_per_hour: Some(0.4),
            min_gpu_memory_gb: Some(24.0),
            ..SearchCriteria::default()
        };

        let q = criteria.to_query();
        assert_eq!(q["gpu_name"]["in"][1], "RTX 3090");
        assert_eq!(q["dph_total"]["lte"], 0.4);
        assert_eq!(q["gpu_ram"]["gte"], 24.0 * 1024.0);
        assert_eq!(q["rentable"]["eq"], true);
        assert!(q.get("verified").is_none());
        assert!(q.get("geolocation").is_none());
        assert!(q.get("reliability2").is_none());
    }

    #[test]
    fn raw_offer_converts_units() {
        let raw: RawOffer = serde_json::from_value(json!({
            "id": 42,
            "gpu_name": "RTX 4090",
            "gpu_ram": 24576.0,
            "dph_total": 0.35,
            "reliability2": 0.991,
            "geolocation": "US-CA",
            "verified": true,
            "inet_down": 900.0,
            "inet_up": 500.0,
            "host_run_time": 7200.0
        }))
        .unwrap();

        let offer = Offer::from(raw);
        assert_eq!(offer.id, OfferId::new(42));
        assert_eq!(offer.num_gpus, 1);
        assert!((offer.gpu_memory_gb - 24.0).abs() < f64::EPSILON);
        assert!((offer.host_uptime_hours - 2.0).abs() < f64::EPSILON);
        assert!(offer.verified);
    }

    #[test]
    fn raw_instance_maps_ports_and_status() {
        let raw: RawInstance = serde_json::from_value(json!({
            "id": 9001,
            "ask_id": 42,
            "label": "marketlet-abc",
            "public_ipaddr": "203.0.113.7\n",
            "ports": { "8080/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "41234" }] },
            "actual_status": "running",
            "intended_status": "running",
            "start_date": 1_700_000_000.0
        }))
        .unwrap();

        let instance = Instance::from(raw);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(
            instance.endpoint_for(8080),
            Some(("203.0.113.7".to_string(), 41234))
        );
        assert_eq!(instance.endpoint_for(9000), None);
        assert_eq!(instance.offer_id, Some(OfferId::new(42)));
        assert!(instance.created_at.is_some());
    }

    #[test]
    fn instance_status_mapping() {
        use InstanceStatus::*;
        assert_eq!(InstanceStatus::from_wire(None, None), Provisioning);
        assert_eq!(InstanceStatus::from_wire(Some("loading"), Some("running")), Provisioning);
        assert_eq!(InstanceStatus::from_wire(Some("running"), None), Running);
        assert_eq!(InstanceStatus::from_wire(Some("exited"), Some("running")), Error);
        assert_eq!(InstanceStatus::from_wire(Some("exited"), Some("stopped")), Terminated);
        assert!(Error.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn create_request_shape() {
        let spec = LaunchSpec {
            image: "ghcr.io/acme/stt:1.2".to_string(),
            env: BTreeMap::from([("MODEL".to_string(), "large-v3".to_string())]),
            ports: vec![8080],
            disk_gb: 40,
            args: Vec::new(),
            onstart: Some("python serve.py".to_string()),
            label: "marketlet-00".to_string(),
        };

        let body = serde_json::to_value(RawCreateRequest::new(&spec)).unwrap();
        assert_eq!(body["image"], "ghcr.io/acme/stt:1.2");
        assert_eq!(body["disk"], 40);
        assert_eq!(body["ports"][0], "8080/tcp");
        assert_eq!(body["env"]["MODEL"], "large-v3");
        assert_eq!(body["onstart"], "python serve.py");
        assert!(body.get("args").is_none());
    }
}
