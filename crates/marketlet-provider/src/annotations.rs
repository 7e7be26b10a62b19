//! Pod annotations and the scheduling request parsed from them.
//!
//! Pods opt into marketplace placement details through annotations under
//! the `marketlet.io/` prefix. Anything not annotated falls back to the
//! operator defaults in [`ProviderSettings`] or to the pod's first container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};
use marketlet_core::{InstanceId, OwnerTag, PodKey};
use marketlet_market::LaunchSpec;
use marketlet_scheduler::SchedulerConfig;

use crate::config::{split_list, ProviderSettings};
use crate::error::{ProviderError, Result};

/// Requested GPU model.
pub const GPU_TYPE: &str = "marketlet.io/gpu-type";
/// Comma-separated fallback GPU models, most preferred first.
pub const GPU_FALLBACKS: &str = "marketlet.io/gpu-fallbacks";
/// Price ceiling in USD per hour.
pub const MAX_PRICE: &str = "marketlet.io/max-price";
/// Comma-separated preferred regions.
pub const REGION: &str = "marketlet.io/region";
/// Disk size in gigabytes.
pub const DISK_GB: &str = "marketlet.io/disk-gb";
/// Image override.
pub const IMAGE: &str = "marketlet.io/image";
/// Extra runtime arguments, whitespace separated.
pub const ARGS: &str = "marketlet.io/args";
/// Startup command run on the instance.
pub const COMMAND: &str = "marketlet.io/command";
/// Service whose Endpoints receive the instance address.
pub const SERVICE: &str = "marketlet.io/service";
/// Minimum memory per GPU in gigabytes.
pub const MIN_GPU_MEMORY_GB: &str = "marketlet.io/min-gpu-memory-gb";
/// Minimum host reliability.
pub const MIN_RELIABILITY: &str = "marketlet.io/min-reliability";
/// Written by the provider: the instance serving this pod.
pub const INSTANCE_ID: &str = "marketlet.io/instance-id";
/// Written by the provider: the owner tag claiming this pod.
pub const OWNER_TAG: &str = "marketlet.io/owner-tag";

const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Everything needed to place one pod on the marketplace.
#[derive(Debug, Clone, PartialEq)]
pub struct PodRequest {
    /// Pod identity.
    pub key: PodKey,
    /// Pod UID, empty when the API server did not set one.
    pub uid: String,
    /// Tag labelling the instance launched for this pod.
    pub owner_tag: OwnerTag,
    /// Constraints for the scheduling decision.
    pub scheduler: SchedulerConfig,
    /// Launch request sent to the marketplace.
    pub launch: LaunchSpec,
    /// Name of the container reported in the pod status.
    pub container_name: String,
    /// Target Service, if the pod should be published.
    pub service: Option<String>,
    /// Container port served by the workload.
    pub port: u16,
    /// Name of that port, copied to the Endpoints entry.
    pub port_name: Option<String>,
}

impl PodRequest {
    /// Parse a pod into a request, layering annotations over `settings`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAnnotation` if the pod has no name or image, or an
    /// annotation value cannot be parsed, and `Core` if a provider-written
    /// owner tag or instance id is malformed.
    pub fn from_pod(pod: &Pod, settings: &ProviderSettings) -> Result<Self> {
        let key = pod_key(pod).ok_or_else(|| ProviderError::annotation("metadata.name", "missing"))?;
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let owner_tag = OwnerTag::derive(&key, &uid);
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        if let Some(tag) = annotations.get(OWNER_TAG) {
            OwnerTag::from_hex(tag)?;
        }
        if let Some(id) = annotations.get(INSTANCE_ID) {
            id.parse::<InstanceId>()?;
        }
        let container = pod.spec.as_ref().and_then(|s| s.containers.first());

        let scheduler = scheduler_config(&annotations, container, &settings.defaults)?;

        let image = annotations
            .get(IMAGE)
            .cloned()
            .or_else(|| container.and_then(|c| c.image.clone()))
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| ProviderError::annotation(IMAGE, "pod has no image"))?;

        let (port, port_name) = container
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
            .map_or(Ok((settings.default_port, None)), |p| {
                u16::try_from(p.container_port)
                    .map(|port| (port, p.name.clone()))
                    .map_err(|_| ProviderError::annotation("containerPort", p.container_port.to_string()))
            })?;

        let mut ports: Vec<u16> = container
            .and_then(|c| c.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| u16::try_from(p.container_port).ok())
                    .collect()
            })
            .unwrap_or_default();
        if ports.is_empty() {
            ports.push(port);
        }

        let disk_gb = match annotations.get(DISK_GB) {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|gb| *gb > 0)
                .ok_or_else(|| ProviderError::annotation(DISK_GB, v.as_str()))?,
            None => settings.default_disk_gb,
        };

        let args = annotations
            .get(ARGS)
            .map(|v| v.split_whitespace().map(ToString::to_string).collect())
            .unwrap_or_default();

        let onstart = annotations
            .get(COMMAND)
            .cloned()
            .or_else(|| container.and_then(container_command))
            .filter(|c| !c.trim().is_empty());

        let launch = LaunchSpec {
            image,
            env: container.map(container_env).unwrap_or_default(),
            ports,
            disk_gb,
            args,
            onstart,
            label: owner_tag.label(),
        };

        let service = annotations
            .get(SERVICE)
            .or_else(|| pod.metadata.labels.as_ref().and_then(|l| l.get("app")))
            .filter(|s| !s.trim().is_empty())
            .cloned();

        let container_name = container.map_or_else(|| "main".to_string(), |c| c.name.clone());

        Ok(Self {
            key,
            uid,
            owner_tag,
            scheduler,
            launch,
            container_name,
            service,
            port,
            port_name,
        })
    }
}

fn scheduler_config(
    annotations: &BTreeMap<String, String>,
    container: Option<&Container>,
    defaults: &SchedulerConfig,
) -> Result<SchedulerConfig> {
    let mut config = defaults.clone();

    if let Some(gpu) = annotations.get(GPU_TYPE).filter(|g| !g.trim().is_empty()) {
        config.gpu_type = gpu.trim().to_string();
    }
    if let Some(v) = annotations.get(GPU_FALLBACKS) {
        config.gpu_fallbacks = split_list(v);
    }
    if let Some(v) = annotations.get(MAX_PRICE) {
        config.max_price = parse_number(MAX_PRICE, v, |p| p >= 0.0)?;
    }
    if let Some(v) = annotations.get(REGION) {
        config.preferred_regions = split_list(v);
    }
    if let Some(v) = annotations.get(MIN_GPU_MEMORY_GB) {
        config.min_gpu_memory_gb = parse_number(MIN_GPU_MEMORY_GB, v, |m| m >= 0.0)?;
    }
    if let Some(v) = annotations.get(MIN_RELIABILITY) {
        config.min_reliability = parse_number(MIN_RELIABILITY, v, |r| (0.0..=1.0).contains(&r))?;
    }
    if let Some(gpus) = container.and_then(gpu_limit) {
        config.min_num_gpus = gpus;
    }
    Ok(config)
}

fn parse_number(key: &str, value: &str, valid: impl Fn(f64) -> bool) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite() && valid(*n))
        .ok_or_else(|| ProviderError::annotation(key, format!("invalid value {value:?}")))
}

fn gpu_limit(container: &Container) -> Option<u32> {
    let resources = container.resources.as_ref()?;
    let quantity = resources
        .limits
        .as_ref()
        .and_then(|l| l.get(GPU_RESOURCE))
        .or_else(|| resources.requests.as_ref().and_then(|r| r.get(GPU_RESOURCE)))?;
    quantity.0.trim().parse().ok().filter(|n| *n > 0)
}

fn container_env(container: &Container) -> BTreeMap<String, String> {
    container
        .env
        .iter()
        .flatten()
        .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
        .collect()
}

fn container_command(container: &Container) -> Option<String> {
    let parts: Vec<&str> = container
        .command
        .iter()
        .flatten()
        .chain(container.args.iter().flatten())
        .map(String::as_str)
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Namespace and name of a pod.
#[must_use]
pub fn pod_key(pod: &Pod) -> Option<PodKey> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    Some(PodKey::new(namespace, name))
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Owner tag written when the provider claimed the pod.
#[must_use]
pub fn claimed_owner(pod: &Pod) -> Option<OwnerTag> {
    annotation(pod, OWNER_TAG).and_then(|v| OwnerTag::from_hex(v).ok())
}

/// Instance recorded on the pod, if any.
#[must_use]
pub fn recorded_instance(pod: &Pod) -> Option<InstanceId> {
    annotation(pod, INSTANCE_ID).and_then(|v| v.parse().ok())
}

/// Whether the API server is deleting the pod.
#[must_use]
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}
