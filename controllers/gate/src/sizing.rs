//! # VM sizing
//!
//! Turns a pod's container requests into the size of the VM that will host
//! it, and resolves the cluster config into the defaults every VM starts
//! from.
//!
//! - CPU: requests plus overhead, rounded up to whole cores, at least 1.
//! - Memory: requests plus overhead, rounded down to MiB, at least 512Mi.
//! - Both are floored by the configured base size.

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crds::MaroonedPodsConfig;
use crds::labels::DEFAULT_TAINT_KEY;

pub const DEFAULT_BASE_CPU: u32 = 2;
pub const DEFAULT_BASE_MEMORY_MI: u64 = 3072;
pub const DEFAULT_OVERHEAD_CPU_MILLIS: u64 = 500;
pub const DEFAULT_OVERHEAD_MEMORY_MI: u64 = 512;
pub const DEFAULT_NODE_IMAGE: &str = "quay.io/capk/ubuntu-2004-container-disk:v1.26.0";

const MIN_CPU_CORES: u32 = 1;
const MIN_MEMORY_MI: u64 = 512;
const MI: u64 = 1024 * 1024;

/// Resolved VM settings with zero or empty config fields replaced by defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefaults {
    pub base_cpu: u32,
    pub base_memory_mi: u64,
    pub overhead_cpu_millis: u64,
    pub overhead_memory_mi: u64,
    pub node_image: String,
    pub taint_key: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            base_cpu: DEFAULT_BASE_CPU,
            base_memory_mi: DEFAULT_BASE_MEMORY_MI,
            overhead_cpu_millis: DEFAULT_OVERHEAD_CPU_MILLIS,
            overhead_memory_mi: DEFAULT_OVERHEAD_MEMORY_MI,
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            taint_key: DEFAULT_TAINT_KEY.to_string(),
        }
    }
}

impl VmDefaults {
    #[must_use]
    pub fn from_config(config: Option<&MaroonedPodsConfig>) -> Self {
        let mut defaults = Self::default();
        let Some(spec) = config.map(|config| &config.spec) else {
            return defaults;
        };

        if let Some(base) = spec.base_vm_resources {
            if base.cpu > 0 {
                defaults.base_cpu = base.cpu;
            }
            if base.memory_mi > 0 {
                defaults.base_memory_mi = base.memory_mi;
            }
        }
        if let Some(overhead) = spec.overhead_resources {
            if overhead.cpu_millis > 0 {
                defaults.overhead_cpu_millis = overhead.cpu_millis;
            }
            if overhead.memory_mi > 0 {
                defaults.overhead_memory_mi = overhead.memory_mi;
            }
        }
        if let Some(image) = spec.node_image.as_deref().filter(|image| !image.is_empty()) {
            defaults.node_image = image.to_string();
        }
        if let Some(key) = spec.node_taint_key.as_deref().filter(|key| !key.is_empty()) {
            defaults.taint_key = key.to_string();
        }
        defaults
    }
}

/// Whole cores and MiB of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSize {
    pub cpu_cores: u32,
    pub memory_mi: u64,
}

impl VmSize {
    /// Size of pool VMIs, which are created before any pod is known.
    #[must_use]
    pub fn base(defaults: &VmDefaults) -> Self {
        Self {
            cpu_cores: defaults.base_cpu,
            memory_mi: defaults.base_memory_mi,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid quantity {quantity:?} for {resource}")]
pub struct QuantityError {
    pub resource: &'static str,
    pub quantity: String,
}

/// Size a dedicated VM for `pod`.
///
/// Only container requests count; limits and init containers are ignored.
pub fn compute_vm_size(pod: &Pod, defaults: &VmDefaults) -> Result<VmSize, QuantityError> {
    let mut cpu_millis: u64 = 0;
    let mut memory_bytes: u64 = 0;

    let containers = pod.spec.as_ref().map(|spec| spec.containers.as_slice()).unwrap_or_default();
    for container in containers {
        let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else {
            continue;
        };
        if let Some(cpu) = requests.get("cpu") {
            cpu_millis = cpu_millis.saturating_add(parse_cpu_millis(&cpu.0)?);
        }
        if let Some(memory) = requests.get("memory") {
            memory_bytes = memory_bytes.saturating_add(parse_memory_bytes(&memory.0)?);
        }
    }

    let cpu_millis = cpu_millis.saturating_add(defaults.overhead_cpu_millis);
    let memory_bytes = memory_bytes.saturating_add(defaults.overhead_memory_mi.saturating_mul(MI));

    let cores = u32::try_from(cpu_millis.div_ceil(1000)).unwrap_or(u32::MAX).max(MIN_CPU_CORES);
    let memory_mi = (memory_bytes / MI).max(MIN_MEMORY_MI);

    Ok(VmSize {
        cpu_cores: cores.max(defaults.base_cpu),
        memory_mi: memory_mi.max(defaults.base_memory_mi),
    })
}

/// CPU quantity in millicores, rounded up.
pub fn parse_cpu_millis(quantity: &str) -> Result<u64, QuantityError> {
    Quantity::parse(quantity)
        .map(|q| q.ceil_scaled(3))
        .ok_or_else(|| QuantityError {
            resource: "cpu",
            quantity: quantity.to_string(),
        })
}

/// Memory quantity in bytes, rounded up.
pub fn parse_memory_bytes(quantity: &str) -> Result<u64, QuantityError> {
    Quantity::parse(quantity)
        .map(|q| q.ceil_scaled(0))
        .ok_or_else(|| QuantityError {
            resource: "memory",
            quantity: quantity.to_string(),
        })
}

/// Exact value of a Kubernetes quantity: `mantissa * binary * 10^exp10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quantity {
    mantissa: u128,
    binary: u128,
    exp10: i32,
}

impl Quantity {
    /// Parse `250m`, `1.5`, `4Gi`, `128974848`, `129e6` or `12E`. Negative
    /// values are rejected.
    fn parse(quantity: &str) -> Option<Self> {
        let quantity = quantity.trim().strip_prefix('+').unwrap_or(quantity.trim());
        let split = quantity
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(quantity.len());
        let (number, suffix) = quantity.split_at(split);

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let mut mantissa: u128 = 0;
        for digit in whole.chars().chain(fraction.chars()) {
            let digit = u128::from(digit.to_digit(10)?);
            mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
        }
        let scale = i32::try_from(fraction.len()).ok()?;

        let (binary, exp10): (u128, i32) = match suffix {
            "" => (1, 0),
            "n" => (1, -9),
            "u" => (1, -6),
            "m" => (1, -3),
            "k" => (1, 3),
            "M" => (1, 6),
            "G" => (1, 9),
            "T" => (1, 12),
            "P" => (1, 15),
            "E" => (1, 18),
            "Ki" => (1 << 10, 0),
            "Mi" => (1 << 20, 0),
            "Gi" => (1 << 30, 0),
            "Ti" => (1 << 40, 0),
            "Pi" => (1 << 50, 0),
            "Ei" => (1 << 60, 0),
            exponent if exponent.starts_with(['e', 'E']) => (1, exponent[1..].parse().ok()?),
            _ => return None,
        };

        Some(Self {
            mantissa,
            binary,
            exp10: exp10.checked_sub(scale)?,
        })
    }

    /// `ceil(value * 10^target_exp10)`, saturating at `u64::MAX`.
    fn ceil_scaled(self, target_exp10: i32) -> u64 {
        let Some(value) = self.mantissa.checked_mul(self.binary) else {
            return u64::MAX;
        };
        let exp10 = self.exp10.saturating_add(target_exp10);
        let scaled = if exp10 >= 0 {
            10u128
                .checked_pow(exp10.unsigned_abs())
                .and_then(|factor| value.checked_mul(factor))
        } else {
            // Anything below 10^-38 of a unit still rounds up to one.
            Some(10u128.checked_pow(exp10.unsigned_abs()).map_or(u128::from(value > 0), |divisor| value.div_ceil(divisor)))
        };
        scaled.map_or(u64::MAX, |scaled| u64::try_from(scaled).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_cpu_millis("250m"), Ok(250));
        assert_eq!(parse_cpu_millis("2"), Ok(2000));
        assert_eq!(parse_cpu_millis("1.5"), Ok(1500));
        assert_eq!(parse_cpu_millis("100u"), Ok(1));
        assert_eq!(parse_cpu_millis("0.1"), Ok(100));
        assert_eq!(parse_cpu_millis("300m"), Ok(300));
        assert!(parse_cpu_millis("lots").is_err());
        assert!(parse_cpu_millis("-1").is_err());
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_memory_bytes("4Gi"), Ok(4 * 1024 * MI));
        assert_eq!(parse_memory_bytes("512Mi"), Ok(512 * MI));
        assert_eq!(parse_memory_bytes("1k"), Ok(1000));
        assert_eq!(parse_memory_bytes("129e6"), Ok(129_000_000));
        assert_eq!(parse_memory_bytes("128974848"), Ok(128_974_848));
        assert!(parse_memory_bytes("4Gb").is_err());
        assert_eq!(parse_memory_bytes("1.5Gi"), Ok(1536 * MI));
        assert!(parse_memory_bytes("").is_err());
        assert!(parse_memory_bytes(".").is_err());
    }
}
