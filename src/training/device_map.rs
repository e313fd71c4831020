//! Device-map selection from process placement hints
//!
//! A launcher that starts one process per GPU sets `LOCAL_WORLD_SIZE` (number
//! of processes on this node) and `LOCAL_RANK` (this process's index). Those
//! two variables decide whether each process gets a full copy of the model on
//! its own GPU, or whether one process spreads the model over every device.

use anyhow::{Context, Result};
use candle_core::Device;

use super::device::{select_cuda_device, select_device, DevicePreference};

/// Environment variable holding the number of local processes
pub const LOCAL_WORLD_SIZE: &str = "LOCAL_WORLD_SIZE";

/// Environment variable holding this process's local index
pub const LOCAL_RANK: &str = "LOCAL_RANK";

/// Where model weights are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMap {
    /// Spread over the best available devices
    Auto,
    /// Whole model on the GPU with this ordinal
    Rank(usize),
    /// No placement requested; weights stay on the CPU
    Unset,
}

impl std::fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Rank(rank) => write!(f, "{{\"\": {}}}", rank),
            Self::Unset => write!(f, "none"),
        }
    }
}

impl DeviceMap {
    /// Resolve to a concrete device
    pub fn resolve(&self) -> Result<Device> {
        match self {
            Self::Auto => select_device(DevicePreference::Auto),
            Self::Rank(rank) => select_cuda_device(*rank),
            Self::Unset => Ok(Device::Cpu),
        }
    }
}

/// Snapshot of the placement hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementEnv {
    pub local_world_size: usize,
    pub local_rank: usize,
}

impl Default for PlacementEnv {
    fn default() -> Self {
        Self {
            local_world_size: 1,
            local_rank: 0,
        }
    }
}

impl PlacementEnv {
    pub fn new(local_world_size: usize, local_rank: usize) -> Self {
        Self {
            local_world_size,
            local_rank,
        }
    }

    /// Read `LOCAL_WORLD_SIZE` (default 1) and `LOCAL_RANK` (default 0)
    pub fn from_process_env() -> Result<Self> {
        Ok(Self {
            local_world_size: read_var(LOCAL_WORLD_SIZE, 1)?,
            local_rank: read_var(LOCAL_RANK, 0)?,
        })
    }

    /// True when several processes share this node
    pub fn is_distributed(&self) -> bool {
        self.local_world_size > 1
    }
}

fn read_var(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got {:?}", name, value)),
        Err(_) => Ok(default),
    }
}

/// Choose the device map for loading a model
///
/// # Arguments
/// * `force_auto_device_map` - Spread the model over GPUs and CPU to fit it in memory
/// * `use_fused_attention` - Fused attention kernels need the auto map
/// * `env` - Placement hints of the current process
pub fn get_device_map(
    force_auto_device_map: bool,
    use_fused_attention: bool,
    env: &PlacementEnv,
) -> Result<DeviceMap> {
    let device_map = if force_auto_device_map {
        if env.is_distributed() {
            anyhow::bail!(
                "Found a data-parallel environment ({}={}) and force_auto_device_map is set to true, \
                 this configuration is not supported. To run one model copy per GPU, set \
                 force_auto_device_map to false. To split the model across GPUs, launch a single \
                 process. If you are not in a data-parallel environment but see this error, unset \
                 {} or set it to 1",
                LOCAL_WORLD_SIZE,
                env.local_world_size,
                LOCAL_WORLD_SIZE
            );
        }
        tracing::warn!(
            "Using auto device map, we will split the model across GPUs and CPU to fit the model in memory."
        );
        DeviceMap::Auto
    } else if env.is_distributed() {
        tracing::warn!(
            "Found a data-parallel environment and force_auto_device_map is false, we will load a copy of the model on each GPU."
        );
        DeviceMap::Rank(env.local_rank)
    } else if use_fused_attention {
        tracing::warn!("Setting device map to 'auto' to use fused attention.");
        DeviceMap::Auto
    } else {
        DeviceMap::Unset
    };

    tracing::info!("We will load the model using the following device map: {}", device_map);
    Ok(device_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_defaults_to_unset() {
        let env = PlacementEnv::default();
        assert_eq!(get_device_map(false, false, &env).unwrap(), DeviceMap::Unset);
    }

    #[test]
    fn test_force_auto() {
        let env = PlacementEnv::default();
        assert_eq!(get_device_map(true, false, &env).unwrap(), DeviceMap::Auto);
        assert_eq!(get_device_map(true, true, &env).unwrap(), DeviceMap::Auto);
    }

    #[test]
    fn test_force_auto_with_multiple_processes_errors() {
        let env = PlacementEnv::new(4, 1);
        let result = get_device_map(true, false, &env);
        assert!(result.is_err_and(|e| e.to_string().contains("force_auto_device_map")));
    }

    #[test]
    fn test_multiple_processes_load_per_rank() {
        let env = PlacementEnv::new(4, 3);
        assert_eq!(get_device_map(false, false, &env).unwrap(), DeviceMap::Rank(3));
        // Per-rank placement wins over fused attention
        assert_eq!(get_device_map(false, true, &env).unwrap(), DeviceMap::Rank(3));
    }

    #[test]
    fn test_fused_attention_uses_auto() {
        let env = PlacementEnv::default();
        assert_eq!(get_device_map(false, true, &env).unwrap(), DeviceMap::Auto);
    }

    // The only test that touches these variables
    #[test]
    fn test_placement_from_process_env() {
        std::env::remove_var(LOCAL_WORLD_SIZE);
        std::env::remove_var(LOCAL_RANK);
        assert_eq!(PlacementEnv::from_process_env().unwrap(), PlacementEnv::new(1, 0));

        std::env::set_var(LOCAL_WORLD_SIZE, "4");
        std::env::set_var(LOCAL_RANK, " 2 ");
        let env = PlacementEnv::from_process_env().unwrap();
        assert_eq!(env, PlacementEnv::new(4, 2));
        assert!(env.is_distributed());

        std::env::set_var(LOCAL_WORLD_SIZE, "two");
        let err = PlacementEnv::from_process_env().unwrap_err();
        assert!(err.to_string().contains("LOCAL_WORLD_SIZE must be a non-negative integer"));

        std::env::set_var(LOCAL_WORLD_SIZE, "1");
        std::env::set_var(LOCAL_RANK, "-1");
        assert!(PlacementEnv::from_process_env().is_err());

        std::env::remove_var(LOCAL_WORLD_SIZE);
        std::env::remove_var(LOCAL_RANK);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceMap::Auto.to_string(), "auto");
        assert_eq!(DeviceMap::Rank(2).to_string(), "{\"\": 2}");
        assert_eq!(DeviceMap::Unset.to_string(), "none");
    }

    #[test]
    fn test_unset_resolves_to_cpu() {
        let device = DeviceMap::Unset.resolve().unwrap();
        assert!(matches!(device, Device::Cpu));
    }
}
