//! Host-level queries and settings.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use vmplane_hypervisor::{HostCpuInfo, HypervisorCapabilities};

use super::NodeService;
use crate::error::{Error, Result};

/// What the host looks like to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStat {
    pub cpu: HostCpuInfo,
    pub hypervisor: HypervisorCapabilities,
    pub total_memory_mib: u64,
    pub free_memory_mib: u64,
    /// Number of tasks that may execute at once
    pub worker_pool_size: usize,
}

impl NodeService {
    pub async fn host_stat(&self) -> Result<HostStat> {
        Ok(HostStat {
            cpu: self.hypervisor().host_cpu().await?,
            hypervisor: self.hypervisor().capabilities().await?,
            total_memory_mib: self.hypervisor().total_memory_mib().await?,
            free_memory_mib: self.hypervisor().free_memory_mib().await?,
            worker_pool_size: self.tasks().pool_size(),
        })
    }

    pub async fn get_console_data(&self) -> Result<String> {
        Ok(self.hypervisor().console_data().await?)
    }

    pub async fn get_total_memory_mib(&self) -> Result<u64> {
        Ok(self.hypervisor().total_memory_mib().await?)
    }

    #[instrument(skip(self))]
    pub fn set_worker_pool_size(&self, dbg: &str, size: usize) -> Result<()> {
        self.tasks().set_pool_size(size)?;
        info!(size, "Worker pool size changed");
        Ok(())
    }
}

/// AND a CPU feature string with a mask.
///
/// Both are dash-separated groups of 32-bit hex words, as in
/// `"1fcbfbff-f7fa3223"`. Words of `features` beyond the end of the mask
/// are kept as they are. The result uses the width of `features`.
pub fn mask_features(features: &str, mask: &str) -> Result<String> {
    let parse = |s: &str| -> Result<Vec<u32>> {
        if s.is_empty() {
            return Ok(Vec::new());
        }
        s.split('-')
            .map(|word| {
                u32::from_str_radix(word, 16)
                    .map_err(|_| Error::invalid_argument(format!("invalid feature word '{}' in '{}'", word, s)))
            })
            .collect()
    };

    let features = parse(features)?;
    let mask = parse(mask)?;

    let masked: Vec<String> = features
        .iter()
        .enumerate()
        .map(|(i, word)| {
            let word = match mask.get(i) {
                Some(m) => word & m,
                None => *word,
            };
            format!("{:08x}", word)
        })
        .collect();
    Ok(masked.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_features_word_wise() {
        assert_eq!(
            mask_features("1fcbfbff-f7fa3223", "ffffffff-0000ffff").unwrap(),
            "1fcbfbff-00003223"
        );
    }

    #[test]
    fn test_mask_features_keeps_unmasked_words() {
        assert_eq!(
            mask_features("1fcbfbff-f7fa3223-2c100800", "0000000f").unwrap(),
            "0000000f-f7fa3223-2c100800"
        );
        assert_eq!(mask_features("", "ffffffff").unwrap(), "");
    }

    #[test]
    fn test_mask_features_rejects_garbage() {
        assert!(matches!(
            mask_features("1fcbfbff-zz", "ffffffff"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(mask_features("1fcbfbff", "ffffffff-").is_err());
    }
}
