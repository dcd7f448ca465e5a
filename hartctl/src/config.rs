//! Engine configuration.
//!
//! Every field has a default, so a configuration file only needs to list what
//! differs for a particular target family.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::interface::MemoryAccessMethod;
use crate::{Error, HartId};

/// All tunables of the run-control engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long to wait for harts to report halted, in milliseconds.
    pub command_timeout_ms: u64,
    /// The period of every polling loop, in milliseconds.
    pub poll_interval_ms: u64,
    /// The order in which the harts of a group are resumed.
    pub resume_order: ResumeOrder,
    /// Whether interrupts are masked while single stepping.
    pub step_interrupts: InterruptMaskPolicy,
    /// Virtual to physical address translation.
    pub translation: TranslationConfig,
    /// Breakpoint placement policy.
    pub breakpoints: BreakpointPolicy,
    /// Memory access strategy.
    pub memory: MemoryConfig,
    /// Algorithm execution.
    pub algorithm: AlgorithmConfig,
    /// Harts which are halted and resumed together.
    pub smp: Option<SmpConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 2000,
            poll_interval_ms: 1,
            resume_order: ResumeOrder::Normal,
            step_interrupts: InterruptMaskPolicy::Off,
            translation: TranslationConfig::default(),
            breakpoints: BreakpointPolicy::default(),
            memory: MemoryConfig::default(),
            algorithm: AlgorithmConfig::default(),
            smp: None,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The bound on halt waits.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The period of polling loops.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The order in which the harts of a group are resumed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOrder {
    /// Ascending hart id.
    #[default]
    Normal,
    /// Descending hart id.
    Reversed,
}

/// When to mask interrupts around run-control operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMaskPolicy {
    /// Leave the interrupt enables alone.
    #[default]
    Off,
    /// Mask interrupts for the duration of a single step.
    StepOnly,
}

/// Address translation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Translate virtual addresses when the hart has paging active.
    pub enabled: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// How breakpoints are mapped onto hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointPolicy {
    /// Always place software breakpoints, even when hardware ones are requested.
    pub force_software: bool,
    /// Place software breakpoints instead of hardware ones once this many
    /// hardware breakpoints are active on the hart.
    pub hardware_downgrade_threshold: Option<usize>,
}

/// Memory access settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Access methods, tried in this order.
    pub access_methods: Vec<MemoryAccessMethod>,
    /// Writes inside this window are handed to the flash programmer.
    pub flash: Option<FlashWindow>,
    /// Read back every write and fail if the data differs.
    pub verify_writes: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            access_methods: vec![
                MemoryAccessMethod::ProgramBuffer,
                MemoryAccessMethod::SystemBus,
                MemoryAccessMethod::AbstractCommand,
            ],
            flash: None,
            verify_writes: false,
        }
    }
}

/// The address window backed by flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashWindow {
    /// Writes below this address go to flash.
    pub end: u64,
    /// Flash is also mapped at this address. Addresses at or above it are
    /// rebased to flash offsets.
    #[serde(default)]
    pub alias_base: Option<u64>,
}

impl FlashWindow {
    /// The flash offset of `address`, if a write there goes to flash.
    pub fn offset_of(&self, address: u64) -> Option<u64> {
        if address >= self.end {
            return None;
        }

        match self.alias_base {
            Some(base) if address >= base => Some(address - base),
            _ => Some(address),
        }
    }
}

/// Algorithm execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// Mask interrupts while the algorithm runs.
    pub mask_interrupts: bool,
    /// Restore saved registers even when the algorithm timed out.
    pub restore_after_timeout: bool,
    /// Scratch RAM for built-in routines such as the checksum.
    pub working_area: Option<WorkingArea>,
    /// Time the checksum routine gets per started MiB, in milliseconds.
    pub checksum_timeout_per_mib_ms: u64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            mask_interrupts: true,
            restore_after_timeout: false,
            working_area: None,
            checksum_timeout_per_mib_ms: 20_000,
        }
    }
}

impl AlgorithmConfig {
    /// The bound on a checksum routine run over `count` bytes.
    pub fn checksum_timeout(&self, count: u64) -> Duration {
        let started = count.div_ceil(1024 * 1024).max(1);
        Duration::from_millis(self.checksum_timeout_per_mib_ms.saturating_mul(started))
    }
}

/// Target RAM the engine may overwrite.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingArea {
    /// Start address.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

impl WorkingArea {
    /// Whether `[address, address + size)` intersects the working area.
    pub fn overlaps(&self, address: u64, size: u64) -> bool {
        address < self.address.saturating_add(self.size)
            && self.address < address.saturating_add(size)
    }
}

/// A group of harts run-controlled together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmpConfig {
    /// The member harts.
    pub harts: Vec<HartId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();

        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parse_family_config() {
        let yaml = r#"
resume_order: reversed
step_interrupts: step_only
breakpoints:
  force_software: true
  hardware_downgrade_threshold: 3
memory:
  access_methods: [system_bus, abstract_command]
  flash:
    end: 0x20000000
    alias_base: 0x08000000
algorithm:
  working_area:
    address: 0x20000000
    size: 0x1000
smp:
  harts: [0, 1, 2]
"#;

        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.resume_order, ResumeOrder::Reversed);
        assert_eq!(config.step_interrupts, InterruptMaskPolicy::StepOnly);
        assert_eq!(
            config.breakpoints,
            BreakpointPolicy {
                force_software: true,
                hardware_downgrade_threshold: Some(3),
            }
        );
        assert_eq!(
            config.memory.access_methods,
            vec![
                MemoryAccessMethod::SystemBus,
                MemoryAccessMethod::AbstractCommand
            ]
        );
        assert_eq!(
            config.algorithm.working_area,
            Some(WorkingArea {
                address: 0x2000_0000,
                size: 0x1000
            })
        );
        assert_eq!(config.smp.as_ref().unwrap().harts, vec![0, 1, 2]);
        assert!(config.translation.enabled);
        assert_eq!(config.command_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let result = EngineConfig::from_yaml("resume_order: sideways");

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn flash_window_rebases_alias() {
        let window = FlashWindow {
            end: 0x2000_0000,
            alias_base: Some(0x0800_0000),
        };

        assert_eq!(window.offset_of(0x0800_0100), Some(0x100));
        assert_eq!(window.offset_of(0x100), Some(0x100));
        assert_eq!(window.offset_of(0x2000_0000), None);
    }

    #[test]
    fn working_area_overlap() {
        let area = WorkingArea {
            address: 0x1000,
            size: 0x100,
        };

        assert!(area.overlaps(0x10f0, 0x20));
        assert!(area.overlaps(0x0f00, 0x101));
        assert!(!area.overlaps(0x0f00, 0x100));
        assert!(!area.overlaps(0x1100, 0x10));
    }

    #[test]
    fn checksum_timeout_grows_per_mib() {
        let config = AlgorithmConfig::default();

        assert_eq!(config.checksum_timeout(0), Duration::from_secs(20));
        assert_eq!(config.checksum_timeout(1024 * 1024 - 1), Duration::from_secs(20));
        assert_eq!(config.checksum_timeout(3 * 1024 * 1024), Duration::from_secs(60));
        assert_eq!(config.checksum_timeout(3 * 1024 * 1024 + 1), Duration::from_secs(80));
    }
}
