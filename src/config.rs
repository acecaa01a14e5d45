//! PoW engine configuration.
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! - `HYBRID_POW_FULL_DATASET`: build full Ethash datasets (`true`/`1`)
//! - `HYBRID_POW_RETAINED_EPOCHS`: epoch contexts kept in memory
//! - `HYBRID_POW_MEMORY_LIMIT_MB`: cap per epoch context, `0` = none
//! - `HYBRID_POW_RX_BACKEND`: `soft` or `native`
//! - `HYBRID_POW_MAX_IDLE_VMS`: idle light VMs parked per generation

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PowError, PowResult};
use crate::ethash::EpochParams;
use crate::randomx::SoftRxParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthashConfig {
    /// Precompute the whole dataset per epoch (mining / heavy verification).
    #[serde(default)]
    pub full_dataset: bool,

    /// Keep the first 16 KiB of the dataset as 32-bit words per context.
    #[serde(default)]
    pub l1_cache: bool,

    #[serde(default = "default_retained_epochs")]
    pub retained_epochs: usize,

    /// Upper bound on one epoch context, in MiB.
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    #[serde(default)]
    pub sizing: EpochParams,
}

fn default_retained_epochs() -> usize {
    3
}

impl Default for EthashConfig {
    fn default() -> Self {
        Self {
            full_dataset: false,
            l1_cache: false,
            retained_epochs: default_retained_epochs(),
            memory_limit_mb: None,
            sizing: EpochParams::default(),
        }
    }
}

impl EthashConfig {
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RxBackendKind {
    #[default]
    Soft,
    Native,
}

impl FromStr for RxBackendKind {
    type Err = PowError;

    fn from_str(s: &str) -> PowResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft" => Ok(RxBackendKind::Soft),
            "native" | "randomx" => Ok(RxBackendKind::Native),
            other => Err(PowError::Config(format!("unknown randomx backend '{other}'"))),
        }
    }
}

impl fmt::Display for RxBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RxBackendKind::Soft => "soft",
            RxBackendKind::Native => "native",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomXConfig {
    #[serde(default)]
    pub backend: RxBackendKind,

    /// Idle VMs kept per generation; extra VMs are dropped after use.
    #[serde(default = "default_max_idle_vms")]
    pub max_idle_vms: usize,

    #[serde(default)]
    pub soft: SoftRxParams,
}

fn default_max_idle_vms() -> usize {
    num_cpus::get()
}

impl Default for RandomXConfig {
    fn default() -> Self {
        Self {
            backend: RxBackendKind::default(),
            max_idle_vms: default_max_idle_vms(),
            soft: SoftRxParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PowConfig {
    #[serde(default)]
    pub ethash: EthashConfig,
    #[serde(default)]
    pub randomx: RandomXConfig,
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> PowResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| PowError::Config(format!("{key}: cannot parse '{raw}'")))
}

fn parse_bool(key: &str, raw: &str) -> PowResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PowError::Config(format!("{key}: expected a boolean, got '{raw}'"))),
    }
}

impl PowConfig {
    pub fn from_toml_str(s: &str) -> PowResult<Self> {
        toml::from_str(s).map_err(|e| PowError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> PowResult<String> {
        toml::to_string_pretty(self).map_err(|e| PowError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> PowResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| PowError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// File (if given) + environment overrides, validated.
    pub fn resolve(path: Option<&Path>) -> PowResult<Self> {
        let mut cfg = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> PowResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> PowResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HYBRID_POW_FULL_DATASET") {
            self.ethash.full_dataset = parse_bool("HYBRID_POW_FULL_DATASET", &v)?;
        }
        if let Some(v) = lookup("HYBRID_POW_L1_CACHE") {
            self.ethash.l1_cache = parse_bool("HYBRID_POW_L1_CACHE", &v)?;
        }
        if let Some(v) = lookup("HYBRID_POW_RETAINED_EPOCHS") {
            self.ethash.retained_epochs = parse_env("HYBRID_POW_RETAINED_EPOCHS", &v)?;
        }
        if let Some(v) = lookup("HYBRID_POW_MEMORY_LIMIT_MB") {
            let mb: u64 = parse_env("HYBRID_POW_MEMORY_LIMIT_MB", &v)?;
            self.ethash.memory_limit_mb = (mb > 0).then_some(mb);
        }
        if let Some(v) = lookup("HYBRID_POW_RX_BACKEND") {
            self.randomx.backend = v.parse()?;
        }
        if let Some(v) = lookup("HYBRID_POW_MAX_IDLE_VMS") {
            self.randomx.max_idle_vms = parse_env("HYBRID_POW_MAX_IDLE_VMS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> PowResult<()> {
        if self.ethash.retained_epochs == 0 {
            return Err(PowError::Config("ethash.retained_epochs must be >= 1".into()));
        }
        if self.ethash.memory_limit_mb == Some(0) {
            return Err(PowError::Config(
                "ethash.memory_limit_mb must be > 0 (omit it for no limit)".into(),
            ));
        }
        self.ethash
            .sizing
            .validate()
            .map_err(|e| PowError::Config(format!("ethash.sizing: {e}")))?;
        self.randomx
            .soft
            .validate()
            .map_err(|e| PowError::Config(format!("randomx.soft: {e}")))?;
        if self.randomx.backend == RxBackendKind::Native && !cfg!(feature = "randomx") {
            return Err(PowError::Config(
                "randomx.backend = \"native\" requires the `randomx` feature".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = PowConfig::default();
        assert!(!cfg.ethash.full_dataset);
        assert_eq!(cfg.ethash.retained_epochs, 3);
        assert_eq!(cfg.ethash.sizing, EpochParams::MAINNET);
        assert_eq!(cfg.randomx.backend, RxBackendKind::Soft);
        assert!(cfg.randomx.max_idle_vms >= 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = PowConfig::from_toml_str(
            r#"
            [ethash]
            full_dataset = true
            memory_limit_mb = 2048

            [ethash.sizing]
            light_cache_init_bytes = 4096

            [randomx.soft]
            mix_iters = 4096
            "#,
        )
        .unwrap();
        assert!(cfg.ethash.full_dataset);
        assert_eq!(cfg.ethash.retained_epochs, 3);
        assert_eq!(cfg.ethash.memory_limit_bytes(), Some(2048 * 1024 * 1024));
        assert_eq!(cfg.ethash.sizing.light_cache_init_bytes, 4096);
        assert_eq!(cfg.ethash.sizing.full_dataset_init_bytes, 1 << 30);
        assert_eq!(cfg.randomx.soft.mix_iters, 4096);
        assert_eq!(cfg.randomx.soft.scratch_kib, SoftRxParams::default().scratch_kib);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[randomx]\nmax_idle_vms = 7").unwrap();
        let cfg = PowConfig::load(file.path()).unwrap();
        assert_eq!(cfg.randomx.max_idle_vms, 7);

        let missing = PowConfig::load(Path::new("/nonexistent/hybrid-pow.toml"));
        assert!(matches!(missing, Err(PowError::Config(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut cfg = PowConfig::default();
        cfg.ethash.sizing = EpochParams::devnet();
        let text = cfg.to_toml_string().unwrap();
        let back = PowConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.ethash.sizing, EpochParams::devnet());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HYBRID_POW_FULL_DATASET", "yes"),
            ("HYBRID_POW_L1_CACHE", "true"),
            ("HYBRID_POW_RETAINED_EPOCHS", "5"),
            ("HYBRID_POW_MEMORY_LIMIT_MB", "0"),
            ("HYBRID_POW_RX_BACKEND", "SOFT"),
            ("HYBRID_POW_MAX_IDLE_VMS", "2"),
        ]
        .into_iter()
        .collect();

        let mut cfg = PowConfig::default();
        cfg.ethash.memory_limit_mb = Some(10);
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(cfg.ethash.full_dataset);
        assert!(cfg.ethash.l1_cache);
        assert_eq!(cfg.ethash.retained_epochs, 5);
        assert_eq!(cfg.ethash.memory_limit_mb, None);
        assert_eq!(cfg.randomx.backend, RxBackendKind::Soft);
        assert_eq!(cfg.randomx.max_idle_vms, 2);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut cfg = PowConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "HYBRID_POW_RETAINED_EPOCHS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, PowError::Config(msg) if msg.contains("HYBRID_POW_RETAINED_EPOCHS")));

        assert!("gpu".parse::<RxBackendKind>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut cfg = PowConfig::default();
        cfg.ethash.retained_epochs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PowConfig::default();
        cfg.randomx.soft.mix_iters = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PowConfig::default();
        cfg.randomx.backend = RxBackendKind::Native;
        assert_eq!(cfg.validate().is_ok(), cfg!(feature = "randomx"));
    }
}
