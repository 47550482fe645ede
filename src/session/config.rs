//! Session configuration
//!
//! [`SessionConfig`] holds everything a session is created with: the base
//! dtype/layout handed to tensors and params it allocates, the target
//! backend, the debug level and the worker thread count. It round-trips
//! through JSON and can be overridden from the environment:
//!
//! - `SHL_API`: target backend (`ref`, `c906`, `rvv`, ...)
//! - `SHL_RUN_MODE`: `layer` or `cpu_graph`
//! - `SHL_DTYPE`: base dtype (`float32`, `f16`, `int8`, ...)
//! - `SHL_NUM_THREADS`: worker threads

use crate::backend::{Api, RunMode};
use crate::error::{io_context, ShlError, ShlResult};
use crate::logging::DebugLevel;
use crate::params::WinogradTile;
use crate::tensor::{DType, Layout, QuantType};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const API_ENV: &str = "SHL_API";
const RUN_MODE_ENV: &str = "SHL_RUN_MODE";
const DTYPE_ENV: &str = "SHL_DTYPE";
const NUM_THREADS_ENV: &str = "SHL_NUM_THREADS";

/// What a session does with a loaded or built model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    #[default]
    RunOnly,
    SaveOnly,
    SaveAndRun,
}

/// Model-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Binary model path, for save and load
    pub path: Option<PathBuf>,
    pub save_mode: SaveMode,
    pub priority: i32,
}

/// Configuration of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Dtype given to tensors the session allocates
    pub base_dtype: DType,
    /// Layout given to tensors and params the session allocates
    pub base_layout: Layout,
    pub base_api: Api,
    pub base_run_mode: RunMode,
    pub base_quant_type: QuantType,
    pub debug_level: DebugLevel,
    pub profiler_level: i32,
    pub dynamic_shape: bool,
    pub model: ModelConfig,
    /// Worker threads for kernel execution
    pub num_threads: usize,
    /// Float Winograd tile for convolutions the session's params create
    pub winograd_tile: WinogradTile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            base_dtype: DType::Float32,
            base_layout: Layout::NCHW,
            base_api: Api::Ref,
            base_run_mode: RunMode::Layer,
            base_quant_type: QuantType::Unset,
            debug_level: DebugLevel::Warning,
            profiler_level: 0,
            dynamic_shape: false,
            model: ModelConfig::default(),
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            winograd_tile: WinogradTile::default(),
        }
    }
}

impl SessionConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target backend
    pub fn with_api(mut self, api: Api) -> Self {
        self.base_api = api;
        self
    }

    /// Set the run mode
    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.base_run_mode = run_mode;
        self
    }

    /// Set the base dtype
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.base_dtype = dtype;
        self
    }

    /// Set the base layout
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.base_layout = layout;
        self
    }

    /// Set the quantization scheme
    pub fn with_quant_type(mut self, quant_type: QuantType) -> Self {
        self.base_quant_type = quant_type;
        self
    }

    /// Set the debug level
    pub fn with_debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// Set the worker thread count
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the float Winograd tile
    pub fn with_winograd_tile(mut self, tile: WinogradTile) -> Self {
        self.winograd_tile = tile;
        self
    }

    /// Set the binary model path
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model.path = Some(path.into());
        self
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> ShlResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> ShlResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading session config {}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> ShlResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `SHL_*` overrides. Values that fail to parse are logged and
    /// ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(api) = env_value::<Api>(API_ENV) {
            self.base_api = api;
        }
        if let Some(run_mode) = env_value::<RunMode>(RUN_MODE_ENV) {
            self.base_run_mode = run_mode;
        }
        if let Some(dtype) = env_value::<DType>(DTYPE_ENV) {
            self.base_dtype = dtype;
        }
        if let Some(threads) = env_value::<usize>(NUM_THREADS_ENV) {
            self.num_threads = threads;
        }
        self
    }

    /// Reject combinations no backend can serve
    pub fn validate(&self) -> ShlResult<()> {
        if self.num_threads == 0 {
            return Err(ShlError::InvalidConfiguration(
                "num_threads must be at least 1".to_string(),
            ));
        }
        if matches!(self.base_dtype, DType::Bool | DType::Int4) {
            return Err(ShlError::InvalidConfiguration(format!(
                "{} is not a valid base dtype",
                self.base_dtype
            )));
        }
        if let Some(expected) = self.base_quant_type.dtype() {
            if self.base_dtype.is_quantized() && expected != self.base_dtype {
                return Err(ShlError::InvalidConfiguration(format!(
                    "quant type {:?} stores {}, base dtype is {}",
                    self.base_quant_type, expected, self.base_dtype
                )));
            }
        }
        if self.base_run_mode == RunMode::NpuGraph {
            return Err(ShlError::BackendUnavailable(
                "npu_graph needs a vendor driver".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let c = SessionConfig::default();
        assert_eq!(c.base_api, Api::Ref);
        assert_eq!(c.base_run_mode, RunMode::Layer);
        assert_eq!(c.base_dtype, DType::Float32);
        assert_eq!(c.base_layout, Layout::NCHW);
        assert_eq!(c.debug_level, DebugLevel::Warning);
        assert!(c.num_threads >= 1);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_json_partial_document() {
        let c = SessionConfig::from_json_str(
            r#"{"base_api": "c906", "base_dtype": "int8", "num_threads": 2, "winograd_tile": "f43"}"#,
        )
        .unwrap();
        assert_eq!(c.base_api, Api::C906);
        assert_eq!(c.base_dtype, DType::Int8);
        assert_eq!(c.num_threads, 2);
        assert_eq!(c.winograd_tile, WinogradTile::F43);
        assert_eq!(c.base_layout, Layout::NCHW);

        let back = SessionConfig::from_json_str(&c.to_json_string().unwrap()).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(SessionConfig::new().with_num_threads(0).validate().is_err());
        assert!(SessionConfig::new().with_dtype(DType::Bool).validate().is_err());
        assert!(SessionConfig::new()
            .with_run_mode(RunMode::NpuGraph)
            .validate()
            .is_err());
        assert!(SessionConfig::from_json_str("{\"num_threads\": 0}").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"base_run_mode": "cpu_graph"}"#).unwrap();
        let c = SessionConfig::from_json_file(&path).unwrap();
        assert_eq!(c.base_run_mode, RunMode::CpuGraph);
        assert!(SessionConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var(API_ENV, "rvv");
        env::set_var(NUM_THREADS_ENV, "3");
        env::set_var(DTYPE_ENV, "not-a-dtype");
        let c = SessionConfig::from_env();
        env::remove_var(API_ENV);
        env::remove_var(NUM_THREADS_ENV);
        env::remove_var(DTYPE_ENV);

        assert_eq!(c.base_api, Api::Rvv);
        assert_eq!(c.num_threads, 3);
        assert_eq!(c.base_dtype, DType::Float32);
    }
}
