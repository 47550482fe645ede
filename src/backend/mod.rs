//! Target backends
//!
//! An [`Api`] names a hardware/ISA profile. Each backend contributes kernels,
//! init functions and (for graph run modes) a session backend to a
//! [`Registry`]. [`default_registry`] wires up everything this crate ships:
//!
//! | api | kernels |
//! |---|---|
//! | `Ref` | reference kernels for every operator |
//! | `Rvv`, `C906`, `C908`, `C920` | reference kernels, then the packed GEMM / Winograd convolution family and GEMM fully-connected on top |
//! | `Gref` | graph session backend used by `RunMode::CpuGraph` |

use crate::registry::Registry;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Api {
    #[default]
    Ref,
    Gref,
    C860,
    C906,
    C920,
    Anole,
    Ch8601,
    Th1520,
    Dp1k,
    I805,
    E804,
    RefI805,
    C908,
    Tvmgen,
    Asp,
    Rvv,
    Rvm,
    E907,
}

impl Api {
    pub const ALL: [Api; 18] = [
        Api::Ref,
        Api::Gref,
        Api::C860,
        Api::C906,
        Api::C920,
        Api::Anole,
        Api::Ch8601,
        Api::Th1520,
        Api::Dp1k,
        Api::I805,
        Api::E804,
        Api::RefI805,
        Api::C908,
        Api::Tvmgen,
        Api::Asp,
        Api::Rvv,
        Api::Rvm,
        Api::E907,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Api::Ref => "ref",
            Api::Gref => "gref",
            Api::C860 => "c860",
            Api::C906 => "c906",
            Api::C920 => "c920",
            Api::Anole => "anole",
            Api::Ch8601 => "ch8601",
            Api::Th1520 => "th1520",
            Api::Dp1k => "dp1k",
            Api::I805 => "i805",
            Api::E804 => "e804",
            Api::RefI805 => "refi805",
            Api::C908 => "c908",
            Api::Tvmgen => "tvmgen",
            Api::Asp => "asp",
            Api::Rvv => "rvv",
            Api::Rvm => "rvm",
            Api::E907 => "e907",
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Api {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Api::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == lower)
            .ok_or_else(|| format!("unknown api: {}", s))
    }
}

/// How a session executes its operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Caller invokes operators one by one
    #[default]
    Layer,
    /// Operators are recorded and run by the CPU graph backend
    CpuGraph,
    /// Operators are compiled for an NPU driver
    NpuGraph,
    CpuBaseHybrid,
}

impl RunMode {
    pub fn is_graph(self) -> bool {
        !matches!(self, RunMode::Layer)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::Layer => "layer",
            RunMode::CpuGraph => "cpu_graph",
            RunMode::NpuGraph => "npu_graph",
            RunMode::CpuBaseHybrid => "cpu_base_hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| format!("unknown run mode: {}", s))
    }
}

/// Vector register geometry of an optimized backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorProfile {
    pub vlen_bits: usize,
}

impl VectorProfile {
    pub const VLEN_128: VectorProfile = VectorProfile { vlen_bits: 128 };

    /// Register geometry the packed kernels of `api` are laid out for.
    /// `None` for apis without packed kernels.
    pub fn for_api(api: Api) -> Option<VectorProfile> {
        match api {
            Api::C906 | Api::C908 | Api::C920 | Api::Rvv => Some(VectorProfile::VLEN_128),
            _ => None,
        }
    }

    /// Elements of `dtype` per packed lane group.
    ///
    /// Float types fill one register. int8 uses half a register's bytes
    /// because its products widen to 16 bits.
    pub fn packn(&self, dtype: DType) -> usize {
        let vlenb = self.vlen_bits / 8;
        match dtype {
            DType::Int8 | DType::Uint8 | DType::Int4 => vlenb / 2,
            d => (vlenb / d.element_bytes()).max(1),
        }
    }
}

/// Apis that get the packed convolution family
pub const OPTIMIZED_APIS: [Api; 4] = [Api::Rvv, Api::C906, Api::C908, Api::C920];

/// Registry with every backend this crate provides
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    crate::kernels::reference::register(&mut registry, Api::Ref);
    for api in OPTIMIZED_APIS {
        crate::kernels::reference::register(&mut registry, api);
        if let Some(profile) = VectorProfile::for_api(api) {
            tracing::debug!("{}: packed kernels at VLEN {}", api, profile.vlen_bits);
            crate::kernels::conv::register(&mut registry, api, profile);
        }
    }
    crate::session::graph::register(&mut registry);
    tracing::debug!(
        "default registry: {} kernels, {} init functions, {} session backends",
        registry.kernel_count(),
        registry.init_count(),
        registry.session_backend_count()
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_parse_roundtrip() {
        for api in Api::ALL {
            assert_eq!(api.to_string().parse::<Api>(), Ok(api));
        }
        assert_eq!("C906".parse::<Api>(), Ok(Api::C906));
        assert!("cuda".parse::<Api>().is_err());
    }

    #[test]
    fn test_run_mode() {
        assert!(!RunMode::Layer.is_graph());
        assert!(RunMode::CpuGraph.is_graph());
        assert_eq!("cpu_graph".parse::<RunMode>(), Ok(RunMode::CpuGraph));
        assert_eq!(RunMode::CpuBaseHybrid.to_string(), "cpu_base_hybrid");
    }

    #[test]
    fn test_packn_at_vlen_128() {
        let p = VectorProfile::VLEN_128;
        assert_eq!(p.packn(DType::Float32), 4);
        assert_eq!(p.packn(DType::Float16), 8);
        assert_eq!(p.packn(DType::Int8), 8);
    }

    #[test]
    fn test_packn_wider_vectors() {
        let p = VectorProfile { vlen_bits: 256 };
        assert_eq!(p.packn(DType::Float32), 8);
        assert_eq!(p.packn(DType::Float16), 16);
        assert_eq!(p.packn(DType::Int8), 16);
    }

    #[test]
    fn test_profile_for_api() {
        for api in OPTIMIZED_APIS {
            assert_eq!(VectorProfile::for_api(api), Some(VectorProfile::VLEN_128));
        }
        assert_eq!(VectorProfile::for_api(Api::Ref), None);
        assert_eq!(VectorProfile::for_api(Api::Gref), None);
    }

    #[test]
    fn test_default_registry_has_every_layer() {
        let registry = default_registry();
        assert!(registry.kernel_count() > 0);
        assert!(registry.init_count() > 0);
        assert!(registry.session_backend_count() > 0);
    }
}
