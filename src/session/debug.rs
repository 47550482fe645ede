//! Debug dumps emitted while the session debug level is `Debug`

use crate::params::OpParams;
use crate::quant::to_f32_vec;
use crate::tensor::stats::mean_std;
use crate::tensor::Tensor;

const PREVIEW: usize = 8;

/// Log the parameters of the operator about to run
pub fn debug_print_params(params: &OpParams) {
    match serde_json::to_string(params) {
        Ok(json) => tracing::debug!(target: "shl::debug", "{} params: {}", params.category(), json),
        Err(_) => tracing::debug!(target: "shl::debug", "{} params: {:?}", params.category(), params),
    }
}

/// Log a tensor's descriptor and, when it holds data, summary statistics
/// over its real values
pub fn debug_print_tensor(tensor: &Tensor) {
    tracing::debug!(
        target: "shl::debug",
        "tensor '{}': {} {} {:?} const={} qinfo={}",
        tensor.name,
        tensor.dtype,
        tensor.layout,
        tensor.dims(),
        tensor.is_const,
        tensor.quant_channel()
    );
    if tensor.data.is_none() {
        return;
    }
    match to_f32_vec(tensor) {
        Ok(values) => {
            let stats = mean_std(&values);
            let n = values.len().min(PREVIEW);
            tracing::debug!(
                target: "shl::debug",
                "  max={:.6} min={:.6} mean={:.6} std={:.6} head={:?}",
                stats.max,
                stats.min,
                stats.mean,
                stats.std,
                &values[..n]
            );
        }
        Err(e) => tracing::debug!(target: "shl::debug", "  no statistics: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SisoParams;
    use crate::tensor::{DType, Layout};

    #[test]
    fn test_prints_without_data_or_subscriber() {
        debug_print_tensor(&Tensor::new(DType::Int8, &[2, 2], Layout::NC).unwrap());
        debug_print_tensor(&Tensor::from_f32(&[3], Layout::N, vec![1.0, 2.0, 3.0]).unwrap());
        debug_print_params(&OpParams::from(SisoParams::default()));
    }
}
