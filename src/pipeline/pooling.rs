//! Temporal mean pooling of prior activations

use anyhow::Result;
use candle_core::{DType, Tensor};

use crate::error::EmbedError;

/// Check that `windows` splits `frames` into equal slices
pub fn check_windows(frames: usize, windows: usize) -> Result<()> {
    if windows == 0 || frames % windows != 0 {
        return Err(EmbedError::PoolingWindows {
            windows,
            tokens: frames,
        }
        .into());
    }
    Ok(())
}

/// Average `[frames, width]` activations over `windows` equal time slices.
///
/// Returns `[windows, width]` in F32.
pub fn mean_pool(acts: &Tensor, windows: usize) -> Result<Tensor> {
    let (frames, width) = acts.dims2()?;
    check_windows(frames, windows)?;
    let pooled = acts
        .to_dtype(DType::F32)?
        .reshape((windows, frames / windows, width))?
        .mean(1)?;
    Ok(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_pool_row_means() {
        let device = Device::Cpu;
        // Row i holds the value i in every column
        let rows = Tensor::arange(0f32, 8192.0, &device)
            .unwrap()
            .reshape((8192, 1))
            .unwrap();
        let acts = rows.broadcast_as((8192, 4800)).unwrap().contiguous().unwrap();

        let pooled = mean_pool(&acts, 32).unwrap();
        assert_eq!(pooled.dims(), &[32, 4800]);

        let first_col: Vec<f32> = pooled.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (j, value) in first_col.iter().enumerate() {
            let expected = 256.0 * j as f32 + 127.5;
            assert!((value - expected).abs() < 1e-2, "window {}: {}", j, value);
        }
    }

    #[test]
    fn test_pool_rejects_non_divisor() {
        let acts = Tensor::zeros((8192, 4), DType::F32, &Device::Cpu).unwrap();
        let err = mean_pool(&acts, 7).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmbedError>(),
            Some(EmbedError::PoolingWindows {
                windows: 7,
                tokens: 8192
            })
        ));
    }

    #[test]
    fn test_pool_rejects_zero() {
        assert!(check_windows(8192, 0).is_err());
        assert!(check_windows(8192, 1).is_ok());
        assert!(check_windows(8192, 8192).is_ok());
    }

    #[test]
    fn test_pool_widens_half_precision() {
        let acts = Tensor::ones((64, 3), DType::F16, &Device::Cpu).unwrap();
        let pooled = mean_pool(&acts, 4).unwrap();
        assert_eq!(pooled.dtype(), DType::F32);
        assert_eq!(pooled.dims(), &[4, 3]);
    }
}
