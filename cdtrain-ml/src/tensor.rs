//! Conversions between candle tensors and checkpoint payloads, and device selection.

use candle_core::{DType, Device, Tensor};
use cdtrain_core::{ConfigError, DeviceSpec, TensorPayload};

use crate::error::{MlError, Result};

/// Open the compute device described by `spec`.
///
/// CUDA devices are only available when candle was built with CUDA support.
pub fn open_device(spec: DeviceSpec) -> std::result::Result<Device, ConfigError> {
    match spec {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Cuda(ordinal) => {
            if !candle_core::utils::cuda_is_available() {
                return Err(ConfigError::invalid(
                    "device",
                    "this build of cdtrain has no CUDA support",
                ));
            }
            Device::new_cuda(ordinal).map_err(|e| ConfigError::invalid("device", e.to_string()))
        }
    }
}

/// Copy `tensor` to the host as a dense `f32` payload.
pub fn to_payload(tensor: &Tensor) -> Result<TensorPayload> {
    let shape = tensor.dims().to_vec();
    let data = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(TensorPayload::new(shape, data))
}

/// Build a tensor on `device` from a payload.
pub fn from_payload(payload: &TensorPayload, device: &Device) -> Result<Tensor> {
    if payload.numel() != payload.data.len() {
        return Err(MlError::model(format!(
            "payload of shape {:?} holds {} values",
            payload.shape,
            payload.data.len()
        )));
    }
    Ok(Tensor::from_vec(
        payload.data.clone(),
        payload.shape.as_slice(),
        device,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_keeps_shape_and_order() {
        let t = Tensor::arange(0f32, 6f32, &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap();
        let payload = to_payload(&t).unwrap();
        assert_eq!(payload.shape, vec![2, 3]);
        assert_eq!(payload.data, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        let back = from_payload(&payload, &Device::Cpu).unwrap();
        assert_eq!(back.dims(), &[2, 3]);
        assert_eq!(back.to_vec2::<f32>().unwrap()[1], vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_inconsistent_payload_is_rejected() {
        let payload = TensorPayload::new(vec![2, 2], vec![1.0; 3]);
        assert!(from_payload(&payload, &Device::Cpu).is_err());
    }

    #[test]
    fn test_cpu_device_always_opens() {
        assert!(open_device(DeviceSpec::Cpu).unwrap().is_cpu());
    }
}
