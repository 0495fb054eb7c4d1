use graphbridge_core::{
    bytes_to_f32, f32_to_bytes, BridgeError, DType, Device, ErrorKind, MemoryType, Shape, Tensor,
    TensorSpec,
};

#[test]
fn dtype_accepts_config_spellings() {
    assert_eq!("TYPE_FP32".parse::<DType>().unwrap(), DType::F32);
    assert_eq!("INT64".parse::<DType>().unwrap(), DType::I64);
    assert!("TYPE_STRING".parse::<DType>().is_err());
    assert_eq!(DType::F16.byte_size(), 2);
}

#[test]
fn shape_replaces_leading_dimension() {
    let shape = Shape::from_slice(&[1, 3, 2]);
    assert_eq!(shape.numel(), 6);
    assert_eq!(shape.with_leading(4), Shape::from_slice(&[4, 3, 2]));
    assert_eq!(shape.to_signed(), vec![1, 3, 2]);
    assert_eq!(Shape::from_slice(&[]).with_leading(4), Shape::from_slice(&[]));
}

#[test]
fn checked_sizes_report_overflow() {
    let shape = Shape::from_slice(&[2, 3]);
    assert_eq!(shape.checked_numel(), Some(6));
    assert_eq!(shape.checked_byte_size(DType::F32), Some(24));
    assert_eq!(Shape::from_slice(&[]).checked_numel(), Some(1));

    let huge = Shape::from_slice(&[usize::MAX, 2]);
    assert_eq!(huge.checked_numel(), None);
    assert_eq!(Shape::from_slice(&[usize::MAX]).checked_byte_size(DType::F32), None);
}

#[test]
fn storage_reports_residency() {
    let cpu = Tensor::from_f32(&[2], &[1.0, 2.0]);
    assert_eq!(cpu.memory_type(), MemoryType::Cpu);
    assert!(cpu.storage.cpu_bytes().is_some());

    let gpu = Tensor::from_cuda_bytes(DType::F32, Shape::from_slice(&[2]), 1, f32_to_bytes(&[0.0; 2]));
    assert_eq!(gpu.memory_type(), MemoryType::Gpu { device_id: 1 });
    assert_eq!(gpu.desc.device, Device::Cuda { device_id: 1 });
    assert!(gpu.storage.cpu_bytes().is_none());
}

#[test]
fn f32_bytes_are_little_endian() {
    let bytes = f32_to_bytes(&[1.0, -0.5]);
    assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
    assert_eq!(bytes_to_f32(&bytes).unwrap(), vec![1.0, -0.5]);
    assert!(bytes_to_f32(&bytes[..3]).is_err());
}

#[test]
fn dynamic_dims_match_anything() {
    let spec = TensorSpec::from_signed_dims("x", DType::F32, &[-1, 4]);
    assert!(spec.dims_compatible(&[Some(8), Some(4)]));
    assert!(spec.dims_compatible(&[None, Some(4)]));
    assert!(!spec.dims_compatible(&[Some(8), Some(5)]));
    assert!(!spec.dims_compatible(&[Some(4)]));
}

#[test]
fn engine_errors_map_to_internal() {
    let err = BridgeError::engine("running inference", anyhow::anyhow!("device lost"));
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(
        err.to_string(),
        "engine error while running inference: device lost"
    );
    assert_eq!(
        BridgeError::Unavailable("x".into()).kind(),
        ErrorKind::Unavailable
    );
}
