mod common;

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use common::*;
use graphbridge_backend_ref::{EngineProbe, GraphDef, IoDef, Op, OutputDef, ReferenceEngine};
use graphbridge_core::{
    f32_to_bytes, BridgeError, DType, Device, ErrorKind, IOName, ModelArtifact, Shape, Tensor,
};
use graphbridge_runtime::{
    InferResult, InferenceRequest, InstanceSettings, ModelConfig, ModelInstance, StatsRecorder,
};
use serde_json::json;
use tokio::sync::oneshot;

#[test]
fn unbatched_identity_echoes_input() -> Result<()> {
    let (mut instance, probe) = identity_instance(0, false, &[4])?;
    let (req, mut rx) = request(1, &[4], &[1.0, 2.0, 3.0, 4.0]);

    let summary = instance.execute(vec![req]);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(probe.infer_calls(), 1);

    let response = delivered(&mut rx)?;
    let out = response.output("OUTPUT0").expect("OUTPUT0 delivered");
    assert_eq!(out.shape, vec![4]);
    assert_eq!(out.to_f32()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn short_batch_is_padded_and_split_per_request() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[2])?;
    let (a, mut rx_a) = request(1, &[1, 2], &[1.0, 2.0]);
    let (b, mut rx_b) = request(2, &[1, 2], &[3.0, 4.0]);
    let (c, mut rx_c) = request(3, &[1, 2], &[5.0, 6.0]);

    let summary = instance.execute(vec![a, b, c]);
    assert_eq!(summary.total_batch_size, 3);
    assert_eq!(summary.batch_pad_size, 1);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(probe.infer_calls(), 1);

    for (rx, expected) in [
        (&mut rx_a, [1.0, 2.0]),
        (&mut rx_b, [3.0, 4.0]),
        (&mut rx_c, [5.0, 6.0]),
    ] {
        let response = delivered(rx)?;
        let out = response.output("OUTPUT0").expect("OUTPUT0 delivered");
        assert_eq!(out.shape, vec![1, 2]);
        assert_eq!(out.to_f32()?, expected.to_vec());
    }

    // the padding row trails the real rows and is zero-filled
    let bound = instance
        .infer_request()
        .input_tensor("INPUT0")
        .expect("INPUT0 bound");
    assert_eq!(bound.shape, Shape::from_slice(&[4, 2]));
    assert_eq!(
        graphbridge_core::bytes_to_f32(&bound.data)?,
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn multi_row_requests_keep_their_rows() -> Result<()> {
    let (mut instance, _probe) = identity_instance(4, true, &[1])?;
    let (a, mut rx_a) = request(1, &[2, 1], &[1.0, 2.0]);
    let (b, mut rx_b) = request(2, &[1, 1], &[3.0]);

    instance.execute(vec![a, b]);

    let out_a = delivered(&mut rx_a)?;
    let out_a = out_a.output("OUTPUT0").expect("OUTPUT0 delivered");
    assert_eq!(out_a.shape, vec![2, 1]);
    assert_eq!(out_a.to_f32()?, vec![1.0, 2.0]);

    let out_b = delivered(&mut rx_b)?;
    assert_eq!(out_b.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![3.0]);
    Ok(())
}

#[test]
fn oversized_batch_fails_without_inference() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[2])?;
    let (req, mut rx) = request(1, &[5, 2], &[0.0; 10]);

    let summary = instance.execute(vec![req]);
    assert_eq!(summary.failed, 1);
    assert!(!summary.inferred);
    assert_eq!(probe.infer_calls(), 0);

    let err = delivered(&mut rx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(
        err.to_string().contains("batch size 5 for 'identity', max allowed is 4"),
        "{err}"
    );
    Ok(())
}

#[test]
fn gpu_resident_input_is_unsupported() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[2])?;
    let gpu = Tensor::from_cuda_bytes(
        DType::F32,
        Shape::from_slice(&[4, 2]),
        0,
        f32_to_bytes(&[1.0; 8]),
    );
    let (req, mut rx) = InferenceRequest::new(1, MODEL, vec![(IOName::from("INPUT0"), gpu)]);

    instance.execute(vec![req]);
    let err = delivered(&mut rx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(err.to_string().contains("CPU memory"), "{err}");
    assert_eq!(probe.infer_calls(), 0);
    Ok(())
}

#[test]
fn pinned_input_is_accepted() -> Result<()> {
    let (mut instance, _probe) = identity_instance(0, false, &[2])?;
    let pinned = Tensor::from_pinned_bytes(DType::F32, Shape::from_slice(&[2]), f32_to_bytes(&[7.0, 8.0]));
    let (req, mut rx) = InferenceRequest::new(1, MODEL, vec![(IOName::from("INPUT0"), pinned)]);

    instance.execute(vec![req]);
    let response = delivered(&mut rx)?;
    assert_eq!(response.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![7.0, 8.0]);
    Ok(())
}

#[test]
fn size_mismatch_without_padding_fails_every_request() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, false, &[2])?;
    let (a, mut rx_a) = request(1, &[1, 2], &[1.0, 2.0]);
    let (b, mut rx_b) = request(2, &[1, 2], &[3.0, 4.0]);

    let summary = instance.execute(vec![a, b]);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 2);
    assert_eq!(probe.infer_calls(), 0);
    for rx in [&mut rx_a, &mut rx_b] {
        let err = delivered(rx).unwrap_err();
        assert!(err.to_string().contains("ENABLE_BATCH_PADDING"), "{err}");
    }
    Ok(())
}

#[test]
fn byte_size_mismatch_is_reported() -> Result<()> {
    let (mut instance, probe) = identity_instance(0, false, &[4])?;
    let short = Tensor::from_cpu_bytes(DType::F32, Shape::from_slice(&[4]), Bytes::from(vec![0u8; 12]));
    let (req, mut rx) = InferenceRequest::new(1, MODEL, vec![(IOName::from("INPUT0"), short)]);

    instance.execute(vec![req]);
    let err = delivered(&mut rx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(
        err.to_string().contains("expected 16 bytes of data in input buffer, got 12 bytes."),
        "{err}"
    );
    assert_eq!(probe.infer_calls(), 0);
    Ok(())
}

#[test]
fn mismatched_trailing_shape_is_invalid() -> Result<()> {
    let (mut instance, _probe) = identity_instance(4, true, &[2])?;
    let (a, mut rx_a) = request(1, &[1, 2], &[1.0, 2.0]);
    let (b, mut rx_b) = request(2, &[1, 3], &[1.0, 2.0, 3.0]);

    instance.execute(vec![a, b]);
    for rx in [&mut rx_a, &mut rx_b] {
        assert_eq!(delivered(rx).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
    Ok(())
}

#[test]
fn marshalled_bytes_match_request_bytes() -> Result<()> {
    let (mut instance, _probe) = identity_instance(4, false, &[2])?;
    let (a, _rx_a) = request(1, &[2, 2], &[1.5, -2.0, 3.25, 4.0]);
    let (b, _rx_b) = request(2, &[2, 2], &[5.0, 6.0, 7.0, -8.5]);

    instance.execute(vec![a, b]);
    let bound = instance
        .infer_request()
        .input_tensor("INPUT0")
        .expect("INPUT0 bound");
    assert_eq!(
        bound.data,
        f32_to_bytes(&[1.5, -2.0, 3.25, 4.0, 5.0, 6.0, 7.0, -8.5]).to_vec()
    );
    Ok(())
}

#[test]
fn engine_failure_fails_batch_and_instance_recovers() -> Result<()> {
    let (mut instance, probe) = identity_instance(2, true, &[1])?;
    probe.fail_inference(true);

    let (a, mut rx_a) = request(1, &[1, 1], &[1.0]);
    let (b, mut rx_b) = request(2, &[1, 1], &[2.0]);
    let summary = instance.execute(vec![a, b]);
    assert!(summary.inferred);
    assert_eq!(summary.failed, 2);
    for rx in [&mut rx_a, &mut rx_b] {
        let err = delivered(rx).unwrap_err();
        assert!(matches!(err, BridgeError::Engine { .. }), "{err}");
    }

    probe.fail_inference(false);
    let (c, mut rx_c) = request(3, &[2, 1], &[3.0, 4.0]);
    let summary = instance.execute(vec![c]);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(delivered(&mut rx_c)?.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![3.0, 4.0]);
    assert_eq!(probe.infer_calls(), 2);
    Ok(())
}

#[test]
fn closed_requester_does_not_fail_siblings() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[1])?;
    let (a, mut rx_a) = request(1, &[1, 1], &[1.0]);
    let (b, rx_b) = request(2, &[1, 1], &[2.0]);
    let (c, mut rx_c) = request(3, &[1, 1], &[3.0]);
    drop(rx_b);

    let summary = instance.execute(vec![a, b, c]);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total_batch_size, 3);
    assert_eq!(probe.infer_calls(), 1);
    assert_eq!(delivered(&mut rx_a)?.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![1.0]);
    assert_eq!(delivered(&mut rx_c)?.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![3.0]);
    Ok(())
}

#[test]
fn malformed_request_fails_the_batch_before_inference() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[1])?;
    let (good, mut rx_good) = request(1, &[1, 1], &[1.0]);
    let (empty, mut rx_empty) = InferenceRequest::new(2, MODEL, Vec::new());

    let summary = instance.execute(vec![good, empty]);
    assert_eq!(summary.failed, 2);
    assert_eq!(probe.infer_calls(), 0);
    for rx in [&mut rx_good, &mut rx_empty] {
        assert_eq!(delivered(rx).unwrap_err().kind(), ErrorKind::Internal);
    }
    Ok(())
}

#[test]
fn empty_batch_skips_the_engine() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[2])?;
    let (req, mut rx) = request(1, &[0, 2], &[]);

    let summary = instance.execute(vec![req]);
    assert!(!summary.inferred);
    assert!(summary.error.is_none());
    assert_eq!(probe.infer_calls(), 0);
    // no response is produced; the channel simply closes
    assert!(rx.try_recv().is_err());
    Ok(())
}

fn two_output_instance() -> Result<ModelInstance<ReferenceEngine>> {
    let def = GraphDef {
        name: "pair".to_string(),
        inputs: vec![IoDef {
            name: "INPUT0".to_string(),
            data_type: "FP32".to_string(),
            dims: vec![-1, 2],
        }],
        outputs: vec![
            OutputDef {
                name: "OUTPUT0".to_string(),
                op: Op::Identity {
                    input: "INPUT0".to_string(),
                },
            },
            OutputDef {
                name: "OUTPUT1".to_string(),
                op: Op::Scale {
                    input: "INPUT0".to_string(),
                    factor: 2.0,
                },
            },
        ],
    };
    let raw = json!({
        "name": "pair",
        "max_batch_size": 4,
        "input": [{ "name": "INPUT0", "data_type": "TYPE_FP32", "dims": [2] }],
        "output": [
            { "name": "OUTPUT0", "data_type": "TYPE_FP32", "dims": [2] },
            { "name": "OUTPUT1", "data_type": "TYPE_FP32", "dims": [2] }
        ],
        "parameters": { "ENABLE_BATCH_PADDING": { "string_value": "YES" } }
    });
    let config = Arc::new(ModelConfig::from_json(&raw.to_string())?);
    let settings = InstanceSettings::new(
        "pair_0",
        Device::Cpu,
        ModelArtifact::inline("pair", def.to_json()?),
    );
    Ok(ModelInstance::create(ReferenceEngine::new(), config, settings)?)
}

#[test]
fn requested_outputs_are_filtered_per_request() -> Result<()> {
    let mut instance = two_output_instance()?;
    let (only_scaled, mut rx_scaled) = request(1, &[1, 2], &[1.0, 2.0]);
    let only_scaled = only_scaled.with_requested_outputs(vec![IOName::from("OUTPUT1")]);
    let (unknown, mut rx_unknown) = request(2, &[1, 2], &[3.0, 4.0]);
    let unknown = unknown.with_requested_outputs(vec![IOName::from("OUTPUT9")]);
    let (all, mut rx_all) = request(3, &[1, 2], &[5.0, 6.0]);

    let summary = instance.execute(vec![only_scaled, unknown, all]);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let scaled = delivered(&mut rx_scaled)?;
    assert_eq!(scaled.outputs.len(), 1);
    assert_eq!(scaled.output("OUTPUT1").expect("OUTPUT1").to_f32()?, vec![2.0, 4.0]);

    let err = delivered(&mut rx_unknown).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("OUTPUT9"), "{err}");

    let all = delivered(&mut rx_all)?;
    assert_eq!(all.output("OUTPUT0").expect("OUTPUT0").to_f32()?, vec![5.0, 6.0]);
    assert_eq!(all.output("OUTPUT1").expect("OUTPUT1").to_f32()?, vec![10.0, 12.0]);
    Ok(())
}

#[test]
fn statistics_follow_batch_outcome() -> Result<()> {
    let probe = EngineProbe::default();
    let stats = Arc::new(StatsRecorder::new());
    let settings = InstanceSettings::new("identity_0", Device::Cpu, identity_artifact(true, &[1])?);
    let mut instance = ModelInstance::create(
        ReferenceEngine::with_probe(probe.clone()),
        identity_config(2, true, &[1]),
        settings,
    )?
    .with_stats(stats.clone());

    let (a, _rx_a) = request(1, &[1, 1], &[1.0]);
    let (b, _rx_b) = request(2, &[1, 1], &[2.0]);
    instance.execute(vec![a, b]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests_ok, 2);
    assert_eq!(snapshot.batches, 1);
    assert_eq!(snapshot.batched_rows, 2);

    probe.fail_inference(true);
    let (c, _rx_c) = request(3, &[1, 1], &[3.0]);
    instance.execute(vec![c]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.batches, 1);
    Ok(())
}

fn add_instance() -> Result<(ModelInstance<ReferenceEngine>, EngineProbe)> {
    let operand = |name: &str| IoDef {
        name: name.to_string(),
        data_type: "FP32".to_string(),
        dims: vec![1],
    };
    let def = GraphDef {
        name: "add".to_string(),
        inputs: vec![operand("A"), operand("B")],
        outputs: vec![OutputDef {
            name: "SUM".to_string(),
            op: Op::Add {
                lhs: "A".to_string(),
                rhs: "B".to_string(),
            },
        }],
    };
    let raw = json!({
        "name": "add",
        "max_batch_size": 0,
        "input": [
            { "name": "A", "data_type": "TYPE_FP32", "dims": [1] },
            { "name": "B", "data_type": "TYPE_FP32", "dims": [1] }
        ],
        "output": [{ "name": "SUM", "data_type": "TYPE_FP32", "dims": [1] }]
    });
    let config = Arc::new(ModelConfig::from_json(&raw.to_string())?);
    let settings =
        InstanceSettings::new("add_0", Device::Cpu, ModelArtifact::inline("add", def.to_json()?));
    let probe = EngineProbe::default();
    let instance = ModelInstance::create(ReferenceEngine::with_probe(probe.clone()), config, settings)?;
    Ok((instance, probe))
}

fn add_request(id: u64, inputs: &[(&str, f32)]) -> (InferenceRequest, oneshot::Receiver<InferResult>) {
    InferenceRequest::new(
        id,
        "add",
        inputs
            .iter()
            .map(|(name, v)| (IOName::from(*name), Tensor::from_f32(&[1], &[*v])))
            .collect(),
    )
}

#[test]
fn missing_bound_input_fails_instead_of_reusing_stale_data() -> Result<()> {
    let (mut instance, probe) = add_instance()?;

    let (full, mut rx_full) = add_request(1, &[("A", 1.0), ("B", 10.0)]);
    assert_eq!(instance.execute(vec![full]).succeeded, 1);
    let sum = delivered(&mut rx_full)?;
    assert_eq!(sum.output("SUM").expect("SUM").to_f32()?, vec![11.0]);

    let (partial, mut rx_partial) = add_request(2, &[("A", 2.0)]);
    let summary = instance.execute(vec![partial]);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(probe.infer_calls(), 1);
    let err = delivered(&mut rx_partial).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("'B'"), "{err}");
    Ok(())
}

#[test]
fn unbound_input_name_is_unsupported() -> Result<()> {
    let (mut instance, probe) = identity_instance(0, false, &[2])?;
    let (req, mut rx) = InferenceRequest::new(
        1,
        MODEL,
        vec![
            (IOName::from("INPUT0"), Tensor::from_f32(&[2], &[1.0, 2.0])),
            (IOName::from("INPUT9"), Tensor::from_f32(&[2], &[3.0, 4.0])),
        ],
    );

    let summary = instance.execute(vec![req]);
    assert_eq!(summary.failed, 1);
    assert_eq!(probe.infer_calls(), 0);
    let err = delivered(&mut rx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(err.to_string().contains("INPUT9"), "{err}");
    Ok(())
}

#[test]
fn overflowing_batch_sizes_fail_without_inference() -> Result<()> {
    let (mut instance, probe) = identity_instance(4, true, &[2])?;
    let huge = Tensor::from_cpu_bytes(
        DType::F32,
        Shape::from_slice(&[usize::MAX, 2]),
        f32_to_bytes(&[0.0; 2]),
    );
    let (big, mut rx_big) = InferenceRequest::new(1, MODEL, vec![(IOName::from("INPUT0"), huge)]);
    let (small, mut rx_small) = request(2, &[1, 2], &[1.0, 2.0]);

    let summary = instance.execute(vec![big, small]);
    assert_eq!(summary.failed, 2);
    assert_eq!(probe.infer_calls(), 0);
    for rx in [&mut rx_big, &mut rx_small] {
        assert_eq!(delivered(rx).unwrap_err().kind(), ErrorKind::Internal);
    }
    Ok(())
}
