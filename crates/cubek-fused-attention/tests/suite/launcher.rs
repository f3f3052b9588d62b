use cubecl::{
    Runtime, TestRuntime, client::ComputeClient, frontend::CubePrimitive, ir::StorageType,
    std::tensor::TensorHandle,
};
use cubek_fused_attention::{
    definition::{
        AttentionGlobalTypes, AttentionIdent, AttentionOptions, AttentionProblem,
        AttentionSetupError,
    },
    launch::{
        LoadingStrategy, Strategy, TileStrategy, attention_forward, attention_forward_quantized,
        launch_ref,
    },
};
use cubek_test_utils::{
    Distribution, HostData, HostDataType, HostDataVec, StrideSpec, TestInput, TestOutcome,
    assert_relative_close, current_test_mode,
};

use crate::suite::cpu_reference::attention_cpu;

pub(crate) fn client() -> ComputeClient<TestRuntime> {
    <TestRuntime as Runtime>::client(&Default::default())
}

pub(crate) fn problem(
    batch: usize,
    qo_heads: usize,
    kv_heads: usize,
    seq_q: usize,
    seq_kv: usize,
    head_dim: usize,
    causal: bool,
) -> AttentionProblem {
    let query = [batch, qo_heads, seq_q, head_dim];
    let kv = [batch, kv_heads, seq_kv, head_dim];
    AttentionProblem::from_shapes(&query, &kv, &kv, AttentionOptions { causal })
        .expect("Test problem should be valid")
}

/// Uniform `[-1, 1)` tensor of the problem's `ident` shape.
pub(crate) fn random_input(
    client: &ComputeClient<TestRuntime>,
    problem: &AttentionProblem,
    ident: AttentionIdent,
    dtype: StorageType,
    seed: u64,
) -> (TensorHandle<TestRuntime>, HostData) {
    TestInput::random(
        client.clone(),
        problem.shape(ident),
        dtype,
        seed,
        Distribution::Uniform(-1., 1.),
        StrideSpec::RowMajor,
    )
    .generate_with_f32_host_data()
}

/// Unwraps a launch, or skips the test when the device cannot run the kernel.
///
/// Anything else fails: the tests never build rejected inputs by accident.
pub(crate) fn launched<T>(result: Result<T, AttentionSetupError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_device_limitation() => {
            current_test_mode()
                .decide(TestOutcome::CompileError(err.to_string()))
                .enforce();
            None
        }
        Err(err) => panic!("Test inputs rejected: {err}"),
    }
}

pub(crate) fn run_forward(
    client: &ComputeClient<TestRuntime>,
    query: &TensorHandle<TestRuntime>,
    key: &TensorHandle<TestRuntime>,
    value: &TensorHandle<TestRuntime>,
    options: AttentionOptions,
) -> Option<HostData> {
    let out = launched(attention_forward(client, query, key, value, options))?;
    Some(HostData::from_tensor_handle(client, &out, HostDataType::F32))
}

/// Forward pass on contiguous inputs with the kernel variant forced to `strategy`.
pub(crate) fn run_forward_with(
    strategy: Strategy,
    client: &ComputeClient<TestRuntime>,
    query: &TensorHandle<TestRuntime>,
    key: &TensorHandle<TestRuntime>,
    value: &TensorHandle<TestRuntime>,
    options: AttentionOptions,
) -> Option<HostData> {
    let out = TensorHandle::empty(client, query.shape.clone(), value.dtype);
    let global_types = AttentionGlobalTypes {
        query: query.dtype,
        key: key.dtype,
        value: value.dtype,
        out: value.dtype,
    };

    launched(launch_ref(
        strategy,
        client,
        &query.as_ref(),
        &key.as_ref(),
        &value.as_ref(),
        &out.as_ref(),
        &global_types,
        options,
    ))?;
    Some(HostData::from_tensor_handle(client, &out, HostDataType::F32))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn run_forward_quantized(
    client: &ComputeClient<TestRuntime>,
    query: &TensorHandle<TestRuntime>,
    key: &TensorHandle<TestRuntime>,
    value: &TensorHandle<TestRuntime>,
    scale_query: &TensorHandle<TestRuntime>,
    scale_key: &TensorHandle<TestRuntime>,
    options: AttentionOptions,
) -> Option<HostData> {
    let out = launched(attention_forward_quantized(
        client,
        query,
        key,
        value,
        scale_query,
        scale_key,
        options,
    ))?;
    Some(HostData::from_tensor_handle(client, &out, HostDataType::F32))
}

/// Largest error of outputs stored in `dtype`, relative to the largest output magnitude.
///
/// Covers rounding the output and, on the accelerated path, the probabilities to the
/// storage type.
pub(crate) fn attention_tolerance(dtype: StorageType) -> f32 {
    if dtype == half::bf16::as_type_native_unchecked() {
        1e-2
    } else {
        5e-3
    }
}

/// Runs the forward pass on random inputs and checks it against the CPU reference.
pub(crate) fn test_forward(problem: AttentionProblem, dtype: StorageType) {
    let client = client();

    let (query, query_data) = random_input(&client, &problem, AttentionIdent::Query, dtype, 12);
    let (key, key_data) = random_input(&client, &problem, AttentionIdent::Key, dtype, 34);
    let (value, value_data) = random_input(&client, &problem, AttentionIdent::Value, dtype, 56);

    let Some(actual) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    let expected = attention_cpu(
        &query_data.to_f32_vec(),
        &key_data.to_f32_vec(),
        &value_data.to_f32_vec(),
        &problem,
    );

    if let Err(e) = assert_relative_close(&actual, &expected, attention_tolerance(dtype)) {
        panic!("{}", e);
    }
}

/// Runs every kernel variant on the same inputs and checks each against the CPU
/// reference: scalar and accelerated tile products, then synchronous and asynchronous
/// K/V copies.
pub(crate) fn test_strategies_agree(problem: AttentionProblem, dtype: StorageType) {
    let client = client();

    let (query, query_data) = random_input(&client, &problem, AttentionIdent::Query, dtype, 78);
    let (key, key_data) = random_input(&client, &problem, AttentionIdent::Key, dtype, 79);
    let (value, value_data) = random_input(&client, &problem, AttentionIdent::Value, dtype, 80);

    let expected = attention_cpu(
        &query_data.to_f32_vec(),
        &key_data.to_f32_vec(),
        &value_data.to_f32_vec(),
        &problem,
    );

    let strategies = [
        Strategy::new(TileStrategy::Scalar, LoadingStrategy::Sync),
        Strategy::new(TileStrategy::Accelerated, LoadingStrategy::Sync),
        Strategy::new(TileStrategy::Scalar, LoadingStrategy::Async),
        Strategy::new(TileStrategy::Accelerated, LoadingStrategy::Async),
    ];
    for strategy in strategies {
        let Some(actual) =
            run_forward_with(strategy, &client, &query, &key, &value, problem.options)
        else {
            continue;
        };
        if let Err(e) = assert_relative_close(&actual, &expected, attention_tolerance(dtype)) {
            panic!("{strategy:?}: {e}");
        }
    }
}

#[test]
fn tolerance_rejects_broken_outputs() {
    let bf16 = half::bf16::as_type_native_unchecked();
    let ragged = problem(1, 1, 1, 64, 200, 128, false);
    let noise = |len: usize, seed: u64| -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
                cubek_test_utils::round_to(unit * 2.0 - 1.0, bf16)
            })
            .collect()
    };
    let query = noise(64 * 128, 1);
    let key = noise(200 * 128, 2);
    let value = noise(200 * 128, 3);
    let expected = attention_cpu(&query, &key, &value, &ragged);
    let with_values = |values: Vec<f32>| HostData {
        data: HostDataVec::F32(values),
        ..expected.clone()
    };

    // Storage rounding alone stays within the bound
    let rounded = expected
        .to_f32_vec()
        .iter()
        .map(|v| cubek_test_utils::round_to(*v, bf16))
        .collect();
    assert!(
        assert_relative_close(&with_values(rounded), &expected, attention_tolerance(bf16))
            .is_ok()
    );

    let zeros = with_values(vec![0.0; 64 * 128]);
    assert!(assert_relative_close(&zeros, &expected, attention_tolerance(bf16)).is_err());

    // Keys 200..256 zero-filled but left unmasked
    let padded = problem(1, 1, 1, 64, 256, 128, false);
    let pad = |values: &[f32]| -> Vec<f32> {
        let mut padded = values.to_vec();
        padded.resize(256 * 128, 0.0);
        padded
    };
    let unmasked = attention_cpu(&query, &pad(&key), &pad(&value), &padded);
    assert!(assert_relative_close(&unmasked, &expected, attention_tolerance(bf16)).is_err());
}
