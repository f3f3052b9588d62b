//! Output properties that hold exactly or near exactly, whatever the inputs.

use cubecl::{TestRuntime, client::ComputeClient, frontend::CubePrimitive, ir::StorageType};
use cubek_fused_attention::definition::{
    AttentionIdent, AttentionOptions, AttentionProblem, AttentionSetupError,
};
use cubek_fused_attention::launch::attention_forward;
use cubek_test_utils::{HostData, StrideSpec, TestInput};

use crate::suite::launcher::{client, problem, random_input, run_forward};

fn f16() -> StorageType {
    half::f16::as_type_native_unchecked()
}

fn upload(
    client: &ComputeClient<TestRuntime>,
    shape: Vec<usize>,
    values: Vec<f32>,
) -> (cubecl::std::tensor::TensorHandle<TestRuntime>, HostData) {
    TestInput::from_values(client.clone(), shape, f16(), values, StrideSpec::RowMajor)
        .generate_with_f32_host_data()
}

/// Output rows `range` of `head`, batch 0.
fn rows(
    data: &HostData,
    problem: &AttentionProblem,
    head: usize,
    range: core::ops::Range<usize>,
) -> Vec<f32> {
    let values = data.to_f32_vec();
    let head_offset = head * problem.seq_q * problem.head_dim;
    let start = head_offset + range.start * problem.head_dim;
    let end = head_offset + range.end * problem.head_dim;
    values[start..end].to_vec()
}

#[test]
fn causal_rows_ignore_later_keys() {
    let client = client();
    let problem = problem(1, 1, 1, 256, 256, 64, true);

    let (query, _) = random_input(&client, &problem, AttentionIdent::Query, f16(), 1);
    let (key, key_data) = random_input(&client, &problem, AttentionIdent::Key, f16(), 2);
    let (value, value_data) = random_input(&client, &problem, AttentionIdent::Value, f16(), 3);

    let Some(baseline) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    // Scramble every key/value row from 128 on
    let scramble = |data: &HostData| -> Vec<f32> {
        let mut values = data.to_f32_vec();
        for (i, v) in values.iter_mut().enumerate().skip(128 * 64) {
            *v = ((i * 7919) % 200) as f32 / 100.0 - 1.0;
        }
        values
    };
    let (key, _) = upload(&client, problem.shape(AttentionIdent::Key), scramble(&key_data));
    let (value, _) = upload(&client, problem.shape(AttentionIdent::Value), scramble(&value_data));

    let Some(scrambled) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    assert_eq!(
        rows(&baseline, &problem, 0, 0..128),
        rows(&scrambled, &problem, 0, 0..128)
    );
}

#[test]
fn first_causal_row_copies_first_value() {
    let client = client();
    let problem = problem(1, 2, 1, 64, 256, 128, true);

    let (query, _) = random_input(&client, &problem, AttentionIdent::Query, f16(), 4);
    let (key, _) = random_input(&client, &problem, AttentionIdent::Key, f16(), 5);
    let (value, value_data) = random_input(&client, &problem, AttentionIdent::Value, f16(), 6);

    let Some(out) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    let first_value = value_data.to_f32_vec()[..128].to_vec();
    for head in 0..2 {
        assert_eq!(rows(&out, &problem, head, 0..1), first_value);
    }
}

#[test]
fn one_hot_causal_first_row_is_first_value() {
    let client = client();
    let problem = problem(1, 1, 1, 256, 256, 64, true);
    let shape = problem.shape(AttentionIdent::Query);

    // Row i is the unit vector along i % 64
    let one_hot: Vec<f32> = (0..256 * 64)
        .map(|i| if (i / 64) % 64 == i % 64 { 1.0 } else { 0.0 })
        .collect();
    let (query, _) = upload(&client, shape.clone(), one_hot.clone());
    let (key, _) = upload(&client, shape.clone(), one_hot.clone());
    let (value, value_data) = upload(&client, shape, one_hot);

    let Some(out) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    assert_eq!(
        rows(&out, &problem, 0, 0..1),
        value_data.to_f32_vec()[..64].to_vec()
    );
}

#[test]
fn constant_values_pass_through() {
    let client = client();
    let problem = problem(1, 2, 2, 200, 300, 64, false);

    let (query, _) = random_input(&client, &problem, AttentionIdent::Query, f16(), 7);
    let (key, _) = random_input(&client, &problem, AttentionIdent::Key, f16(), 8);
    let value_shape = problem.shape(AttentionIdent::Value);
    let ones = vec![1.0; value_shape.iter().product()];
    let (value, _) = upload(&client, value_shape, ones);

    let Some(out) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    // Normalized weights sum to one
    for v in out.to_f32_vec() {
        assert!((v - 1.0).abs() < 2e-3, "Expected 1, got {v}");
    }
}

#[test]
fn grouped_heads_match_repeated_heads() {
    let client = client();
    let grouped = problem(1, 4, 2, 128, 160, 64, true);
    let repeated = problem(1, 4, 4, 128, 160, 64, true);

    let (query, _) = random_input(&client, &grouped, AttentionIdent::Query, f16(), 9);
    let (key, key_data) = random_input(&client, &grouped, AttentionIdent::Key, f16(), 10);
    let (value, value_data) = random_input(&client, &grouped, AttentionIdent::Value, f16(), 11);

    let Some(grouped_out) = run_forward(&client, &query, &key, &value, grouped.options) else {
        return;
    };

    let head_elems = 160 * 64;
    let repeat = |data: &HostData| -> Vec<f32> {
        data.to_f32_vec()
            .chunks(head_elems)
            .flat_map(|head| head.iter().chain(head.iter()).cloned().collect::<Vec<_>>())
            .collect()
    };
    let (key, _) = upload(&client, repeated.shape(AttentionIdent::Key), repeat(&key_data));
    let (value, _) = upload(&client, repeated.shape(AttentionIdent::Value), repeat(&value_data));

    let Some(repeated_out) = run_forward(&client, &query, &key, &value, repeated.options) else {
        return;
    };

    assert_eq!(grouped_out.to_f32_vec(), repeated_out.to_f32_vec());
}

#[test]
fn ragged_queries_match_longer_sequence() {
    let client = client();
    let short = problem(1, 1, 1, 100, 256, 128, false);
    let long = problem(1, 1, 1, 192, 256, 128, false);

    let (query_long, query_data) = random_input(&client, &long, AttentionIdent::Query, f16(), 12);
    let (key, _) = random_input(&client, &long, AttentionIdent::Key, f16(), 13);
    let (value, _) = random_input(&client, &long, AttentionIdent::Value, f16(), 14);

    let truncated = query_data.to_f32_vec()[..100 * 128].to_vec();
    let (query_short, _) = upload(&client, short.shape(AttentionIdent::Query), truncated);

    let Some(long_out) = run_forward(&client, &query_long, &key, &value, long.options) else {
        return;
    };
    let Some(short_out) = run_forward(&client, &query_short, &key, &value, short.options) else {
        return;
    };

    assert_eq!(rows(&long_out, &long, 0, 0..100), short_out.to_f32_vec());
}

#[test]
fn power_of_two_rescaling_cancels() {
    let client = client();
    let problem = problem(1, 1, 1, 64, 128, 256, false);

    let (query, query_data) = random_input(&client, &problem, AttentionIdent::Query, f16(), 15);
    let (_, key_data) = random_input(&client, &problem, AttentionIdent::Key, f16(), 16);
    let (value, _) = random_input(&client, &problem, AttentionIdent::Value, f16(), 17);

    // Halving must stay exact, so keep keys away from the subnormal range
    let keys: Vec<f32> = key_data
        .to_f32_vec()
        .iter()
        .map(|v| if v.abs() < 1e-3 { 0.0 } else { *v })
        .collect();
    let halved: Vec<f32> = keys.iter().map(|v| v * 0.5).collect();
    let doubled: Vec<f32> = query_data.to_f32_vec().iter().map(|v| v * 2.0).collect();

    let (key, _) = upload(&client, problem.shape(AttentionIdent::Key), keys);
    let Some(baseline) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    let (query, _) = upload(&client, problem.shape(AttentionIdent::Query), doubled);
    let (key, _) = upload(&client, problem.shape(AttentionIdent::Key), halved);

    let Some(rescaled) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };

    assert_eq!(baseline.to_f32_vec(), rescaled.to_f32_vec());
}

#[test]
fn strided_inputs_are_normalized() {
    let client = client();
    let problem = problem(1, 4, 2, 96, 96, 64, true);
    let shape = problem.shape(AttentionIdent::Query);

    let (query, query_data) = random_input(&client, &problem, AttentionIdent::Query, f16(), 18);
    let (key, _) = random_input(&client, &problem, AttentionIdent::Key, f16(), 19);
    let (value, _) = random_input(&client, &problem, AttentionIdent::Value, f16(), 20);

    // Same logical tensor, stored as (batch, seq, heads, dim)
    let (strided_query, _) = TestInput::from_values(
        client.clone(),
        shape,
        f16(),
        query_data.to_f32_vec(),
        StrideSpec::Permuted(vec![0, 2, 1, 3]),
    )
    .generate_with_f32_host_data();

    let Some(contiguous) = run_forward(&client, &query, &key, &value, problem.options) else {
        return;
    };
    let Some(strided) = run_forward(&client, &strided_query, &key, &value, problem.options)
    else {
        return;
    };

    assert_eq!(contiguous.to_f32_vec(), strided.to_f32_vec());
}

#[test]
fn rejects_invalid_inputs() {
    let client = client();
    let problem = problem(1, 2, 2, 64, 64, 64, false);

    let (query, _) = random_input(&client, &problem, AttentionIdent::Query, f16(), 21);
    let (key, _) = random_input(&client, &problem, AttentionIdent::Key, f16(), 22);

    let mismatched = problem_with_head_dim(128);
    let (value, _) = random_input(&client, &mismatched, AttentionIdent::Value, f16(), 23);
    let err = attention_forward(&client, &query, &key, &value, AttentionOptions::default())
        .err()
        .expect("Head dimension mismatch should be rejected");
    assert!(matches!(err, AttentionSetupError::InvalidInput(_)));

    let f32_dtype = f32::as_type_native_unchecked();
    let (value, _) = random_input(&client, &problem, AttentionIdent::Value, f32_dtype, 24);
    let err = attention_forward(&client, &query, &key, &value, AttentionOptions::default())
        .err()
        .expect("f32 values should be rejected");
    assert!(matches!(err, AttentionSetupError::UnsupportedDtype(_)));
}

fn problem_with_head_dim(head_dim: usize) -> AttentionProblem {
    problem(1, 2, 2, 64, 64, head_dim, false)
}
