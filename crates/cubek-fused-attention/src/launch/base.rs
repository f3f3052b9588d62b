use cubecl::features::{MmaConfig, TypeUsage};
use cubecl::ir::{BarrierLevel, ElemType, FloatKind, IntKind, OpaqueType, StorageType};
use cubecl::prelude::*;
use cubecl::server::LaunchError;
use cubecl::{CubeCount, CubeDim, Runtime, client::ComputeClient, std::tensor::TensorHandle};
use serde::{Deserialize, Serialize};

use crate::{
    definition::{
        AttentionGlobalTypes, AttentionIdent, AttentionOptions, AttentionProblem,
        AttentionSetupError, TileGeometry,
    },
    kernels::forward::{
        AsyncKvLoader, CMMA_TILE, CmmaTileMatmul, ForwardKernelConfig, KvLoader,
        ScalarTileMatmul, SyncKvLoader, TileMatmul, fused_attention_forward,
        fused_attention_forward_quantized,
    },
    launch::layout::{contiguous_copy, is_contiguous},
};

const F16: StorageType = StorageType::Scalar(ElemType::Float(FloatKind::F16));
const BF16: StorageType = StorageType::Scalar(ElemType::Float(FloatKind::BF16));
const F32: StorageType = StorageType::Scalar(ElemType::Float(FloatKind::F32));
const I8: StorageType = StorageType::Scalar(ElemType::Int(IntKind::I8));
const E4M3: StorageType = StorageType::Scalar(ElemType::Float(FloatKind::E4M3));

/// Kernel variant to launch.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub tiles: TileStrategy,
    pub loading: LoadingStrategy,
}

impl Strategy {
    pub fn new(tiles: TileStrategy, loading: LoadingStrategy) -> Self {
        Self { tiles, loading }
    }
}

/// How the two tile products of every K/V tile are computed.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileStrategy {
    /// Accelerated when the device can run it, scalar otherwise
    #[default]
    Auto,
    /// One query row per unit with f32 multiply-adds
    Scalar,
    /// 16x16x16 cmma fragments with an f32 accumulator.
    ///
    /// Fails with [AttentionSetupError::CmmaUnavailable] instead of falling back.
    Accelerated,
}

/// How producer units copy K/V tiles into shared memory.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingStrategy {
    /// Asynchronous when the device has unit barriers, synchronous otherwise
    #[default]
    Auto,
    /// Element-wise copies through registers
    Sync,
    /// `memcpy_async` on a per-unit barrier.
    ///
    /// Fails with [AttentionSetupError::AsyncCopyUnavailable] instead of falling back.
    Async,
}

/// Quantization scales handed to the quantized forward pass.
pub struct AttentionScales<'a, R: Runtime> {
    /// `(batch, qo_heads)` factors of Q
    pub query: &'a TensorHandleRef<'a, R>,
    /// `(batch, kv_heads)` factors of K
    pub key: &'a TensorHandleRef<'a, R>,
    pub query_dtype: StorageType,
    pub key_dtype: StorageType,
}

/// Scaled dot-product attention forward pass.
///
/// Accepts inputs of any layout, allocates the output with the dtype of `value` and
/// returns it.
///
/// # Arguments
/// * `client` - Compute client
/// * `query` - Query tensor `[batch, qo_heads, seq_q, head_dim]`
/// * `key` - Key tensor `[batch, kv_heads, seq_kv, head_dim]`
/// * `value` - Value tensor `[batch, kv_heads, seq_kv, head_dim]`
/// * `options` - Attention options
#[allow(clippy::result_large_err)]
pub fn attention_forward<R: Runtime>(
    client: &ComputeClient<R>,
    query: &TensorHandle<R>,
    key: &TensorHandle<R>,
    value: &TensorHandle<R>,
    options: AttentionOptions,
) -> Result<TensorHandle<R>, AttentionSetupError> {
    let problem = AttentionProblem::from_shapes(&query.shape, &key.shape, &value.shape, options)?;
    let global_types = AttentionGlobalTypes {
        query: query.dtype,
        key: key.dtype,
        value: value.dtype,
        out: value.dtype,
    };
    global_types.validate(false)?;

    let query_copy = contiguous_copy(client, &query.as_ref(), query.dtype)?;
    let key_copy = contiguous_copy(client, &key.as_ref(), key.dtype)?;
    let value_copy = contiguous_copy(client, &value.as_ref(), value.dtype)?;

    let out = TensorHandle::empty(client, problem.shape(AttentionIdent::Out), value.dtype);

    launch_ref(
        Strategy::default(),
        client,
        &query_copy.as_ref().unwrap_or(query).as_ref(),
        &key_copy.as_ref().unwrap_or(key).as_ref(),
        &value_copy.as_ref().unwrap_or(value).as_ref(),
        &out.as_ref(),
        &global_types,
        options,
    )?;

    Ok(out)
}

/// Attention forward pass over 8-bit Q and K.
///
/// Q and K share one [QuantizationFormat](crate::definition::QuantizationFormat), either
/// i8 or e4m3. `scale_query` is `(batch, qo_heads)` and `scale_key` is
/// `(batch, kv_heads)`, both f32, such that `query ≈ query_q * scale_query` per head,
/// likewise for keys.
#[allow(clippy::result_large_err, clippy::too_many_arguments)]
pub fn attention_forward_quantized<R: Runtime>(
    client: &ComputeClient<R>,
    query: &TensorHandle<R>,
    key: &TensorHandle<R>,
    value: &TensorHandle<R>,
    scale_query: &TensorHandle<R>,
    scale_key: &TensorHandle<R>,
    options: AttentionOptions,
) -> Result<TensorHandle<R>, AttentionSetupError> {
    let problem = AttentionProblem::from_shapes(&query.shape, &key.shape, &value.shape, options)?;
    problem.validate_scales(&scale_query.shape, &scale_key.shape)?;
    for (name, scale) in [("Q", scale_query), ("K", scale_key)] {
        if scale.dtype != F32 {
            return Err(AttentionSetupError::invalid(format!(
                "{name} scale tensor must be of type float32"
            )));
        }
    }

    let global_types = AttentionGlobalTypes {
        query: query.dtype,
        key: key.dtype,
        value: value.dtype,
        out: value.dtype,
    };
    global_types.validate(true)?;

    let query_copy = contiguous_copy(client, &query.as_ref(), query.dtype)?;
    let key_copy = contiguous_copy(client, &key.as_ref(), key.dtype)?;
    let value_copy = contiguous_copy(client, &value.as_ref(), value.dtype)?;
    let scale_query_copy = contiguous_copy(client, &scale_query.as_ref(), F32)?;
    let scale_key_copy = contiguous_copy(client, &scale_key.as_ref(), F32)?;

    let out = TensorHandle::empty(client, problem.shape(AttentionIdent::Out), value.dtype);

    launch_quantized_ref(
        Strategy::default(),
        client,
        &query_copy.as_ref().unwrap_or(query).as_ref(),
        &key_copy.as_ref().unwrap_or(key).as_ref(),
        &value_copy.as_ref().unwrap_or(value).as_ref(),
        AttentionScales {
            query: &scale_query_copy.as_ref().unwrap_or(scale_query).as_ref(),
            key: &scale_key_copy.as_ref().unwrap_or(scale_key).as_ref(),
            query_dtype: scale_query.dtype,
            key_dtype: scale_key.dtype,
        },
        &out.as_ref(),
        &global_types,
        options,
    )?;

    Ok(out)
}

/// Launches the forward pass into a caller-provided output.
///
/// All tensors must be contiguous.
#[allow(clippy::result_large_err, clippy::too_many_arguments)]
pub fn launch_ref<R: Runtime>(
    strategy: Strategy,
    client: &ComputeClient<R>,
    query: &TensorHandleRef<R>,
    key: &TensorHandleRef<R>,
    value: &TensorHandleRef<R>,
    out: &TensorHandleRef<R>,
    global_types: &AttentionGlobalTypes,
    options: AttentionOptions,
) -> Result<(), AttentionSetupError> {
    let problem = AttentionProblem::from_shapes(query.shape, key.shape, value.shape, options)?;
    global_types.validate(false)?;
    check_layouts(&problem, &[query, key, value], out)?;

    let geometry = problem.geometry()?;
    let plan = LaunchPlan::new(client, &problem, geometry, global_types, strategy)?;

    let args = ForwardArgs {
        query,
        key,
        value,
        out,
    };
    let result = match (plan.accelerated, plan.config.async_loads) {
        (true, true) => dispatch_forward::<R, CmmaTileMatmul, AsyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (true, false) => dispatch_forward::<R, CmmaTileMatmul, SyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (false, true) => dispatch_forward::<R, ScalarTileMatmul, AsyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (false, false) => dispatch_forward::<R, ScalarTileMatmul, SyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
    }?;

    result.map_err(AttentionSetupError::Execution)
}

/// Launches the quantized forward pass into a caller-provided output.
///
/// All tensors must be contiguous.
#[allow(clippy::result_large_err, clippy::too_many_arguments)]
pub fn launch_quantized_ref<R: Runtime>(
    strategy: Strategy,
    client: &ComputeClient<R>,
    query: &TensorHandleRef<R>,
    key: &TensorHandleRef<R>,
    value: &TensorHandleRef<R>,
    scales: AttentionScales<'_, R>,
    out: &TensorHandleRef<R>,
    global_types: &AttentionGlobalTypes,
    options: AttentionOptions,
) -> Result<(), AttentionSetupError> {
    let problem = AttentionProblem::from_shapes(query.shape, key.shape, value.shape, options)?;
    problem.validate_scales(scales.query.shape, scales.key.shape)?;
    for (name, dtype) in [("Q", scales.query_dtype), ("K", scales.key_dtype)] {
        if dtype != F32 {
            return Err(AttentionSetupError::invalid(format!(
                "{name} scale tensor must be of type float32"
            )));
        }
    }
    global_types.validate(true)?;
    check_layouts(&problem, &[query, key, value, scales.query, scales.key], out)?;
    ensure_dtype_available(client, global_types.query)?;

    let geometry = problem.geometry()?;
    let plan = LaunchPlan::new(client, &problem, geometry, global_types, strategy)?;

    let args = QuantizedArgs {
        query,
        key,
        value,
        scales: &scales,
        out,
    };
    let result = match (plan.accelerated, plan.config.async_loads) {
        (true, true) => dispatch_quantized::<R, CmmaTileMatmul, AsyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (true, false) => dispatch_quantized::<R, CmmaTileMatmul, SyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (false, true) => dispatch_quantized::<R, ScalarTileMatmul, AsyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
        (false, false) => dispatch_quantized::<R, ScalarTileMatmul, SyncKvLoader>(
            client,
            global_types,
            &args,
            &plan,
        ),
    }?;

    result.map_err(AttentionSetupError::Execution)
}

/// Fails with [AttentionSetupError::DtypeUnavailable] unless the device can at least
/// convert to and from `dtype`.
#[allow(clippy::result_large_err)]
pub(crate) fn ensure_dtype_available<R: Runtime>(
    client: &ComputeClient<R>,
    dtype: StorageType,
) -> Result<(), AttentionSetupError> {
    if client
        .properties()
        .features
        .type_usage(dtype)
        .contains(TypeUsage::Conversion)
    {
        Ok(())
    } else {
        Err(AttentionSetupError::DtypeUnavailable(dtype))
    }
}

fn check_layouts<R: Runtime>(
    problem: &AttentionProblem,
    inputs: &[&TensorHandleRef<R>],
    out: &TensorHandleRef<R>,
) -> Result<(), AttentionSetupError> {
    if out.shape != problem.shape(AttentionIdent::Out).as_slice() {
        return Err(AttentionSetupError::invalid(
            "Output shape must match the Q tensor shape",
        ));
    }

    for tensor in inputs.iter().chain([&out]) {
        if !is_contiguous(tensor.shape, tensor.strides) {
            return Err(AttentionSetupError::invalid(
                "Tensors handed to the kernel must be contiguous",
            ));
        }
    }

    Ok(())
}

/// Everything a launch needs beyond the tensors themselves.
struct LaunchPlan {
    cube_count: (u32, u32, u32),
    cube_dim: u32,
    score_scale: f32,
    seq_q: u32,
    seq_kv: u32,
    qo_heads: u32,
    kv_heads: u32,
    /// Whether the tile products run on cmma fragments
    accelerated: bool,
    config: ForwardKernelConfig,
}

impl LaunchPlan {
    fn new<R: Runtime>(
        client: &ComputeClient<R>,
        problem: &AttentionProblem,
        geometry: TileGeometry,
        global_types: &AttentionGlobalTypes,
        strategy: Strategy,
    ) -> Result<Self, AttentionSetupError> {
        let hardware = &client.properties().hardware;

        let storage_size = global_types.value.size();
        let mut required = geometry.shared_memory_bytes(global_types.key.size(), storage_size);
        let available = hardware.max_shared_memory_size;
        if required > available {
            tracing::warn!(
                head_dim = geometry.head_dim,
                required,
                available,
                "fused attention needs more shared memory than the device offers"
            );
            return Err(AttentionSetupError::SharedMemoryExceeded {
                required,
                available,
            });
        }

        let units = geometry.units_per_cube();
        if units > hardware.max_units_per_cube {
            tracing::warn!(
                units,
                available = hardware.max_units_per_cube,
                "fused attention needs more units per cube than the device offers"
            );
            return Err(AttentionSetupError::CubeDimExceeded {
                required: units,
                available: hardware.max_units_per_cube,
            });
        }

        let cube_count = (
            geometry.num_query_blocks(problem.seq_q),
            problem.qo_heads as u32,
            problem.batch as u32,
        );
        let (max_x, max_y, max_z) = hardware.max_cube_count;
        if cube_count.0 > max_x || cube_count.1 > max_y || cube_count.2 > max_z {
            return Err(AttentionSetupError::invalid(format!(
                "Grid {cube_count:?} exceeds the device limit {:?}",
                hardware.max_cube_count
            )));
        }

        let plane_dim = hardware.plane_size_max;
        let accelerated = match (strategy.tiles, cmma_rejection(client, geometry, global_types)) {
            (TileStrategy::Scalar, _) => false,
            (TileStrategy::Auto | TileStrategy::Accelerated, None) => true,
            (TileStrategy::Auto, Some(reason)) => {
                tracing::debug!(%reason, "using scalar tile products");
                false
            }
            (TileStrategy::Accelerated, Some(reason)) => {
                return Err(AttentionSetupError::CmmaUnavailable(reason));
            }
        };

        let unit_barriers = client
            .properties()
            .features
            .supports_type(OpaqueType::Barrier(BarrierLevel::Unit));
        let async_loads = match strategy.loading {
            LoadingStrategy::Sync => false,
            LoadingStrategy::Auto => unit_barriers,
            LoadingStrategy::Async if unit_barriers => true,
            LoadingStrategy::Async => return Err(AttentionSetupError::AsyncCopyUnavailable),
        };
        if accelerated {
            required += geometry.cmma_scratch_bytes(plane_dim, storage_size);
        }

        let config =
            ForwardKernelConfig::new(geometry, problem.options.causal, plane_dim, async_loads);

        tracing::debug!(
            ?geometry,
            causal = config.causal,
            accelerated,
            async_loads,
            ?cube_count,
            cube_dim = units,
            kv_tiles = geometry.num_kv_tiles(problem.seq_kv),
            shared_memory = required,
            "launching fused attention forward"
        );

        Ok(Self {
            cube_count,
            cube_dim: units,
            score_scale: geometry.log2_softmax_scale(),
            seq_q: problem.seq_q as u32,
            seq_kv: problem.seq_kv as u32,
            qo_heads: problem.qo_heads as u32,
            kv_heads: problem.kv_heads as u32,
            accelerated,
            config,
        })
    }

    fn cube_count(&self) -> CubeCount {
        let (x, y, z) = self.cube_count;
        CubeCount::Static(x, y, z)
    }

    fn cube_dim(&self) -> CubeDim {
        CubeDim::new_1d(self.cube_dim)
    }
}

/// Why the cmma tile products cannot run on this device, if they can't.
///
/// Consumer and producer groups must both split into whole planes of a fixed width that
/// covers 16 query rows at a time, and the per-plane scratch must fit next to the tiles.
fn cmma_rejection<R: Runtime>(
    client: &ComputeClient<R>,
    geometry: TileGeometry,
    global_types: &AttentionGlobalTypes,
) -> Option<String> {
    let properties = client.properties();
    let hardware = &properties.hardware;
    let value = global_types.value;

    let config = MmaConfig {
        a_type: value,
        b_type: value,
        cd_type: F32,
        m: CMMA_TILE,
        n: CMMA_TILE,
        k: CMMA_TILE,
    };
    if !properties.features.cmma.contains(&config) {
        return Some(format!("no {value:?} 16x16x16 cmma with an f32 accumulator"));
    }

    let plane_dim = hardware.plane_size_max;
    if hardware.plane_size_min != plane_dim {
        return Some(format!(
            "plane width varies between {} and {plane_dim}",
            hardware.plane_size_min
        ));
    }
    if plane_dim % CMMA_TILE != 0
        || geometry.consumer_units() % plane_dim != 0
        || geometry.producer_units() % plane_dim != 0
    {
        return Some(format!("plane width {plane_dim} does not tile the cube"));
    }

    let required = geometry.shared_memory_bytes(global_types.key.size(), value.size())
        + geometry.cmma_scratch_bytes(plane_dim, value.size());
    if required > hardware.max_shared_memory_size {
        return Some(format!(
            "scratch needs {required} bytes of shared memory, device offers {}",
            hardware.max_shared_memory_size
        ));
    }

    None
}

struct ForwardArgs<'a, 'b, R: Runtime> {
    query: &'a TensorHandleRef<'b, R>,
    key: &'a TensorHandleRef<'b, R>,
    value: &'a TensorHandleRef<'b, R>,
    out: &'a TensorHandleRef<'b, R>,
}

struct QuantizedArgs<'a, 'b, R: Runtime> {
    query: &'a TensorHandleRef<'b, R>,
    key: &'a TensorHandleRef<'b, R>,
    value: &'a TensorHandleRef<'b, R>,
    scales: &'a AttentionScales<'b, R>,
    out: &'a TensorHandleRef<'b, R>,
}

#[allow(clippy::result_large_err)]
fn dispatch_forward<
    R: Runtime,
    TM: TileMatmul<half::f16> + TileMatmul<half::bf16>,
    L: KvLoader,
>(
    client: &ComputeClient<R>,
    global_types: &AttentionGlobalTypes,
    args: &ForwardArgs<'_, '_, R>,
    plan: &LaunchPlan,
) -> Result<Result<(), LaunchError>, AttentionSetupError> {
    Ok(match global_types.value {
        F16 => launch_forward::<R, half::f16, TM, L>(client, args, plan),
        BF16 => launch_forward::<R, half::bf16, TM, L>(client, args, plan),
        other => return Err(AttentionSetupError::UnsupportedDtype(other)),
    })
}

#[allow(clippy::result_large_err)]
fn dispatch_quantized<
    R: Runtime,
    TM: TileMatmul<half::f16> + TileMatmul<half::bf16>,
    L: KvLoader,
>(
    client: &ComputeClient<R>,
    global_types: &AttentionGlobalTypes,
    args: &QuantizedArgs<'_, '_, R>,
    plan: &LaunchPlan,
) -> Result<Result<(), LaunchError>, AttentionSetupError> {
    Ok(match (global_types.value, global_types.query) {
        (F16, I8) => launch_forward_quantized::<R, half::f16, i8, TM, L>(client, args, plan),
        (BF16, I8) => launch_forward_quantized::<R, half::bf16, i8, TM, L>(client, args, plan),
        (F16, E4M3) => {
            launch_forward_quantized::<R, half::f16, cubecl::e4m3, TM, L>(client, args, plan)
        }
        (BF16, E4M3) => {
            launch_forward_quantized::<R, half::bf16, cubecl::e4m3, TM, L>(client, args, plan)
        }
        (F16 | BF16, other) | (other, _) => {
            return Err(AttentionSetupError::UnsupportedDtype(other));
        }
    })
}

fn launch_forward<R: Runtime, F: Float, TM: TileMatmul<F>, L: KvLoader>(
    client: &ComputeClient<R>,
    args: &ForwardArgs<'_, '_, R>,
    plan: &LaunchPlan,
) -> Result<(), LaunchError> {
    unsafe {
        fused_attention_forward::launch_unchecked::<F, TM, L, R>(
            client,
            plan.cube_count(),
            plan.cube_dim(),
            args.query.as_tensor_arg(1),
            args.key.as_tensor_arg(1),
            args.value.as_tensor_arg(1),
            args.out.as_tensor_arg(1),
            ScalarArg::new(plan.score_scale),
            ScalarArg::new(plan.seq_q),
            ScalarArg::new(plan.seq_kv),
            ScalarArg::new(plan.qo_heads),
            ScalarArg::new(plan.kv_heads),
            plan.config,
        )
    }
}

fn launch_forward_quantized<
    R: Runtime,
    F: Float,
    QK: CubePrimitive,
    TM: TileMatmul<F>,
    L: KvLoader,
>(
    client: &ComputeClient<R>,
    args: &QuantizedArgs<'_, '_, R>,
    plan: &LaunchPlan,
) -> Result<(), LaunchError> {
    unsafe {
        fused_attention_forward_quantized::launch_unchecked::<F, QK, TM, L, R>(
            client,
            plan.cube_count(),
            plan.cube_dim(),
            args.query.as_tensor_arg(1),
            args.key.as_tensor_arg(1),
            args.value.as_tensor_arg(1),
            args.scales.query.as_tensor_arg(1),
            args.scales.key.as_tensor_arg(1),
            args.out.as_tensor_arg(1),
            ScalarArg::new(plan.score_scale),
            ScalarArg::new(plan.seq_q),
            ScalarArg::new(plan.seq_kv),
            ScalarArg::new(plan.qo_heads),
            ScalarArg::new(plan.kv_heads),
            plan.config,
        )
    }
}
