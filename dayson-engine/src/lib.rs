use dayson_core::{Result, Tensor};

mod host;
pub use host::HostMathEngine;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use cuda::{CudaMathEngine, KernelArg};

#[cfg(feature = "cuda")]
pub use cuda::sync::{SyncGuard, DEFAULT_EVENT_TIMEOUT};

/// Placeholder for builds without the device backend; never constructed, but
/// keeps `MathEngine::sync_guard` expressible on the host-only build.
#[cfg(not(feature = "cuda"))]
pub struct SyncGuard {
    _private: (),
}

#[cfg(not(feature = "cuda"))]
impl SyncGuard {
    pub fn synchronize_before_read(&self, _label: &str) -> Result<()> {
        Ok(())
    }

    pub fn synchronize_before_dispose(&self, _label: &str, _bytes: usize) {}
}

/// The operation catalog shared by the host and device backends.
///
/// Shapes follow the row-major conventions of the callers: matmul variants
/// are annotated with the transpose they apply, element-wise operations
/// require equal shapes, and the fused `add_scaled`/`sub_scaled` updates
/// require equal lengths (they are used across rank boundaries, e.g. a
/// `[1,C]` delta into a `[C]` bias).
///
/// Numeric guarantees: `sigmoid`/`tanh` saturate their inputs (±88 / ±20),
/// map non-finite inputs to the neutral element and clamp outputs to the
/// valid range; `softmax` is shifted by the row maximum and emits a uniform
/// row when the denominator underflows; `adam_update` sanitizes the moment
/// buffers and clips the per-parameter step to ±0.1. No operation lets a
/// NaN or Inf escape.
pub trait MathEngine: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn create(&self, shape: &[usize]) -> Result<Tensor>;
    /// Rejects non-finite host data.
    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor>;
    fn duplicate(&self, t: &Tensor) -> Result<Tensor>;
    /// Host copy of the buffer. The device backend synchronizes the command
    /// stream before the copy.
    fn read_back(&self, t: &Tensor) -> Result<Vec<f32>>;

    /// `C[M,P] = A[M,N] x B[N,P]`
    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `C[M,P] = A[K,M]^T x B[K,P]`
    fn matmul_at(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `C[M,P] = A[M,K] x B[P,K]^T`
    fn matmul_bt(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `M[r,c] += bias[c]` in place.
    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()>;
    /// `dst += s * src` in place, matched by length.
    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()>;
    /// `dst -= s * src` in place, matched by length.
    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()>;

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `y * (1 - y)` from the activated value, clamped to [0, 0.25].
    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `1 - y^2` from the activated value, clamped to [0, 1].
    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()>;
    /// Row-wise, numerically stable softmax; outputs in [1e-10, 1].
    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    /// Per-row normalize + affine, in place on `x`.
    fn layer_norm(&self, x: &mut Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<()>;

    /// Copies row `index` of `table[V,E]` into `out[1,E]`.
    fn lookup(&self, table: &Tensor, index: usize, out: &mut Tensor) -> Result<()>;
    /// Scatter-add: `grad[index, :] += row`.
    fn accumulate_gradient(&self, grad: &mut Tensor, row: &Tensor, index: usize) -> Result<()>;
    fn one_hot(&self, indices: &[i32], classes: usize) -> Result<Tensor>;
    /// Copies row `row` of `src[R,C]` into `out[1,C]`.
    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()>;
    /// Copies `src[1,C]` into row `row` of `dst[R,C]`.
    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()>;

    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()>;
    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()>;
    /// NaN/Inf -> 0, then clamp to [-limit, limit], in place.
    fn sanitize_and_clip(&self, x: &mut Tensor, limit: f32) -> Result<()>;
    /// f64 for headroom across millions of elements.
    fn sum_of_squares(&self, x: &Tensor) -> Result<f64>;

    /// Fused Adam step; mutates `p`, `m` and `v` in place. `t` is the
    /// already-incremented timestep (>= 1).
    #[allow(clippy::too_many_arguments)]
    fn adam_update(
        &self,
        p: &mut Tensor,
        g: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        lr: f32,
        beta1: f32,
        beta2: f32,
        eps: f32,
        t: i32,
    ) -> Result<()>;

    /// Capability accessor: the device backend exposes its ordering guard,
    /// the host backend has nothing to synchronize.
    fn sync_guard(&self) -> Option<&SyncGuard>;
}
