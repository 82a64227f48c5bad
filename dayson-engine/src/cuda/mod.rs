mod kernels;
pub(crate) mod sync;

use crate::MathEngine;
use cudarc::driver::{CudaContext, CudaModule, CudaSlice, CudaStream, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions, Ptx};
use dayson_core::{CoreError, DeviceTensor, Result, Tensor};
use kernels::{CATALOG_FUNCS, CATALOG_SRC};
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync::SyncGuard;

const THREADS_PER_BLOCK: u32 = 256;
const MAX_REDUCTION_BLOCKS: u32 = 1024;
const PERIODIC_SYNC_INTERVAL: u64 = 100;

static PTX_CACHE: OnceCell<Ptx> = OnceCell::new();

fn catalog_ptx() -> Result<Ptx> {
    if let Some(ptx) = PTX_CACHE.get() {
        return Ok(ptx.clone());
    }
    let start = std::time::Instant::now();
    let opts = CompileOptions {
        use_fast_math: Some(true),
        ..Default::default()
    };
    let ptx = compile_ptx_with_opts(CATALOG_SRC, opts)?;
    info!(
        "compiled {} device kernels in {}ms",
        CATALOG_FUNCS.len(),
        start.elapsed().as_millis()
    );
    let _ = PTX_CACHE.set(ptx.clone());
    Ok(ptx)
}

/// Tagged kernel argument. Anything outside these categories is
/// unrepresentable, so a marshalling mismatch is a compile error rather
/// than a runtime one.
pub enum KernelArg<'a> {
    Buffer(&'a CudaSlice<f32>),
    IntBuffer(&'a CudaSlice<i32>),
    DoubleBuffer(&'a CudaSlice<f64>),
    Int32(i32),
    Float32(f32),
    SharedBytes(usize),
}

/// GPU implementation of the operation catalog over a single command
/// stream. All synchronization goes through the engine's `SyncGuard`.
pub struct CudaMathEngine {
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    module: Arc<CudaModule>,
    guard: SyncGuard,
    dispatches: AtomicU64,
}

impl CudaMathEngine {
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal)?;
        let name = ctx.name().unwrap_or_else(|_| "unknown".to_string());
        info!("device {ordinal}: {name}");
        let module = ctx.load_module(catalog_ptx()?)?;
        let stream = ctx.default_stream();
        let guard = SyncGuard::new(ctx.clone(), stream.clone());
        Ok(Self {
            _ctx: ctx,
            stream,
            module,
            guard,
            dispatches: AtomicU64::new(0),
        })
    }

    fn device<'a>(&self, t: &'a Tensor, what: &str) -> Result<&'a DeviceTensor> {
        t.as_device().map_err(|_| {
            CoreError::InvalidArgument(format!("{what}: expected a device tensor"))
        })
    }

    fn device_mut<'a>(&self, t: &'a mut Tensor, what: &str) -> Result<&'a mut DeviceTensor> {
        t.as_device_mut().map_err(|_| {
            CoreError::InvalidArgument(format!("{what}: expected a device tensor"))
        })
    }

    fn elems_cfg(&self, n: usize) -> LaunchConfig {
        let grid = ((n as u32).max(1) + THREADS_PER_BLOCK - 1) / THREADS_PER_BLOCK;
        LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (THREADS_PER_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        }
    }

    fn rows_cfg(&self, rows: usize, shared_bytes: u32) -> LaunchConfig {
        LaunchConfig {
            grid_dim: ((rows as u32).max(1), 1, 1),
            block_dim: (THREADS_PER_BLOCK, 1, 1),
            shared_mem_bytes: shared_bytes,
        }
    }

    fn dispatch(&self, name: &'static str, mut cfg: LaunchConfig, args: &[KernelArg]) -> Result<()> {
        let func = self.module.load_function(name).map_err(|e| {
            CoreError::DeviceFailure(format!("kernel {name} missing from catalog: {e}"))
        })?;
        for arg in args {
            if let KernelArg::SharedBytes(bytes) = arg {
                cfg.shared_mem_bytes += *bytes as u32;
            }
        }
        let mut builder = self.stream.launch_builder(&func);
        for arg in args {
            match arg {
                KernelArg::Buffer(s) => {
                    builder.arg(*s);
                }
                KernelArg::IntBuffer(s) => {
                    builder.arg(*s);
                }
                KernelArg::DoubleBuffer(s) => {
                    builder.arg(*s);
                }
                KernelArg::Int32(v) => {
                    builder.arg(v);
                }
                KernelArg::Float32(v) => {
                    builder.arg(v);
                }
                KernelArg::SharedBytes(_) => {}
            }
        }
        unsafe { builder.launch(cfg) }.map_err(|e| {
            CoreError::DeviceFailure(format!("kernel {name} ({} args) failed: {e}", args.len()))
        })?;
        self.note_dispatch()
    }

    // Bounds the unacknowledged command queue.
    fn note_dispatch(&self) -> Result<()> {
        let count = self.dispatches.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PERIODIC_SYNC_INTERVAL == 0 {
            debug!("periodic sync after {count} dispatches");
            self.guard.synchronize_before_read("periodic")?;
        }
        Ok(())
    }

    fn alloc(&self, len: usize) -> Result<CudaSlice<f32>> {
        self.stream.alloc_zeros::<f32>(len).map_err(|e| {
            CoreError::OutOfMemory(format!("device allocation of {len} elements: {e}"))
        })
    }

    fn check_same_shape(&self, a: &Tensor, b: &Tensor, op: &str) -> Result<()> {
        if a.shape() != b.shape() {
            return Err(CoreError::InvalidArgument(format!(
                "{op}: shape {:?} does not match {:?}",
                a.shape(),
                b.shape()
            )));
        }
        Ok(())
    }

    fn check_same_len(&self, a: &Tensor, b: &Tensor, op: &str) -> Result<()> {
        if a.len() != b.len() {
            return Err(CoreError::InvalidArgument(format!(
                "{op}: length {} does not match {}",
                a.len(),
                b.len()
            )));
        }
        Ok(())
    }

    fn elementwise(
        &self,
        name: &'static str,
        a: &Tensor,
        b: &Tensor,
        out: &mut Tensor,
    ) -> Result<()> {
        self.check_same_shape(a, b, name)?;
        self.check_same_shape(a, out, name)?;
        let n = a.len();
        let a = self.device(a, name)?;
        let b = self.device(b, name)?;
        let out = self.device_mut(out, name)?;
        self.dispatch(
            name,
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(a.buf()),
                KernelArg::Buffer(b.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn map_into(&self, name: &'static str, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.check_same_shape(x, out, name)?;
        let n = x.len();
        let x = self.device(x, name)?;
        let out = self.device_mut(out, name)?;
        self.dispatch(
            name,
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn matmul_variant(
        &self,
        name: &'static str,
        a: &Tensor,
        b: &Tensor,
        out: &mut Tensor,
        dims: (usize, usize, usize),
    ) -> Result<()> {
        let (d0, d1, d2) = dims;
        let n = out.len();
        let a = self.device(a, name)?;
        let b = self.device(b, name)?;
        let out = self.device_mut(out, name)?;
        self.dispatch(
            name,
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(a.buf()),
                KernelArg::Buffer(b.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(d0 as i32),
                KernelArg::Int32(d1 as i32),
                KernelArg::Int32(d2 as i32),
            ],
        )
    }
}

impl MathEngine for CudaMathEngine {
    fn backend_name(&self) -> &'static str {
        "cuda"
    }

    fn create(&self, shape: &[usize]) -> Result<Tensor> {
        let count = dayson_core::element_count(shape)?;
        let buf = self.alloc(count)?;
        Ok(Tensor::Device(DeviceTensor::new(
            shape,
            buf,
            self.stream.clone(),
        )?))
    }

    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor> {
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(CoreError::InvalidArgument(format!(
                "non-finite value {} at element {pos}",
                data[pos]
            )));
        }
        let count = dayson_core::element_count(shape)?;
        if count != data.len() {
            return Err(CoreError::InvalidArgument(format!(
                "buffer of {} elements does not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let buf = self.stream.memcpy_stod(data).map_err(|e| {
            CoreError::DeviceFailure(format!("host-to-device copy of {count} elements: {e}"))
        })?;
        Ok(Tensor::Device(DeviceTensor::new(
            shape,
            buf,
            self.stream.clone(),
        )?))
    }

    fn duplicate(&self, t: &Tensor) -> Result<Tensor> {
        let src = self.device(t, "duplicate")?;
        let mut buf = self.alloc(src.len())?;
        self.stream
            .memcpy_dtod(src.buf(), &mut buf)
            .map_err(|e| CoreError::DeviceFailure(format!("device copy: {e}")))?;
        Ok(Tensor::Device(DeviceTensor::new(
            t.shape(),
            buf,
            self.stream.clone(),
        )?))
    }

    fn read_back(&self, t: &Tensor) -> Result<Vec<f32>> {
        let src = self.device(t, "read_back")?;
        self.guard.synchronize_before_read("read_back")?;
        self.stream
            .memcpy_dtov(src.buf())
            .map_err(|e| CoreError::DeviceFailure(format!("device-to-host copy: {e}")))
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (m, n) = a.dims2()?;
        let (n2, p) = b.dims2()?;
        let (om, op) = out.dims2()?;
        if n != n2 || om != m || op != p {
            return Err(CoreError::InvalidArgument(format!(
                "matmul: [{m},{n}] x [{n2},{p}] -> [{om},{op}]"
            )));
        }
        self.matmul_variant("matmul", a, b, out, (m, n, p))
    }

    fn matmul_at(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (k, m) = a.dims2()?;
        let (k2, p) = b.dims2()?;
        let (om, op) = out.dims2()?;
        if k != k2 || om != m || op != p {
            return Err(CoreError::InvalidArgument(format!(
                "matmul_at: [{k},{m}]^T x [{k2},{p}] -> [{om},{op}]"
            )));
        }
        self.matmul_variant("matmul_at", a, b, out, (k, m, p))
    }

    fn matmul_bt(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (m, k) = a.dims2()?;
        let (p, k2) = b.dims2()?;
        let (om, op) = out.dims2()?;
        if k != k2 || om != m || op != p {
            return Err(CoreError::InvalidArgument(format!(
                "matmul_bt: [{m},{k}] x [{p},{k2}]^T -> [{om},{op}]"
            )));
        }
        self.matmul_variant("matmul_bt", a, b, out, (m, k, p))
    }

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.elementwise("add_elems", a, b, out)
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.elementwise("sub_elems", a, b, out)
    }

    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        self.elementwise("mul_elems", a, b, out)
    }

    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()> {
        let (_, cols) = m.dims2()?;
        if bias.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "add_broadcast: bias of {} elements against {cols} columns",
                bias.len()
            )));
        }
        let n = m.len();
        let bias = self.device(bias, "add_broadcast")?;
        let m = self.device_mut(m, "add_broadcast")?;
        self.dispatch(
            "add_broadcast_rows",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(m.buf()),
                KernelArg::Buffer(bias.buf()),
                KernelArg::Int32(n as i32),
                KernelArg::Int32(cols as i32),
            ],
        )
    }

    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        self.check_same_len(dst, src, "add_scaled")?;
        let n = dst.len();
        let src = self.device(src, "add_scaled")?;
        let dst = self.device_mut(dst, "add_scaled")?;
        self.dispatch(
            "add_scaled_elems",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(dst.buf()),
                KernelArg::Buffer(src.buf()),
                KernelArg::Float32(s),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        self.check_same_len(dst, src, "sub_scaled")?;
        let n = dst.len();
        let src = self.device(src, "sub_scaled")?;
        let dst = self.device_mut(dst, "sub_scaled")?;
        self.dispatch(
            "sub_scaled_elems",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(dst.buf()),
                KernelArg::Buffer(src.buf()),
                KernelArg::Float32(s),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.map_into("sigmoid_forward", x, out)
    }

    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.map_into("tanh_forward", x, out)
    }

    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        self.map_into("sigmoid_derivative", y, out)
    }

    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        self.map_into("tanh_derivative", y, out)
    }

    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        self.check_same_shape(x, out, "softmax")?;
        let (rows, cols) = x.dims2()?;
        let x = self.device(x, "softmax")?;
        let out = self.device_mut(out, "softmax")?;
        self.dispatch(
            "softmax_rows",
            self.rows_cfg(rows, 0),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(rows as i32),
                KernelArg::Int32(cols as i32),
                KernelArg::SharedBytes(THREADS_PER_BLOCK as usize * 4),
            ],
        )
    }

    fn layer_norm(&self, x: &mut Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<()> {
        let (rows, cols) = x.dims2()?;
        if gamma.len() != cols || beta.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "layer_norm: gamma/beta of {}/{} elements against {cols} columns",
                gamma.len(),
                beta.len()
            )));
        }
        let gamma = self.device(gamma, "layer_norm")?;
        let beta = self.device(beta, "layer_norm")?;
        let x = self.device_mut(x, "layer_norm")?;
        self.dispatch(
            "layer_norm_rows",
            self.rows_cfg(rows, 0),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Buffer(gamma.buf()),
                KernelArg::Buffer(beta.buf()),
                KernelArg::Float32(eps),
                KernelArg::Int32(rows as i32),
                KernelArg::Int32(cols as i32),
                KernelArg::SharedBytes(THREADS_PER_BLOCK as usize * 4),
            ],
        )
    }

    fn lookup(&self, table: &Tensor, index: usize, out: &mut Tensor) -> Result<()> {
        let (rows, cols) = table.dims2()?;
        if index >= rows {
            return Err(CoreError::InvalidArgument(format!(
                "lookup: row {index} of {rows}"
            )));
        }
        if out.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "lookup: output of {} elements against {cols} columns",
                out.len()
            )));
        }
        let table = self.device(table, "lookup")?;
        let out = self.device_mut(out, "lookup")?;
        self.dispatch(
            "lookup_row",
            self.elems_cfg(cols),
            &[
                KernelArg::Buffer(table.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(index as i32),
                KernelArg::Int32(cols as i32),
            ],
        )
    }

    fn accumulate_gradient(&self, grad: &mut Tensor, row: &Tensor, index: usize) -> Result<()> {
        let (rows, cols) = grad.dims2()?;
        if index >= rows {
            return Err(CoreError::InvalidArgument(format!(
                "accumulate_gradient: row {index} of {rows}"
            )));
        }
        if row.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "accumulate_gradient: row of {} elements against {cols} columns",
                row.len()
            )));
        }
        let row = self.device(row, "accumulate_gradient")?;
        let grad = self.device_mut(grad, "accumulate_gradient")?;
        self.dispatch(
            "scatter_add_row",
            self.elems_cfg(cols),
            &[
                KernelArg::Buffer(grad.buf()),
                KernelArg::Buffer(row.buf()),
                KernelArg::Int32(index as i32),
                KernelArg::Int32(cols as i32),
            ],
        )
    }

    fn one_hot(&self, indices: &[i32], classes: usize) -> Result<Tensor> {
        if classes == 0 {
            return Err(CoreError::InvalidArgument(
                "one_hot: zero classes".to_string(),
            ));
        }
        for &idx in indices {
            if idx < 0 || idx as usize >= classes {
                return Err(CoreError::InvalidArgument(format!(
                    "one_hot: index {idx} outside [0, {classes})"
                )));
            }
        }
        let mut out = self.create(&[indices.len(), classes])?;
        let d_indices = self.stream.memcpy_stod(indices).map_err(|e| {
            CoreError::DeviceFailure(format!("index upload for one_hot: {e}"))
        })?;
        {
            let out = self.device_mut(&mut out, "one_hot")?;
            self.dispatch(
                "one_hot_rows",
                self.elems_cfg(indices.len()),
                &[
                    KernelArg::Buffer(out.buf()),
                    KernelArg::IntBuffer(&d_indices),
                    KernelArg::Int32(indices.len() as i32),
                    KernelArg::Int32(classes as i32),
                ],
            )?;
        }
        Ok(out)
    }

    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()> {
        let (rows, cols) = src.dims2()?;
        if row >= rows || out.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "slice_row: row {row} of {rows}, output of {} elements",
                out.len()
            )));
        }
        let src = self.device(src, "slice_row")?;
        let out = self.device_mut(out, "slice_row")?;
        self.dispatch(
            "slice_row",
            self.elems_cfg(cols),
            &[
                KernelArg::Buffer(src.buf()),
                KernelArg::Buffer(out.buf()),
                KernelArg::Int32(row as i32),
                KernelArg::Int32(cols as i32),
            ],
        )
    }

    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()> {
        let (rows, cols) = dst.dims2()?;
        if row >= rows || src.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "set_row: row {row} of {rows}, source of {} elements",
                src.len()
            )));
        }
        let src = self.device(src, "set_row")?;
        let dst = self.device_mut(dst, "set_row")?;
        self.dispatch(
            "set_row",
            self.elems_cfg(cols),
            &[
                KernelArg::Buffer(dst.buf()),
                KernelArg::Buffer(src.buf()),
                KernelArg::Int32(row as i32),
                KernelArg::Int32(cols as i32),
            ],
        )
    }

    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()> {
        let n = x.len();
        let x = self.device_mut(x, "clip")?;
        self.dispatch(
            "clip_elems",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Float32(lo),
                KernelArg::Float32(hi),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()> {
        let n = x.len();
        let x = self.device_mut(x, "scale")?;
        self.dispatch(
            "scale_elems",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Float32(s),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn sanitize_and_clip(&self, x: &mut Tensor, limit: f32) -> Result<()> {
        let n = x.len();
        let x = self.device_mut(x, "sanitize_and_clip")?;
        self.dispatch(
            "sanitize_clip_elems",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(x.buf()),
                KernelArg::Float32(limit),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn sum_of_squares(&self, x: &Tensor) -> Result<f64> {
        let n = x.len();
        let blocks = ((n as u32).max(1) + THREADS_PER_BLOCK - 1) / THREADS_PER_BLOCK;
        let blocks = blocks.min(MAX_REDUCTION_BLOCKS);
        let partials = self
            .stream
            .alloc_zeros::<f64>(blocks as usize)
            .map_err(|e| CoreError::OutOfMemory(format!("reduction partials: {e}")))?;
        {
            let x = self.device(x, "sum_of_squares")?;
            let cfg = LaunchConfig {
                grid_dim: (blocks, 1, 1),
                block_dim: (THREADS_PER_BLOCK, 1, 1),
                shared_mem_bytes: 0,
            };
            self.dispatch(
                "sum_squares",
                cfg,
                &[
                    KernelArg::Buffer(x.buf()),
                    KernelArg::DoubleBuffer(&partials),
                    KernelArg::Int32(n as i32),
                ],
            )?;
        }
        self.guard.synchronize_before_read("sum_of_squares")?;
        let partials = self
            .stream
            .memcpy_dtov(&partials)
            .map_err(|e| CoreError::DeviceFailure(format!("reduction read-back: {e}")))?;
        Ok(partials.iter().sum())
    }

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
    ) -> Result<()> {
        self.check_same_len(p, g, "adam_update")?;
        self.check_same_len(p, m, "adam_update")?;
        self.check_same_len(p, v, "adam_update")?;
        if t < 1 {
            return Err(CoreError::InvalidArgument(format!(
                "adam_update: timestep {t} < 1"
            )));
        }
        let n = p.len();
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        let g = self.device(g, "adam_update")?;
        let m = self.device_mut(m, "adam_update")?;
        let v = self.device_mut(v, "adam_update")?;
        let p = self.device_mut(p, "adam_update")?;
        self.dispatch(
            "adam_step",
            self.elems_cfg(n),
            &[
                KernelArg::Buffer(p.buf()),
                KernelArg::Buffer(g.buf()),
                KernelArg::Buffer(m.buf()),
                KernelArg::Buffer(v.buf()),
                KernelArg::Float32(lr),
                KernelArg::Float32(beta1),
                KernelArg::Float32(beta2),
                KernelArg::Float32(eps),
                KernelArg::Float32(bias1),
                KernelArg::Float32(bias2),
                KernelArg::Int32(n as i32),
            ],
        )
    }

    fn sync_guard(&self) -> Option<&SyncGuard> {
        Some(&self.guard)
    }
}
