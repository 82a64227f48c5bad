//! The device kernel catalog. Everything is compiled from this one source
//! string at engine construction.

pub const CATALOG_FUNCS: &[&str] = &[
    "matmul",
    "matmul_at",
    "matmul_bt",
    "add_elems",
    "sub_elems",
    "mul_elems",
    "add_broadcast_rows",
    "add_scaled_elems",
    "sub_scaled_elems",
    "sigmoid_forward",
    "tanh_forward",
    "sigmoid_derivative",
    "tanh_derivative",
    "softmax_rows",
    "layer_norm_rows",
    "lookup_row",
    "scatter_add_row",
    "one_hot_rows",
    "slice_row",
    "set_row",
    "clip_elems",
    "scale_elems",
    "sanitize_clip_elems",
    "sum_squares",
    "adam_step",
];

pub const CATALOG_SRC: &str = r#"
extern "C" __global__ void matmul(
    const float* __restrict__ a,
    const float* __restrict__ b,
    float* out,
    int m, int n, int p
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= m * p) return;
    int i = idx / p;
    int j = idx % p;
    float sum = 0.0f;
    for (int k = 0; k < n; k++) {
        sum += a[i * n + k] * b[k * p + j];
    }
    out[idx] = sum;
}

extern "C" __global__ void matmul_at(
    const float* __restrict__ a,
    const float* __restrict__ b,
    float* out,
    int k, int m, int p
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= m * p) return;
    int i = idx / p;
    int j = idx % p;
    float sum = 0.0f;
    for (int kk = 0; kk < k; kk++) {
        sum += a[kk * m + i] * b[kk * p + j];
    }
    out[idx] = sum;
}

extern "C" __global__ void matmul_bt(
    const float* __restrict__ a,
    const float* __restrict__ b,
    float* out,
    int m, int k, int p
) {
    int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= m * p) return;
    int i = idx / p;
    int j = idx % p;
    float sum = 0.0f;
    for (int kk = 0; kk < k; kk++) {
        sum += a[i * k + kk] * b[j * k + kk];
    }
    out[idx] = sum;
}

extern "C" __global__ void add_elems(const float* a, const float* b, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) out[i] = a[i] + b[i];
}

extern "C" __global__ void sub_elems(const float* a, const float* b, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) out[i] = a[i] - b[i];
}

extern "C" __global__ void mul_elems(const float* a, const float* b, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) out[i] = a[i] * b[i];
}

extern "C" __global__ void add_broadcast_rows(float* m, const float* bias, int n, int cols) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) m[i] += bias[i % cols];
}

extern "C" __global__ void add_scaled_elems(float* dst, const float* src, float s, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) dst[i] += s * src[i];
}

extern "C" __global__ void sub_scaled_elems(float* dst, const float* src, float s, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) dst[i] -= s * src[i];
}

extern "C" __global__ void sigmoid_forward(const float* x, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float v = x[i];
    if (!isfinite(v)) {
        out[i] = 0.5f;
        return;
    }
    v = fminf(fmaxf(v, -88.0f), 88.0f);
    float r = 1.0f / (1.0f + expf(-v));
    out[i] = fminf(fmaxf(r, 0.0f), 1.0f);
}

extern "C" __global__ void tanh_forward(const float* x, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float v = x[i];
    if (!isfinite(v)) {
        out[i] = 0.0f;
        return;
    }
    v = fminf(fmaxf(v, -20.0f), 20.0f);
    float r = tanhf(v);
    out[i] = fminf(fmaxf(r, -1.0f), 1.0f);
}

extern "C" __global__ void sigmoid_derivative(const float* y, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float v = y[i];
    if (!isfinite(v)) v = 0.5f;
    float d = v * (1.0f - v);
    out[i] = fminf(fmaxf(d, 0.0f), 0.25f);
}

extern "C" __global__ void tanh_derivative(const float* y, float* out, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float v = y[i];
    if (!isfinite(v)) v = 0.0f;
    float d = 1.0f - v * v;
    out[i] = fminf(fmaxf(d, 0.0f), 1.0f);
}

// One block per row; shared tree reductions for the row max and the sum.
extern "C" __global__ void softmax_rows(const float* x, float* out, int rows, int cols) {
    int row = blockIdx.x;
    if (row >= rows) return;
    extern __shared__ float red[];
    const float* xr = x + (long)row * cols;
    float* orow = out + (long)row * cols;
    int tid = threadIdx.x;

    float local_max = -3.402823466e+38f;
    for (int c = tid; c < cols; c += blockDim.x) {
        float v = xr[c];
        if (isfinite(v) && v > local_max) local_max = v;
    }
    red[tid] = local_max;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s && red[tid + s] > red[tid]) red[tid] = red[tid + s];
        __syncthreads();
    }
    float row_max = red[0];
    __syncthreads();

    float local_sum = 0.0f;
    for (int c = tid; c < cols; c += blockDim.x) {
        float v = xr[c];
        float e = isfinite(v) ? expf(v - row_max) : 0.0f;
        orow[c] = e;
        local_sum += e;
    }
    red[tid] = local_sum;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s) red[tid] += red[tid + s];
        __syncthreads();
    }
    float sum = red[0];

    for (int c = tid; c < cols; c += blockDim.x) {
        if (sum < 1e-10f) {
            orow[c] = 1.0f / (float)cols;
        } else {
            float p = orow[c] / sum;
            orow[c] = fminf(fmaxf(p, 1e-10f), 1.0f);
        }
    }
}

// One block per row; in-place normalize then affine.
extern "C" __global__ void layer_norm_rows(
    float* x, const float* gamma, const float* beta, float eps, int rows, int cols
) {
    int row = blockIdx.x;
    if (row >= rows || cols == 0) return;
    extern __shared__ float red[];
    float* xr = x + (long)row * cols;
    int tid = threadIdx.x;

    float local_sum = 0.0f;
    for (int c = tid; c < cols; c += blockDim.x) local_sum += xr[c];
    red[tid] = local_sum;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s) red[tid] += red[tid + s];
        __syncthreads();
    }
    float mean = red[0] / (float)cols;
    __syncthreads();

    float local_sq = 0.0f;
    for (int c = tid; c < cols; c += blockDim.x) {
        float d = xr[c] - mean;
        local_sq += d * d;
    }
    red[tid] = local_sq;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s) red[tid] += red[tid + s];
        __syncthreads();
    }
    float var = red[0] / (float)cols;
    float inv = rsqrtf(var + eps);

    for (int c = tid; c < cols; c += blockDim.x) {
        xr[c] = gamma[c] * ((xr[c] - mean) * inv) + beta[c];
    }
}

extern "C" __global__ void lookup_row(const float* table, float* out, int index, int cols) {
    int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c < cols) out[c] = table[(long)index * cols + c];
}

extern "C" __global__ void scatter_add_row(float* grad, const float* row, int index, int cols) {
    int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c < cols) grad[(long)index * cols + c] += row[c];
}

// out is pre-zeroed; one thread per row writes its hot column.
extern "C" __global__ void one_hot_rows(float* out, const int* indices, int rows, int classes) {
    int r = blockIdx.x * blockDim.x + threadIdx.x;
    if (r >= rows) return;
    int idx = indices[r];
    if (idx >= 0 && idx < classes) out[(long)r * classes + idx] = 1.0f;
}

extern "C" __global__ void slice_row(const float* src, float* out, int row, int cols) {
    int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c < cols) out[c] = src[(long)row * cols + c];
}

extern "C" __global__ void set_row(float* dst, const float* src, int row, int cols) {
    int c = blockIdx.x * blockDim.x + threadIdx.x;
    if (c < cols) dst[(long)row * cols + c] = src[c];
}

extern "C" __global__ void clip_elems(float* x, float lo, float hi, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) x[i] = fminf(fmaxf(x[i], lo), hi);
}

extern "C" __global__ void scale_elems(float* x, float s, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) x[i] *= s;
}

extern "C" __global__ void sanitize_clip_elems(float* x, float limit, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float v = x[i];
    if (!isfinite(v)) v = 0.0f;
    x[i] = fminf(fmaxf(v, -limit), limit);
}

// Grid-stride accumulate in double, then a shared tree reduction; one
// partial per block, summed on the host.
extern "C" __global__ void sum_squares(const float* x, double* partials, int n) {
    __shared__ double sdata[256];
    int tid = threadIdx.x;
    long i = (long)blockIdx.x * blockDim.x + tid;
    long stride = (long)gridDim.x * blockDim.x;
    double acc = 0.0;
    for (; i < n; i += stride) {
        double v = (double)x[i];
        acc += v * v;
    }
    sdata[tid] = acc;
    __syncthreads();
    for (int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (tid < s) sdata[tid] += sdata[tid + s];
        __syncthreads();
    }
    if (tid == 0) partials[blockIdx.x] = sdata[0];
}

// Fused Adam step. bias1/bias2 are the host-computed corrections
// (1 - beta^t). The per-parameter step is clipped to +-0.1 and the moment
// buffers are sanitized before use.
extern "C" __global__ void adam_step(
    float* p, const float* g, float* m, float* v,
    float lr, float b1, float b2, float eps,
    float bias1, float bias2, int n
) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float gi = g[i];
    if (!isfinite(gi)) gi = 0.0f;
    float mi = m[i];
    if (!isfinite(mi)) mi = 0.0f;
    float vi = v[i];
    if (!isfinite(vi)) vi = 0.0f;
    mi = b1 * mi + (1.0f - b1) * gi;
    vi = b2 * vi + (1.0f - b2) * gi * gi;
    float m_hat = mi / bias1;
    float v_hat = vi / bias2;
    float step = lr * m_hat / (sqrtf(v_hat) + eps);
    step = fminf(fmaxf(step, -0.1f), 0.1f);
    p[i] -= step;
    m[i] = mi;
    v[i] = vi;
}
"#;
