use crate::{MathEngine, SyncGuard};
use dayson_core::{CoreError, HostTensor, Result, Tensor};

/// CPU implementation of the operation catalog: straight loops over the
/// flat row-major buffers.
pub struct HostMathEngine;

impl HostMathEngine {
    pub fn new() -> Self {
        HostMathEngine
    }
}

impl Default for HostMathEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn sigmoid_scalar(x: f32) -> f32 {
    if !x.is_finite() {
        return 0.5;
    }
    let x = x.clamp(-88.0, 88.0);
    (1.0 / (1.0 + (-x).exp())).clamp(0.0, 1.0)
}

fn tanh_scalar(x: f32) -> f32 {
    if !x.is_finite() {
        return 0.0;
    }
    x.clamp(-20.0, 20.0).tanh().clamp(-1.0, 1.0)
}

fn check_same_shape(a: &Tensor, b: &Tensor, op: &str) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(CoreError::InvalidArgument(format!(
            "{op}: shape {:?} does not match {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(())
}

fn check_same_len(a: &Tensor, b: &Tensor, op: &str) -> Result<()> {
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
    a: &Tensor,
    b: &Tensor,
    out: &mut Tensor,
    op: &str,
    f: impl Fn(f32, f32) -> f32,
) -> Result<()> {
    check_same_shape(a, b, op)?;
    check_same_shape(a, out, op)?;
    let a = a.as_host()?;
    let b = b.as_host()?;
    let out = out.as_host_mut()?;
    for ((o, &x), &y) in out.data_mut().iter_mut().zip(a.data()).zip(b.data()) {
        *o = f(x, y);
    }
    Ok(())
}

fn map_into(x: &Tensor, out: &mut Tensor, op: &str, f: impl Fn(f32) -> f32) -> Result<()> {
    check_same_shape(x, out, op)?;
    let x = x.as_host()?;
    let out = out.as_host_mut()?;
    for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
        *o = f(v);
    }
    Ok(())
}

impl MathEngine for HostMathEngine {
    fn backend_name(&self) -> &'static str {
        "host"
    }

    fn create(&self, shape: &[usize]) -> Result<Tensor> {
        Ok(Tensor::Host(HostTensor::zeros(shape)?))
    }

    fn create_from(&self, data: &[f32], shape: &[usize]) -> Result<Tensor> {
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(CoreError::InvalidArgument(format!(
                "non-finite value {} at element {pos}",
                data[pos]
            )));
        }
        Ok(Tensor::Host(HostTensor::from_vec(shape, data.to_vec())?))
    }

    fn duplicate(&self, t: &Tensor) -> Result<Tensor> {
        Ok(Tensor::Host(t.as_host()?.clone()))
    }

    fn read_back(&self, t: &Tensor) -> Result<Vec<f32>> {
        Ok(t.as_host()?.data().to_vec())
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
        let a = a.as_host()?;
        let a = a.data();
        let b = b.as_host()?;
        let b = b.data();
        let out = out.as_host_mut()?.data_mut();
        for i in 0..m {
            for j in 0..p {
                let mut sum = 0.0f32;
                for k in 0..n {
                    sum += a[i * n + k] * b[k * p + j];
                }
                out[i * p + j] = sum;
            }
        }
        Ok(())
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
        let a = a.as_host()?;
        let a = a.data();
        let b = b.as_host()?;
        let b = b.data();
        let out = out.as_host_mut()?.data_mut();
        for i in 0..m {
            for j in 0..p {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += a[kk * m + i] * b[kk * p + j];
                }
                out[i * p + j] = sum;
            }
        }
        Ok(())
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
        let a = a.as_host()?;
        let a = a.data();
        let b = b.as_host()?;
        let b = b.data();
        let out = out.as_host_mut()?.data_mut();
        for i in 0..m {
            for j in 0..p {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += a[i * k + kk] * b[j * k + kk];
                }
                out[i * p + j] = sum;
            }
        }
        Ok(())
    }

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        elementwise(a, b, out, "add", |x, y| x + y)
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        elementwise(a, b, out, "sub", |x, y| x - y)
    }

    fn mul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        elementwise(a, b, out, "mul", |x, y| x * y)
    }

    fn add_broadcast(&self, m: &mut Tensor, bias: &Tensor) -> Result<()> {
        let (_, cols) = m.dims2()?;
        if bias.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "add_broadcast: bias of {} elements against {cols} columns",
                bias.len()
            )));
        }
        let bias = bias.as_host()?;
        let bias = bias.data();
        let m = m.as_host_mut()?.data_mut();
        for (i, v) in m.iter_mut().enumerate() {
            *v += bias[i % cols];
        }
        Ok(())
    }

    fn add_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        check_same_len(dst, src, "add_scaled")?;
        let src = src.as_host()?;
        let dst = dst.as_host_mut()?.data_mut();
        for (d, &x) in dst.iter_mut().zip(src.data()) {
            *d += s * x;
        }
        Ok(())
    }

    fn sub_scaled(&self, dst: &mut Tensor, src: &Tensor, s: f32) -> Result<()> {
        check_same_len(dst, src, "sub_scaled")?;
        let src = src.as_host()?;
        let dst = dst.as_host_mut()?.data_mut();
        for (d, &x) in dst.iter_mut().zip(src.data()) {
            *d -= s * x;
        }
        Ok(())
    }

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        map_into(x, out, "sigmoid", sigmoid_scalar)
    }

    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        map_into(x, out, "tanh", tanh_scalar)
    }

    fn sigmoid_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        map_into(y, out, "sigmoid_deriv", |v| {
            let v = if v.is_finite() { v } else { 0.5 };
            (v * (1.0 - v)).clamp(0.0, 0.25)
        })
    }

    fn tanh_deriv(&self, y: &Tensor, out: &mut Tensor) -> Result<()> {
        map_into(y, out, "tanh_deriv", |v| {
            let v = if v.is_finite() { v } else { 0.0 };
            (1.0 - v * v).clamp(0.0, 1.0)
        })
    }

    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        check_same_shape(x, out, "softmax")?;
        let (rows, cols) = x.dims2()?;
        let x = x.as_host()?;
        let x = x.data();
        let out = out.as_host_mut()?.data_mut();
        for r in 0..rows {
            let row = &x[r * cols..(r + 1) * cols];
            let orow = &mut out[r * cols..(r + 1) * cols];
            let max = row
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            if max.is_finite() {
                for (o, &v) in orow.iter_mut().zip(row) {
                    let e = if v.is_finite() { (v - max).exp() } else { 0.0 };
                    *o = e;
                    sum += e;
                }
            }
            if sum < 1e-10 {
                let uniform = 1.0 / cols as f32;
                for o in orow.iter_mut() {
                    *o = uniform;
                }
            } else {
                for o in orow.iter_mut() {
                    *o = (*o / sum).clamp(1e-10, 1.0);
                }
            }
        }
        Ok(())
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
        if cols == 0 {
            return Ok(());
        }
        let gamma = gamma.as_host()?;
        let gamma = gamma.data();
        let beta = beta.as_host()?;
        let beta = beta.data();
        let x = x.as_host_mut()?.data_mut();
        for r in 0..rows {
            let row = &mut x[r * cols..(r + 1) * cols];
            let mean = row.iter().sum::<f32>() / cols as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / cols as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for (c, v) in row.iter_mut().enumerate() {
                *v = gamma[c] * ((*v - mean) * inv) + beta[c];
            }
        }
        Ok(())
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
        let table = table.as_host()?;
        let src = &table.data()[index * cols..(index + 1) * cols];
        out.as_host_mut()?.data_mut().copy_from_slice(src);
        Ok(())
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
        let row = row.as_host()?;
        let grad = grad.as_host_mut()?.data_mut();
        for (c, &v) in row.data().iter().enumerate() {
            grad[index * cols + c] += v;
        }
        Ok(())
    }

    fn one_hot(&self, indices: &[i32], classes: usize) -> Result<Tensor> {
        if classes == 0 {
            return Err(CoreError::InvalidArgument(
                "one_hot: zero classes".to_string(),
            ));
        }
        let mut data = vec![0.0f32; indices.len() * classes];
        for (r, &idx) in indices.iter().enumerate() {
            if idx < 0 || idx as usize >= classes {
                return Err(CoreError::InvalidArgument(format!(
                    "one_hot: index {idx} outside [0, {classes})"
                )));
            }
            data[r * classes + idx as usize] = 1.0;
        }
        Ok(Tensor::Host(HostTensor::from_vec(
            &[indices.len(), classes],
            data,
        )?))
    }

    fn slice_row(&self, src: &Tensor, row: usize, out: &mut Tensor) -> Result<()> {
        let (rows, cols) = src.dims2()?;
        if row >= rows {
            return Err(CoreError::InvalidArgument(format!(
                "slice_row: row {row} of {rows}"
            )));
        }
        if out.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "slice_row: output of {} elements against {cols} columns",
                out.len()
            )));
        }
        let src = src.as_host()?;
        let data = &src.data()[row * cols..(row + 1) * cols];
        out.as_host_mut()?.data_mut().copy_from_slice(data);
        Ok(())
    }

    fn set_row(&self, dst: &mut Tensor, row: usize, src: &Tensor) -> Result<()> {
        let (rows, cols) = dst.dims2()?;
        if row >= rows {
            return Err(CoreError::InvalidArgument(format!(
                "set_row: row {row} of {rows}"
            )));
        }
        if src.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "set_row: source of {} elements against {cols} columns",
                src.len()
            )));
        }
        let src = src.as_host()?;
        let dst = dst.as_host_mut()?.data_mut();
        dst[row * cols..(row + 1) * cols].copy_from_slice(src.data());
        Ok(())
    }

    fn clip(&self, x: &mut Tensor, lo: f32, hi: f32) -> Result<()> {
        for v in x.as_host_mut()?.data_mut() {
            *v = v.max(lo).min(hi);
        }
        Ok(())
    }

    fn scale(&self, x: &mut Tensor, s: f32) -> Result<()> {
        for v in x.as_host_mut()?.data_mut() {
            *v *= s;
        }
        Ok(())
    }

    fn sanitize_and_clip(&self, x: &mut Tensor, limit: f32) -> Result<()> {
        for v in x.as_host_mut()?.data_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
            *v = v.clamp(-limit, limit);
        }
        Ok(())
    }

    fn sum_of_squares(&self, x: &Tensor) -> Result<f64> {
        Ok(x.as_host()?
            .data()
            .iter()
            .map(|&v| v as f64 * v as f64)
            .sum())
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
        check_same_len(p, g, "adam_update")?;
        check_same_len(p, m, "adam_update")?;
        check_same_len(p, v, "adam_update")?;
        if t < 1 {
            return Err(CoreError::InvalidArgument(format!(
                "adam_update: timestep {t} < 1"
            )));
        }
        let g = g.as_host()?;
        let g = g.data();
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);
        {
            let m = m.as_host_mut()?.data_mut();
            let v = v.as_host_mut()?.data_mut();
            let p = p.as_host_mut()?.data_mut();
            for i in 0..p.len() {
                let gi = if g[i].is_finite() { g[i] } else { 0.0 };
                let mut mi = if m[i].is_finite() { m[i] } else { 0.0 };
                let mut vi = if v[i].is_finite() { v[i] } else { 0.0 };
                mi = beta1 * mi + (1.0 - beta1) * gi;
                vi = beta2 * vi + (1.0 - beta2) * gi * gi;
                let m_hat = mi / bias1;
                let v_hat = vi / bias2;
                let step = (lr * m_hat / (v_hat.sqrt() + eps)).clamp(-0.1, 0.1);
                p[i] -= step;
                m[i] = mi;
                v[i] = vi;
            }
        }
        Ok(())
    }

    fn sync_guard(&self) -> Option<&SyncGuard> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> HostMathEngine {
        HostMathEngine::new()
    }

    fn tensor(shape: &[usize], data: &[f32]) -> Tensor {
        Tensor::Host(HostTensor::from_vec(shape, data.to_vec()).unwrap())
    }

    fn data(t: &Tensor) -> Vec<f32> {
        t.as_host().unwrap().data().to_vec()
    }

    #[test]
    fn test_create_from_rejects_non_finite() {
        let e = engine();
        assert!(e.create_from(&[1.0, f32::NAN], &[2]).is_err());
        assert!(e.create_from(&[f32::INFINITY], &[1]).is_err());
        assert!(e.create_from(&[1.0, 2.0], &[2]).is_ok());
    }

    #[test]
    fn test_matmul() {
        let e = engine();
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let mut out = e.create(&[2, 2]).unwrap();
        e.matmul(&a, &b, &mut out).unwrap();
        assert_eq!(data(&out), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_at_matches_explicit_transpose() {
        let e = engine();
        // A[K=3, M=2]; A^T x B == matmul(transpose(A), B)
        let a = tensor(&[3, 2], &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let b = tensor(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let mut out = e.create(&[2, 2]).unwrap();
        e.matmul_at(&a, &b, &mut out).unwrap();
        assert_eq!(data(&out), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_bt_matches_explicit_transpose() {
        let e = engine();
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // B[P=2, K=3]; A x B^T
        let b = tensor(&[2, 3], &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
        let mut out = e.create(&[2, 2]).unwrap();
        e.matmul_bt(&a, &b, &mut out).unwrap();
        assert_eq!(data(&out), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let e = engine();
        let a = tensor(&[2, 3], &[0.0; 6]);
        let b = tensor(&[2, 3], &[0.0; 6]);
        let mut out = e.create(&[2, 3]).unwrap();
        assert!(e.matmul(&a, &b, &mut out).is_err());
    }

    #[test]
    fn test_elementwise_and_broadcast() {
        let e = engine();
        let a = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = tensor(&[2, 2], &[10.0, 20.0, 30.0, 40.0]);
        let mut out = e.create(&[2, 2]).unwrap();
        e.add(&a, &b, &mut out).unwrap();
        assert_eq!(data(&out), vec![11.0, 22.0, 33.0, 44.0]);
        e.sub(&b, &a, &mut out).unwrap();
        assert_eq!(data(&out), vec![9.0, 18.0, 27.0, 36.0]);
        e.mul(&a, &b, &mut out).unwrap();
        assert_eq!(data(&out), vec![10.0, 40.0, 90.0, 160.0]);

        let mut m = tensor(&[2, 2], &[1.0, 1.0, 1.0, 1.0]);
        let bias = tensor(&[2], &[5.0, -5.0]);
        e.add_broadcast(&mut m, &bias).unwrap();
        assert_eq!(data(&m), vec![6.0, -4.0, 6.0, -4.0]);
    }

    #[test]
    fn test_fused_scaled_updates() {
        let e = engine();
        let mut dst = tensor(&[3], &[1.0, 2.0, 3.0]);
        let src = tensor(&[1, 3], &[1.0, 1.0, 1.0]);
        e.add_scaled(&mut dst, &src, 0.5).unwrap();
        assert_eq!(data(&dst), vec![1.5, 2.5, 3.5]);
        e.sub_scaled(&mut dst, &src, 1.5).unwrap();
        assert_eq!(data(&dst), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_sigmoid_adversarial_inputs() {
        let e = engine();
        let x = tensor(
            &[6],
            &[0.0, 1e30, -1e30, f32::INFINITY, f32::NEG_INFINITY, f32::NAN],
        );
        let mut out = e.create(&[6]).unwrap();
        e.sigmoid(&x, &mut out).unwrap();
        let out = data(&out);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert!(out[2].abs() < 1e-6);
        assert_eq!(out[3], 0.5);
        assert_eq!(out[4], 0.5);
        assert_eq!(out[5], 0.5);
    }

    #[test]
    fn test_tanh_adversarial_inputs() {
        let e = engine();
        let x = tensor(
            &[5],
            &[0.5, 1e30, f32::INFINITY, f32::NEG_INFINITY, f32::NAN],
        );
        let mut out = e.create(&[5]).unwrap();
        e.tanh(&x, &mut out).unwrap();
        let out = data(&out);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[0] - 0.5f32.tanh()).abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
        assert_eq!(out[4], 0.0);
    }

    #[test]
    fn test_activation_derivatives_clamped() {
        let e = engine();
        let y = tensor(&[4], &[0.5, 2.0, -1.0, f32::NAN]);
        let mut out = e.create(&[4]).unwrap();
        e.sigmoid_deriv(&y, &mut out).unwrap();
        let d = data(&out);
        assert_eq!(d[0], 0.25);
        assert_eq!(d[1], 0.0); // 2*(1-2) = -2, clamped up
        assert_eq!(d[2], 0.0);
        assert_eq!(d[3], 0.25);

        e.tanh_deriv(&y, &mut out).unwrap();
        let d = data(&out);
        assert_eq!(d[0], 0.75);
        assert_eq!(d[1], 0.0); // 1-4 clamped up
        assert_eq!(d[2], 0.0);
        assert_eq!(d[3], 1.0);
    }

    #[test]
    fn test_softmax_large_inputs_stable() {
        let e = engine();
        let x = tensor(&[1, 3], &[1000.0, 1001.0, 1002.0]);
        let mut out = e.create(&[1, 3]).unwrap();
        e.softmax(&x, &mut out).unwrap();
        let out = data(&out);
        assert!((out[0] - 0.0900).abs() < 1e-4);
        assert!((out[1] - 0.2447).abs() < 1e-4);
        assert!((out[2] - 0.6652).abs() < 1e-4);
    }

    #[test]
    fn test_softmax_nan_row() {
        let e = engine();
        let x = tensor(&[1, 3], &[f32::NAN, 1.0, 1.0]);
        let mut out = e.create(&[1, 3]).unwrap();
        e.softmax(&x, &mut out).unwrap();
        let out = data(&out);
        assert!(out.iter().all(|v| v.is_finite()));
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let e = engine();
        let x = tensor(&[3, 4], &[0.1, -2.0, 5.0, 3.3, 0.0, 0.0, 0.0, 0.0, -9.0, -9.0, 4.0, 2.0]);
        let mut out = e.create(&[3, 4]).unwrap();
        e.softmax(&x, &mut out).unwrap();
        let out = data(&out);
        for r in 0..3 {
            let sum: f32 = out[r * 4..(r + 1) * 4].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(out[r * 4..(r + 1) * 4]
                .iter()
                .all(|&v| (1e-10..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_softmax_underflow_emits_uniform() {
        let e = engine();
        let x = tensor(&[1, 4], &[f32::NEG_INFINITY; 4]);
        let mut out = e.create(&[1, 4]).unwrap();
        e.softmax(&x, &mut out).unwrap();
        for v in data(&out) {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_norm() {
        let e = engine();
        let mut x = tensor(&[1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let gamma = tensor(&[4], &[1.0, 1.0, 1.0, 1.0]);
        let beta = tensor(&[4], &[0.0, 0.0, 0.0, 0.0]);
        e.layer_norm(&mut x, &gamma, &beta, 1e-5).unwrap();
        let out = data(&x);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        // std of [1,2,3,4] is sqrt(1.25)
        let expect = (1.0f32 - 2.5) / 1.25f32.sqrt();
        assert!((out[0] - expect).abs() < 1e-4);
        assert!((out[3] + expect).abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_affine() {
        let e = engine();
        let mut x = tensor(&[2, 2], &[1.0, 3.0, -2.0, 2.0]);
        let gamma = tensor(&[2], &[2.0, 2.0]);
        let beta = tensor(&[2], &[1.0, -1.0]);
        e.layer_norm(&mut x, &gamma, &beta, 1e-5).unwrap();
        let out = data(&x);
        // each row normalizes to [-1, 1], then *2 and +-1
        assert!((out[0] + 1.0).abs() < 1e-3);
        assert!((out[1] - 1.0).abs() < 1e-3);
        assert!((out[2] + 1.0).abs() < 1e-3);
        assert!((out[3] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_lookup_and_scatter_add() {
        let e = engine();
        let table = tensor(
            &[4, 3],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
        );
        let mut row = e.create(&[1, 3]).unwrap();
        e.lookup(&table, 2, &mut row).unwrap();
        assert_eq!(data(&row), vec![7.0, 8.0, 9.0]);

        let mut grad = e.create(&[4, 3]).unwrap();
        let delta = tensor(&[1, 3], &[0.5, 0.5, 0.5]);
        e.accumulate_gradient(&mut grad, &delta, 2).unwrap();
        let g = data(&grad);
        assert_eq!(&g[6..9], &[0.5, 0.5, 0.5]);
        assert!(g[..6].iter().all(|&v| v == 0.0));
        assert!(g[9..].iter().all(|&v| v == 0.0));

        assert!(e.lookup(&table, 4, &mut row).is_err());
        assert!(e.accumulate_gradient(&mut grad, &delta, 4).is_err());
    }

    #[test]
    fn test_one_hot() {
        let e = engine();
        let t = e.one_hot(&[1, 0], 3).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(data(&t), vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        assert!(e.one_hot(&[3], 3).is_err());
        assert!(e.one_hot(&[-1], 3).is_err());
    }

    #[test]
    fn test_row_slice_and_set() {
        let e = engine();
        let src = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut row = e.create(&[1, 3]).unwrap();
        e.slice_row(&src, 1, &mut row).unwrap();
        assert_eq!(data(&row), vec![4.0, 5.0, 6.0]);

        let mut dst = e.create(&[2, 3]).unwrap();
        e.set_row(&mut dst, 0, &row).unwrap();
        assert_eq!(data(&dst), vec![4.0, 5.0, 6.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_clip_scale_sanitize() {
        let e = engine();
        let mut x = tensor(&[4], &[-3.0, 0.5, 3.0, 1.0]);
        e.clip(&mut x, -1.0, 1.0).unwrap();
        assert_eq!(data(&x), vec![-1.0, 0.5, 1.0, 1.0]);
        e.scale(&mut x, 2.0).unwrap();
        assert_eq!(data(&x), vec![-2.0, 1.0, 2.0, 2.0]);

        let mut y = Tensor::Host(
            HostTensor::from_vec(&[4], vec![f32::NAN, f32::INFINITY, -7.0, 0.001]).unwrap(),
        );
        e.sanitize_and_clip(&mut y, 0.005).unwrap();
        assert_eq!(data(&y), vec![0.0, 0.0, -0.005, 0.001]);
    }

    #[test]
    fn test_sum_of_squares() {
        let e = engine();
        let x = tensor(&[3], &[3.0, 4.0, 0.0]);
        assert!((e.sum_of_squares(&x).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_adam_single_step() {
        let e = engine();
        let mut p = tensor(&[1], &[1.0]);
        let g = tensor(&[1], &[0.1]);
        let mut m = e.create(&[1]).unwrap();
        let mut v = e.create(&[1]).unwrap();
        e.adam_update(&mut p, &g, &mut m, &mut v, 0.01, 0.9, 0.999, 1e-8, 1)
            .unwrap();
        assert!((data(&p)[0] - 0.99).abs() < 1e-4);
        assert!((data(&m)[0] - 0.01).abs() < 1e-7);
        assert!((data(&v)[0] - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn test_adam_moments_converge_to_constant_gradient() {
        let e = engine();
        let mut p = tensor(&[1], &[0.0]);
        let g = tensor(&[1], &[0.25]);
        let mut m = e.create(&[1]).unwrap();
        let mut v = e.create(&[1]).unwrap();
        for t in 1..=8000 {
            e.adam_update(&mut p, &g, &mut m, &mut v, 1e-4, 0.9, 0.999, 1e-8, t)
                .unwrap();
        }
        let m = data(&m)[0];
        let v = data(&v)[0];
        assert!((m - 0.25).abs() / 0.25 < 1e-3, "m = {m}");
        assert!((v - 0.0625).abs() / 0.0625 < 1e-3, "v = {v}");
    }

    #[test]
    fn test_adam_survives_adversarial_inputs() {
        let e = engine();
        let mut p = tensor(&[3], &[1.0, 1.0, 1.0]);
        let g = Tensor::Host(
            HostTensor::from_vec(&[3], vec![f32::NAN, f32::INFINITY, 1e30]).unwrap(),
        );
        let mut m = e.create(&[3]).unwrap();
        let mut v = e.create(&[3]).unwrap();
        e.adam_update(&mut p, &g, &mut m, &mut v, 0.01, 0.9, 0.999, 1e-8, 1)
            .unwrap();
        assert!(data(&p).iter().all(|v| v.is_finite()));
        assert!(data(&m).iter().all(|v| v.is_finite()));
        assert!(data(&v).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_adam_step_is_clipped() {
        let e = engine();
        let mut p = tensor(&[1], &[0.0]);
        let g = tensor(&[1], &[1.0]);
        let mut m = e.create(&[1]).unwrap();
        let mut v = e.create(&[1]).unwrap();
        // enormous learning rate: the update must still be bounded by 0.1
        e.adam_update(&mut p, &g, &mut m, &mut v, 1000.0, 0.9, 0.999, 1e-8, 1)
            .unwrap();
        assert!((data(&p)[0] + 0.1).abs() < 1e-6);
    }
}
