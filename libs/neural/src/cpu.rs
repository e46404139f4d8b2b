//! Host reference backend.
//!
//! Mirrors every GPU kernel on plain `Vec<f32>` buffers. Row-wise maps run
//! on the rayon pool; each output row is written by exactly one task.

use rayon::prelude::*;

use crate::backend::{Activation, Backend, ElementwiseOp, GemmDims, ScalarOp, Transpose};
use crate::error::{NeuralError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

/// Logistic function that never evaluates `exp` of a positive argument
#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[inline]
pub(crate) fn sigmoid_prime(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

fn check_len(op: &'static str, buf: &[f32], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(NeuralError::Device(format!(
            "{op}: host buffer holds {} floats, kernel needs {len}",
            buf.len()
        )));
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Buffer = Vec<f32>;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn alloc(&self, len: usize) -> Result<Self::Buffer> {
        Ok(vec![0.0; len])
    }

    fn upload(&self, host: &[f32]) -> Result<Self::Buffer> {
        Ok(host.to_vec())
    }

    fn download(&self, buf: &Self::Buffer, out: &mut [f32]) -> Result<()> {
        check_len("download", buf, out.len())?;
        out.copy_from_slice(&buf[..out.len()]);
        Ok(())
    }

    fn write(&self, buf: &mut Self::Buffer, host: &[f32]) -> Result<()> {
        check_len("write", buf, host.len())?;
        buf[..host.len()].copy_from_slice(host);
        Ok(())
    }

    fn copy(&self, src: &Self::Buffer, dst: &mut Self::Buffer, len: usize) -> Result<()> {
        check_len("copy", src, len)?;
        check_len("copy", dst, len)?;
        dst[..len].copy_from_slice(&src[..len]);
        Ok(())
    }

    fn elementwise(
        &self,
        op: ElementwiseOp,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        check_len("elementwise", a, len)?;
        check_len("elementwise", b, len)?;
        check_len("elementwise", out, len)?;
        let f: fn(f32, f32) -> f32 = match op {
            ElementwiseOp::Add => |x, y| x + y,
            ElementwiseOp::Sub => |x, y| x - y,
            ElementwiseOp::Multiply => |x, y| x * y,
            ElementwiseOp::Divide => |x, y| x / y,
        };
        out[..len]
            .par_iter_mut()
            .zip(a[..len].par_iter().zip(b[..len].par_iter()))
            .for_each(|(o, (&x, &y))| *o = f(x, y));
        Ok(())
    }

    fn scalar(
        &self,
        op: ScalarOp,
        a: &Self::Buffer,
        scalar: f32,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        check_len("scalar", a, len)?;
        check_len("scalar", out, len)?;
        let f: fn(f32, f32) -> f32 = match op {
            ScalarOp::Multiply => |x, s| x * s,
            ScalarOp::Divide => |x, s| x / s,
            ScalarOp::Pow => |x, s| x.powf(s),
        };
        out[..len]
            .par_iter_mut()
            .zip(a[..len].par_iter())
            .for_each(|(o, &x)| *o = f(x, scalar));
        Ok(())
    }

    fn activation(
        &self,
        op: Activation,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        check_len("activation", a, len)?;
        check_len("activation", out, len)?;
        let f: fn(f32) -> f32 = match op {
            Activation::Sigmoid => sigmoid,
            Activation::SigmoidPrime => sigmoid_prime,
        };
        out[..len]
            .par_iter_mut()
            .zip(a[..len].par_iter())
            .for_each(|(o, &x)| *o = f(x));
        Ok(())
    }

    fn gemm(
        &self,
        mode: Transpose,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        dims: GemmDims,
    ) -> Result<()> {
        let GemmDims { m, k, n } = dims;
        check_len("gemm", a, m * k)?;
        check_len("gemm", b, k * n)?;
        check_len("gemm", out, m * n)?;

        out[..m * n]
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(row, out_row)| {
                for (col, cell) in out_row.iter_mut().enumerate() {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        let lhs = match mode {
                            Transpose::A => a[p * m + row],
                            _ => a[row * k + p],
                        };
                        let rhs = match mode {
                            Transpose::B => b[col * k + p],
                            _ => b[p * n + col],
                        };
                        acc += lhs * rhs;
                    }
                    *cell = acc;
                }
            });
        Ok(())
    }

    fn transpose(
        &self,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        check_len("transpose", a, rows * cols)?;
        check_len("transpose", out, rows * cols)?;
        out[..rows * cols]
            .par_chunks_mut(rows)
            .enumerate()
            .for_each(|(col, out_row)| {
                for (row, cell) in out_row.iter_mut().enumerate() {
                    *cell = a[row * cols + col];
                }
            });
        Ok(())
    }

    fn axpy(&self, alpha: f32, x: &Self::Buffer, y: &mut Self::Buffer, len: usize) -> Result<()> {
        check_len("axpy", x, len)?;
        check_len("axpy", y, len)?;
        y[..len]
            .par_iter_mut()
            .zip(x[..len].par_iter())
            .for_each(|(y, &x)| *y += alpha * x);
        Ok(())
    }

    fn sum(&self, a: &Self::Buffer, len: usize) -> Result<f32> {
        check_len("sum", a, len)?;
        // Sequential f64 accumulation keeps the result independent of the pool size
        Ok(a[..len].iter().map(|&v| f64::from(v)).sum::<f64>() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, epsilon: f32) -> bool {
        (a - b).abs() < epsilon
    }

    fn vec_approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| approx_eq(*x, *y, epsilon))
    }

    #[test]
    fn test_gemm_simple() {
        let cpu = CpuBackend::new();
        // [[1, 2], [3, 4]] . [[5, 6], [7, 8]] = [[19, 22], [43, 50]]
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];
        let mut out = cpu.alloc(4).unwrap();

        cpu.gemm(Transpose::None, &a, &b, &mut out, GemmDims { m: 2, k: 2, n: 2 })
            .unwrap();

        assert!(vec_approx_eq(&out, &[19.0, 22.0, 43.0, 50.0], 1e-5), "{:?}", out);
    }

    #[test]
    fn test_gemm_transpose_a() {
        let cpu = CpuBackend::new();
        // a stored (2 x 3), read as (3 x 2); b is (2 x 1)
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![1.0, 1.0];
        let mut out = cpu.alloc(3).unwrap();

        cpu.gemm(Transpose::A, &a, &b, &mut out, GemmDims { m: 3, k: 2, n: 1 })
            .unwrap();

        assert!(vec_approx_eq(&out, &[5.0, 7.0, 9.0], 1e-5), "{:?}", out);
    }

    #[test]
    fn test_gemm_transpose_b() {
        let cpu = CpuBackend::new();
        // a is (1 x 3), b stored (2 x 3) and read as (3 x 2)
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0];
        let mut out = cpu.alloc(2).unwrap();

        cpu.gemm(Transpose::B, &a, &b, &mut out, GemmDims { m: 1, k: 3, n: 2 })
            .unwrap();

        assert!(vec_approx_eq(&out, &[1.0, 5.0], 1e-5), "{:?}", out);
    }

    #[test]
    fn test_transpose_rectangular() {
        let cpu = CpuBackend::new();
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = cpu.alloc(6).unwrap();

        cpu.transpose(&a, &mut out, 2, 3).unwrap();

        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_pow_negative_base() {
        let cpu = CpuBackend::new();
        let a = vec![-3.0, -0.5, 2.0];
        let mut out = cpu.alloc(3).unwrap();

        cpu.scalar(ScalarOp::Pow, &a, 2.0, &mut out, 3).unwrap();

        assert!(vec_approx_eq(&out, &[9.0, 0.25, 4.0], 1e-6), "{:?}", out);
    }

    #[test]
    fn test_sigmoid_extremes_are_finite() {
        for x in [-1000.0f32, -88.0, -20.0, 0.0, 20.0, 88.0, 1000.0] {
            let s = sigmoid(x);
            let d = sigmoid_prime(x);
            assert!(s.is_finite() && (0.0..=1.0).contains(&s), "sigmoid({x}) = {s}");
            assert!(d.is_finite() && d >= 0.0, "sigmoid'({x}) = {d}");
        }
        assert!(approx_eq(sigmoid(0.0), 0.5, 1e-7));
        assert!(approx_eq(sigmoid_prime(0.0), 0.25, 1e-7));
    }

    #[test]
    fn test_axpy_sgd_update() {
        let cpu = CpuBackend::new();
        let gradients = vec![0.5, -1.0, 2.0];
        let mut weights = vec![1.0, 1.0, 1.0];

        cpu.axpy(-0.1, &gradients, &mut weights, 3).unwrap();

        assert!(vec_approx_eq(&weights, &[0.95, 1.1, 0.8], 1e-6), "{:?}", weights);
    }

    #[test]
    fn test_sum_large_buffer() {
        let cpu = CpuBackend::new();
        let a = vec![0.1f32; 100_000];

        let total = cpu.sum(&a, a.len()).unwrap();

        assert!(approx_eq(total, 10_000.0, 1e-1), "{}", total);
    }

    #[test]
    fn test_short_buffer_is_device_error() {
        let cpu = CpuBackend::new();
        let a = vec![1.0; 2];
        let mut out = vec![0.0; 4];

        let err = cpu
            .activation(Activation::Sigmoid, &a, &mut out, 4)
            .unwrap_err();

        assert!(err.is_fatal());
    }
}
