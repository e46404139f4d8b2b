//! Dense row-major `f32` matrices living in a backend's memory.
//!
//! Every operation is an associated function that validates shapes on the
//! host, then writes into a caller-supplied output. Outputs are meant to be
//! allocated once and overwritten every iteration. Inputs and outputs can
//! never alias, so in-place updates go through [`Matrix::axpy`].

use std::fmt;
use std::sync::Arc;

use crate::backend::{Activation, Backend, ElementwiseOp, GemmDims, ScalarOp, Transpose};
use crate::error::{NeuralError, Result};

pub struct Matrix<B: Backend> {
    rows: usize,
    columns: usize,
    backend: Arc<B>,
    buffer: Option<B::Buffer>,
}

impl<B: Backend> Matrix<B> {
    /// Zero-filled matrix
    pub fn zeros(backend: &Arc<B>, rows: usize, columns: usize) -> Result<Self> {
        check_dims("zeros", rows, columns)?;
        let buffer = backend.alloc(rows * columns)?;
        Ok(Self {
            rows,
            columns,
            backend: Arc::clone(backend),
            buffer: Some(buffer),
        })
    }

    /// Copy a row-major host array to the device
    pub fn from_data(backend: &Arc<B>, rows: usize, columns: usize, data: &[f32]) -> Result<Self> {
        check_dims("from_data", rows, columns)?;
        if data.len() != rows * columns {
            return Err(NeuralError::shape(
                "from_data",
                format!("{} values for a {rows}x{columns} matrix", data.len()),
            ));
        }
        let buffer = backend.upload(data)?;
        Ok(Self {
            rows,
            columns,
            backend: Arc::clone(backend),
            buffer: Some(buffer),
        })
    }

    /// Build a matrix from `f(row, column)`, evaluated in row-major order
    pub fn from_fn<F>(backend: &Arc<B>, rows: usize, columns: usize, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        check_dims("from_fn", rows, columns)?;
        let mut data = Vec::with_capacity(rows * columns);
        for row in 0..rows {
            for column in 0..columns {
                data.push(f(row, column));
            }
        }
        Self::from_data(backend, rows, columns, &data)
    }

    /// Deep copy, performed on the device
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::zeros(&self.backend, self.rows, self.columns)?;
        Self::copy(self, &mut copy)?;
        Ok(copy)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn size(&self) -> usize {
        self.rows * self.columns
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.columns)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Blocking read of every value, row-major
    pub fn data(&self) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.size()];
        self.backend.download(self.buffer()?, &mut out)?;
        Ok(out)
    }

    /// Overwrite every value from a row-major host array
    pub fn set_data(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.size() {
            return Err(NeuralError::shape(
                "set_data",
                format!("{} values for a {}x{} matrix", data.len(), self.rows, self.columns),
            ));
        }
        let backend = Arc::clone(&self.backend);
        backend.write(self.buffer_mut()?, data)
    }

    /// Change the shape. The buffer is only reallocated, and zeroed, when the
    /// element count changes; otherwise the contents are kept.
    pub fn resize(&mut self, rows: usize, columns: usize) -> Result<()> {
        check_dims("resize", rows, columns)?;
        self.buffer()?;
        if rows * columns != self.size() {
            self.buffer = Some(self.backend.alloc(rows * columns)?);
        }
        self.rows = rows;
        self.columns = columns;
        Ok(())
    }

    /// Free the device buffer now. Releasing twice is a no-op; any other use
    /// afterwards is a state error.
    pub fn release(&mut self) {
        self.buffer = None;
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    /// Compare every value against `other` within `tolerance`
    pub fn approx_eq(&self, other: &Self, tolerance: f32) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        let (a, b) = (self.data()?, other.data()?);
        Ok(a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tolerance))
    }

    fn buffer(&self) -> Result<&B::Buffer> {
        self.buffer.as_ref().ok_or_else(released)
    }

    fn buffer_mut(&mut self) -> Result<&mut B::Buffer> {
        self.buffer.as_mut().ok_or_else(released)
    }

    fn same_backend(&self, op: &'static str, other: &Self) -> Result<()> {
        if !Arc::ptr_eq(&self.backend, &other.backend) {
            return Err(NeuralError::Device(format!(
                "{op}: operands live on different backends ({} and {})",
                self.backend.name(),
                other.backend.name()
            )));
        }
        Ok(())
    }

    fn expect_shape(&self, op: &'static str, role: &str, rows: usize, columns: usize) -> Result<()> {
        if self.shape() != (rows, columns) {
            return Err(NeuralError::shape(
                op,
                format!(
                    "{role} is {}x{}, expected {rows}x{columns}",
                    self.rows, self.columns
                ),
            ));
        }
        Ok(())
    }

    /// Matrix product into `out`. At most one operand may be transposed.
    ///
    /// | mode       | requires              | `out` shape            |
    /// |------------|-----------------------|------------------------|
    /// | plain      | `a.columns == b.rows` | `(a.rows, b.columns)`  |
    /// | transpose A| `a.rows == b.rows`    | `(a.columns, b.columns)` |
    /// | transpose B| `a.columns == b.columns` | `(a.rows, b.rows)`  |
    pub fn dot(a: &Self, b: &Self, out: &mut Self, transpose_a: bool, transpose_b: bool) -> Result<()> {
        const OP: &str = "dot";
        let (mode, dims) = match (transpose_a, transpose_b) {
            (false, false) => {
                if a.columns != b.rows {
                    return Err(NeuralError::shape(
                        OP,
                        format!("{}x{} . {}x{}", a.rows, a.columns, b.rows, b.columns),
                    ));
                }
                (Transpose::None, GemmDims { m: a.rows, k: a.columns, n: b.columns })
            }
            (true, false) => {
                if a.rows != b.rows {
                    return Err(NeuralError::shape(
                        OP,
                        format!("({}x{})^T . {}x{}", a.rows, a.columns, b.rows, b.columns),
                    ));
                }
                (Transpose::A, GemmDims { m: a.columns, k: a.rows, n: b.columns })
            }
            (false, true) => {
                if a.columns != b.columns {
                    return Err(NeuralError::shape(
                        OP,
                        format!("{}x{} . ({}x{})^T", a.rows, a.columns, b.rows, b.columns),
                    ));
                }
                (Transpose::B, GemmDims { m: a.rows, k: a.columns, n: b.rows })
            }
            (true, true) => {
                return Err(NeuralError::shape(OP, "both operands transposed"));
            }
        };
        if dims.m == 0 || dims.k == 0 || dims.n == 0 {
            return Err(NeuralError::shape(OP, "zero-sized dimension"));
        }
        out.expect_shape(OP, "output", dims.m, dims.n)?;
        a.same_backend(OP, b)?;
        a.same_backend(OP, out)?;

        let backend = Arc::clone(&a.backend);
        backend.gemm(mode, a.buffer()?, b.buffer()?, out.buffer_mut()?, dims)
    }

    fn elementwise(op_name: &'static str, op: ElementwiseOp, a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        b.expect_shape(op_name, "right operand", a.rows, a.columns)?;
        out.expect_shape(op_name, "output", a.rows, a.columns)?;
        a.same_backend(op_name, b)?;
        a.same_backend(op_name, out)?;

        let backend = Arc::clone(&a.backend);
        backend.elementwise(op, a.buffer()?, b.buffer()?, out.buffer_mut()?, a.size())
    }

    pub fn add(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        Self::elementwise("add", ElementwiseOp::Add, a, b, out)
    }

    pub fn sub(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        Self::elementwise("sub", ElementwiseOp::Sub, a, b, out)
    }

    /// Element-wise (Hadamard) product
    pub fn multiply(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        Self::elementwise("multiply", ElementwiseOp::Multiply, a, b, out)
    }

    /// Element-wise quotient with IEEE semantics for zero divisors
    pub fn divide(a: &Self, b: &Self, out: &mut Self) -> Result<()> {
        Self::elementwise("divide", ElementwiseOp::Divide, a, b, out)
    }

    fn scalar(op_name: &'static str, op: ScalarOp, a: &Self, scalar: f32, out: &mut Self) -> Result<()> {
        out.expect_shape(op_name, "output", a.rows, a.columns)?;
        a.same_backend(op_name, out)?;

        let backend = Arc::clone(&a.backend);
        backend.scalar(op, a.buffer()?, scalar, out.buffer_mut()?, a.size())
    }

    pub fn scale(a: &Self, scalar: f32, out: &mut Self) -> Result<()> {
        Self::scalar("scale", ScalarOp::Multiply, a, scalar, out)
    }

    pub fn divide_scalar(a: &Self, scalar: f32, out: &mut Self) -> Result<()> {
        Self::scalar("divide_scalar", ScalarOp::Divide, a, scalar, out)
    }

    pub fn pow(a: &Self, exponent: f32, out: &mut Self) -> Result<()> {
        Self::scalar("pow", ScalarOp::Pow, a, exponent, out)
    }

    fn activation(op_name: &'static str, op: Activation, a: &Self, out: &mut Self) -> Result<()> {
        out.expect_shape(op_name, "output", a.rows, a.columns)?;
        a.same_backend(op_name, out)?;

        let backend = Arc::clone(&a.backend);
        backend.activation(op, a.buffer()?, out.buffer_mut()?, a.size())
    }

    /// `1 / (1 + e^-x)`
    pub fn sigmoid(a: &Self, out: &mut Self) -> Result<()> {
        Self::activation("sigmoid", Activation::Sigmoid, a, out)
    }

    /// Derivative of the sigmoid, computed from the raw pre-activation
    pub fn sigmoid_prime(a: &Self, out: &mut Self) -> Result<()> {
        Self::activation("sigmoid_prime", Activation::SigmoidPrime, a, out)
    }

    pub fn transpose(a: &Self, out: &mut Self) -> Result<()> {
        out.expect_shape("transpose", "output", a.columns, a.rows)?;
        a.same_backend("transpose", out)?;

        let backend = Arc::clone(&a.backend);
        backend.transpose(a.buffer()?, out.buffer_mut()?, a.rows, a.columns)
    }

    /// In place `y += alpha * x`
    pub fn axpy(alpha: f32, x: &Self, y: &mut Self) -> Result<()> {
        y.expect_shape("axpy", "accumulator", x.rows, x.columns)?;
        x.same_backend("axpy", y)?;

        let backend = Arc::clone(&x.backend);
        backend.axpy(alpha, x.buffer()?, y.buffer_mut()?, x.size())
    }

    /// Device-to-device copy of every value
    pub fn copy(src: &Self, dst: &mut Self) -> Result<()> {
        dst.expect_shape("copy", "destination", src.rows, src.columns)?;
        src.same_backend("copy", dst)?;

        let backend = Arc::clone(&src.backend);
        backend.copy(src.buffer()?, dst.buffer_mut()?, src.size())
    }

    /// Sum over all elements
    pub fn sum(a: &Self) -> Result<f32> {
        a.backend.sum(a.buffer()?, a.size())
    }
}

fn check_dims(op: &'static str, rows: usize, columns: usize) -> Result<()> {
    if rows == 0 || columns == 0 {
        return Err(NeuralError::shape(op, format!("zero-sized {rows}x{columns} matrix")));
    }
    Ok(())
}

fn released() -> NeuralError {
    NeuralError::State("matrix buffer has been released".to_string())
}

impl<B: Backend> fmt::Debug for Matrix<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("columns", &self.columns)
            .field("backend", &self.backend.name())
            .field("released", &self.is_released())
            .finish()
    }
}

impl<B: Backend> fmt::Display for Matrix<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(data) = self.data() else {
            return write!(f, "<unreadable {}x{} matrix>", self.rows, self.columns);
        };
        for row in data.chunks(self.columns) {
            let cells: Vec<String> = row.iter().map(|v| format!("{v:.2}")).collect();
            writeln!(f, "[{}]", cells.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    fn cpu() -> Arc<CpuBackend> {
        Arc::new(CpuBackend::new())
    }

    fn vec_approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < epsilon)
    }

    #[test]
    fn test_zeros_and_shape() {
        let backend = cpu();
        let m = Matrix::zeros(&backend, 3, 4).unwrap();
        assert_eq!(m.shape(), (3, 4));
        assert_eq!(m.size(), 12);
        assert!(m.data().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_sized_matrix_rejected() {
        let backend = cpu();
        assert!(matches!(
            Matrix::zeros(&backend, 0, 4),
            Err(NeuralError::Shape { .. })
        ));
    }

    #[test]
    fn test_from_data_length_mismatch() {
        let backend = cpu();
        let err = Matrix::from_data(&backend, 2, 2, &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, NeuralError::Shape { op: "from_data", .. }));
    }

    #[test]
    fn test_from_fn_is_row_major() {
        let backend = cpu();
        let m = Matrix::from_fn(&backend, 2, 3, |r, c| (r * 10 + c) as f32).unwrap();
        assert_eq!(m.data().unwrap(), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_dot_plain() {
        let backend = cpu();
        let a = Matrix::from_data(&backend, 3, 4, &[1.0; 12]).unwrap();
        let b = Matrix::from_data(&backend, 4, 2, &[1.0; 8]).unwrap();
        let mut out = Matrix::zeros(&backend, 3, 2).unwrap();

        Matrix::dot(&a, &b, &mut out, false, false).unwrap();

        assert_eq!(out.data().unwrap(), vec![4.0; 6]);
    }

    #[test]
    fn test_dot_shape_contracts() {
        let backend = cpu();
        let a = Matrix::zeros(&backend, 2, 3).unwrap();
        let b = Matrix::zeros(&backend, 2, 4).unwrap();
        let mut out = Matrix::zeros(&backend, 3, 4).unwrap();

        // plain product needs a.columns == b.rows
        assert!(Matrix::dot(&a, &b, &mut out, false, false).is_err());
        // transpose A needs a.rows == b.rows and yields (a.columns, b.columns)
        assert!(Matrix::dot(&a, &b, &mut out, true, false).is_ok());
        // wrong output shape
        let mut wrong = Matrix::zeros(&backend, 4, 3).unwrap();
        assert!(matches!(
            Matrix::dot(&a, &b, &mut wrong, true, false),
            Err(NeuralError::Shape { op: "dot", .. })
        ));
    }

    #[test]
    fn test_dot_rejects_double_transpose() {
        let backend = cpu();
        let a = Matrix::zeros(&backend, 2, 2).unwrap();
        let b = Matrix::zeros(&backend, 2, 2).unwrap();
        let mut out = Matrix::zeros(&backend, 2, 2).unwrap();

        let err = Matrix::dot(&a, &b, &mut out, true, true).unwrap_err();
        assert!(matches!(err, NeuralError::Shape { .. }));
    }

    #[test]
    fn test_transpose_variants_match_explicit_transpose() {
        let backend = cpu();
        let a = Matrix::from_fn(&backend, 3, 2, |r, c| (r as f32) - 0.5 * c as f32 + 0.25).unwrap();
        let b = Matrix::from_fn(&backend, 3, 4, |r, c| ((r + 2 * c) % 5) as f32 * 0.3).unwrap();

        let mut at = Matrix::zeros(&backend, 2, 3).unwrap();
        Matrix::transpose(&a, &mut at).unwrap();
        let mut explicit = Matrix::zeros(&backend, 2, 4).unwrap();
        Matrix::dot(&at, &b, &mut explicit, false, false).unwrap();
        let mut fused = Matrix::zeros(&backend, 2, 4).unwrap();
        Matrix::dot(&a, &b, &mut fused, true, false).unwrap();
        assert!(fused.approx_eq(&explicit, 1e-5).unwrap());

        let mut bt = Matrix::zeros(&backend, 4, 3).unwrap();
        Matrix::transpose(&b, &mut bt).unwrap();
        let mut explicit = Matrix::zeros(&backend, 2, 4).unwrap();
        Matrix::dot(&at, &bt, &mut explicit, false, true).unwrap();
        let mut fused = Matrix::zeros(&backend, 2, 4).unwrap();
        Matrix::dot(&at, &b, &mut fused, false, false).unwrap();
        assert!(fused.approx_eq(&explicit, 1e-5).unwrap());

        let mut back = Matrix::zeros(&backend, 3, 2).unwrap();
        Matrix::transpose(&at, &mut back).unwrap();
        assert!(back.approx_eq(&a, 0.0).unwrap());
    }

    #[test]
    fn test_elementwise_requires_identical_shapes() {
        let backend = cpu();
        let a = Matrix::zeros(&backend, 2, 3).unwrap();
        let b = Matrix::zeros(&backend, 3, 2).unwrap();
        let mut out = Matrix::zeros(&backend, 2, 3).unwrap();

        for result in [
            Matrix::add(&a, &b, &mut out),
            Matrix::sub(&a, &b, &mut out),
            Matrix::multiply(&a, &b, &mut out),
            Matrix::divide(&a, &b, &mut out),
        ] {
            assert!(matches!(result, Err(NeuralError::Shape { .. })));
        }
    }

    #[test]
    fn test_elementwise_arithmetic() {
        let backend = cpu();
        let a = Matrix::from_data(&backend, 1, 3, &[6.0, -2.0, 3.0]).unwrap();
        let b = Matrix::from_data(&backend, 1, 3, &[2.0, 4.0, -1.5]).unwrap();
        let mut out = Matrix::zeros(&backend, 1, 3).unwrap();

        Matrix::add(&a, &b, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![8.0, 2.0, 1.5]);
        Matrix::sub(&a, &b, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![4.0, -6.0, 4.5]);
        Matrix::multiply(&a, &b, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![12.0, -8.0, -4.5]);
        Matrix::divide(&a, &b, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![3.0, -0.5, -2.0]);
    }

    #[test]
    fn test_scalar_variants() {
        let backend = cpu();
        let a = Matrix::from_data(&backend, 2, 1, &[-3.0, 0.5]).unwrap();
        let mut out = Matrix::zeros(&backend, 2, 1).unwrap();

        Matrix::scale(&a, 2.0, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![-6.0, 1.0]);
        Matrix::divide_scalar(&a, 2.0, &mut out).unwrap();
        assert_eq!(out.data().unwrap(), vec![-1.5, 0.25]);
        Matrix::pow(&a, 2.0, &mut out).unwrap();
        assert!(vec_approx_eq(&out.data().unwrap(), &[9.0, 0.25], 1e-6));
    }

    #[test]
    fn test_sigmoid_prime_matches_definition_at_extremes() {
        let backend = cpu();
        let xs = [-500.0, -40.0, -3.0, 0.0, 1.5, 40.0, 500.0];
        let a = Matrix::from_data(&backend, 1, xs.len(), &xs).unwrap();
        let mut s = Matrix::zeros(&backend, 1, xs.len()).unwrap();
        let mut d = Matrix::zeros(&backend, 1, xs.len()).unwrap();

        Matrix::sigmoid(&a, &mut s).unwrap();
        Matrix::sigmoid_prime(&a, &mut d).unwrap();

        let (s, d) = (s.data().unwrap(), d.data().unwrap());
        for (sv, dv) in s.iter().zip(d.iter()) {
            assert!(sv.is_finite() && dv.is_finite());
            assert!((dv - sv * (1.0 - sv)).abs() < 1e-7);
        }
    }

    #[test]
    fn test_sum_reduces_all_elements() {
        let backend = cpu();
        let a = Matrix::from_fn(&backend, 4, 5, |r, c| (r * 5 + c) as f32).unwrap();
        assert_eq!(Matrix::sum(&a).unwrap(), 190.0);
    }

    #[test]
    fn test_axpy_in_place() {
        let backend = cpu();
        let g = Matrix::from_data(&backend, 1, 2, &[1.0, -2.0]).unwrap();
        let mut w = Matrix::from_data(&backend, 1, 2, &[0.5, 0.5]).unwrap();

        Matrix::axpy(-0.5, &g, &mut w).unwrap();

        assert_eq!(w.data().unwrap(), vec![0.0, 1.5]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let backend = cpu();
        let mut m = Matrix::zeros(&backend, 2, 2).unwrap();

        m.release();
        m.release();

        assert!(m.is_released());
        assert!(matches!(m.data(), Err(NeuralError::State(_))));
        assert!(matches!(Matrix::sum(&m), Err(NeuralError::State(_))));
    }

    #[test]
    fn test_resize_keeps_buffer_when_size_unchanged() {
        let backend = cpu();
        let mut m = Matrix::from_data(&backend, 2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        m.resize(3, 2).unwrap();
        assert_eq!(m.shape(), (3, 2));
        assert_eq!(m.data().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        m.resize(3, 4).unwrap();
        assert_eq!(m.size(), 12);
        assert!(m.data().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_try_clone_is_deep() {
        let backend = cpu();
        let a = Matrix::from_data(&backend, 1, 2, &[1.0, 2.0]).unwrap();
        let mut b = a.try_clone().unwrap();

        b.set_data(&[5.0, 6.0]).unwrap();

        assert_eq!(a.data().unwrap(), vec![1.0, 2.0]);
        assert_eq!(b.data().unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_mixing_backends_is_device_error() {
        let a = Matrix::zeros(&cpu(), 1, 1).unwrap();
        let b = Matrix::zeros(&cpu(), 1, 1).unwrap();
        let mut out = Matrix::zeros(&cpu(), 1, 1).unwrap();

        assert!(matches!(Matrix::add(&a, &b, &mut out), Err(NeuralError::Device(_))));
    }

    #[test]
    fn test_display_two_decimals() {
        let backend = cpu();
        let m = Matrix::from_data(&backend, 2, 2, &[1.0, 0.5, -0.126, 3.0]).unwrap();
        assert_eq!(m.to_string(), "[1.00, 0.50]\n[-0.13, 3.00]\n");
    }
}
