//! The seam between [`Matrix`](crate::Matrix) and the memory its values live in.
//!
//! A backend owns buffers of `f32` and runs the fixed kernel set on them.
//! Buffers are always row-major. Shapes have already been validated by the
//! caller, so implementations only see element counts and dimensions.

use crate::error::Result;

/// Element-wise binary kernels: `out[i] = a[i] (op) b[i]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Multiply,
    Divide,
}

/// Kernels combining every element with one scalar: `out[i] = a[i] (op) s`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarOp {
    Multiply,
    Divide,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Sigmoid,
    /// `sigmoid(x) * (1 - sigmoid(x))`, evaluated from the pre-activation `x`
    SigmoidPrime,
}

/// Which operand of a matrix product is read transposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    None,
    /// `a` is stored `(k, m)` and read as its transpose
    A,
    /// `b` is stored `(n, k)` and read as its transpose
    B,
}

/// Dimensions of `out (m x n) = a (m x k) . b (k x n)`, after transposition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

pub trait Backend: Send + Sync + 'static {
    type Buffer: Send + Sync;

    /// Human readable name of the device, for logs
    fn name(&self) -> String;

    /// Allocate a zero-filled buffer of `len` floats
    fn alloc(&self, len: usize) -> Result<Self::Buffer>;
    fn upload(&self, host: &[f32]) -> Result<Self::Buffer>;
    /// Blocking read of the whole buffer; `out.len()` is the buffer length
    fn download(&self, buf: &Self::Buffer, out: &mut [f32]) -> Result<()>;
    fn write(&self, buf: &mut Self::Buffer, host: &[f32]) -> Result<()>;
    fn copy(&self, src: &Self::Buffer, dst: &mut Self::Buffer, len: usize) -> Result<()>;

    fn elementwise(
        &self,
        op: ElementwiseOp,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()>;

    fn scalar(
        &self,
        op: ScalarOp,
        a: &Self::Buffer,
        scalar: f32,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()>;

    fn activation(
        &self,
        op: Activation,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()>;

    fn gemm(
        &self,
        mode: Transpose,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        dims: GemmDims,
    ) -> Result<()>;

    /// `out (cols x rows) = transpose(a (rows x cols))`
    fn transpose(
        &self,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        rows: usize,
        cols: usize,
    ) -> Result<()>;

    /// In place `y += alpha * x`
    fn axpy(&self, alpha: f32, x: &Self::Buffer, y: &mut Self::Buffer, len: usize) -> Result<()>;

    /// Sum of the first `len` elements
    fn sum(&self, a: &Self::Buffer, len: usize) -> Result<f32>;
}
