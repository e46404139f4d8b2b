//! Device-resident buffers backing GPU matrices
//!
//! A [`GpuBuffer`] holds exactly `len` floats in a storage buffer that can be
//! bound to any kernel and copied in either direction. Dropping it releases
//! the device memory.

use crate::error::{NeuralError, Result};

/// A storage buffer with a known number of f32 elements
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl GpuBuffer {
    const USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
        .union(wgpu::BufferUsages::COPY_DST)
        .union(wgpu::BufferUsages::COPY_SRC);

    /// Create a zero-filled buffer of `len` floats
    pub fn new(device: &wgpu::Device, len: usize, label: &str) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: byte_len(len),
            usage: Self::USAGE,
            mapped_at_creation: false,
        });

        GpuBuffer { buffer, len }
    }

    /// Create a buffer initialized with `data`
    pub fn from_data(device: &wgpu::Device, data: &[f32], label: &str) -> Self {
        use wgpu::util::DeviceExt;

        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: Self::USAGE,
        });

        GpuBuffer {
            buffer,
            len: data.len(),
        }
    }

    /// Queue an upload of `data` into the start of this buffer
    pub fn write(&self, queue: &wgpu::Queue, data: &[f32]) -> Result<()> {
        if data.len() > self.len {
            return Err(NeuralError::Device(format!(
                "upload of {} floats into a buffer of {}",
                data.len(),
                self.len
            )));
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Number of f32 elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> u64 {
        byte_len(self.len)
    }
}

pub(crate) fn byte_len(len: usize) -> u64 {
    (len * std::mem::size_of::<f32>()) as u64
}

/// Copy `source` into a fresh staging buffer and block until it can be read
/// back into `dest`.
pub(crate) fn read_buffer_into_sync(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    source: &wgpu::Buffer,
    dest: &mut [f32],
) -> Result<()> {
    let size = byte_len(dest.len());
    let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Staging Buffer"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Readback Encoder"),
    });
    encoder.copy_buffer_to_buffer(source, 0, &staging_buffer, 0, size);
    queue.submit(Some(encoder.finish()));

    let buffer_slice = staging_buffer.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // The receiver only disappears if this function already returned
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    receiver
        .recv()
        .map_err(|e| NeuralError::Device(format!("buffer mapping was never signalled: {e}")))?
        .map_err(|e| NeuralError::Device(format!("buffer mapping failed: {e}")))?;

    {
        let mapped = buffer_slice.get_mapped_range();
        dest.copy_from_slice(bytemuck::cast_slice(&mapped));
    }
    staging_buffer.unmap();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuContext;

    fn setup() -> Option<GpuContext> {
        GpuContext::new().ok()
    }

    #[test]
    fn test_buffer_round_trip() {
        let Some(ctx) = setup() else { return };
        let data = vec![1.5, -2.0, 3.25, 0.0, 7.0];

        let buffer = GpuBuffer::from_data(ctx.device(), &data, "Round Trip");
        let mut out = vec![0.0; data.len()];
        read_buffer_into_sync(ctx.device(), ctx.queue(), buffer.buffer(), &mut out).unwrap();

        assert_eq!(out, data);
        assert_eq!(buffer.byte_size(), 20);
    }

    #[test]
    fn test_new_buffer_is_zeroed() {
        let Some(ctx) = setup() else { return };

        let buffer = GpuBuffer::new(ctx.device(), 6, "Zeroed");
        let mut out = vec![1.0; 6];
        read_buffer_into_sync(ctx.device(), ctx.queue(), buffer.buffer(), &mut out).unwrap();

        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let Some(ctx) = setup() else { return };

        let buffer = GpuBuffer::new(ctx.device(), 2, "Small");
        assert!(buffer.write(ctx.queue(), &[1.0, 2.0, 3.0]).is_err());
        assert!(buffer.write(ctx.queue(), &[1.0, 2.0]).is_ok());
    }
}
