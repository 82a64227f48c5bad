use crate::{element_count, CoreError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaSlice, CudaStream};
#[cfg(feature = "cuda")]
use std::sync::Arc;

/// Host-resident tensor: shape metadata over a flat row-major `Vec<f32>`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn zeros(shape: &[usize]) -> Result<Self> {
        let count = element_count(shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            data: vec![0.0; count],
        })
    }

    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let count = element_count(shape)?;
        if count != data.len() {
            return Err(CoreError::InvalidArgument(format!(
                "buffer of {} elements does not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Device-resident tensor: shape metadata over a device buffer. The buffer
/// is released when the tensor is dropped; operations that must destroy a
/// tensor take it by value so a stale handle cannot be used afterwards.
#[cfg(feature = "cuda")]
pub struct DeviceTensor {
    shape: Vec<usize>,
    buf: CudaSlice<f32>,
    stream: Arc<CudaStream>,
}

#[cfg(feature = "cuda")]
impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("shape", &self.shape)
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(feature = "cuda")]
impl DeviceTensor {
    pub fn new(shape: &[usize], buf: CudaSlice<f32>, stream: Arc<CudaStream>) -> Result<Self> {
        let count = element_count(shape)?;
        if count != buf.len() {
            return Err(CoreError::InvalidArgument(format!(
                "device buffer of {} elements does not fill shape {:?}",
                buf.len(),
                shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            buf,
            stream,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn buf(&self) -> &CudaSlice<f32> {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut CudaSlice<f32> {
        &mut self.buf
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

/// A tensor on either backend. Engines accept only their own variant and
/// signal `InvalidArgument` for the other.
#[derive(Debug)]
pub enum Tensor {
    Host(HostTensor),
    #[cfg(feature = "cuda")]
    Device(DeviceTensor),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::Host(t) => t.shape(),
            #[cfg(feature = "cuda")]
            Tensor::Device(t) => t.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Tensor::Host(t) => t.len(),
            #[cfg(feature = "cuda")]
            Tensor::Device(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn is_device(&self) -> bool {
        match self {
            Tensor::Host(_) => false,
            #[cfg(feature = "cuda")]
            Tensor::Device(_) => true,
        }
    }

    /// Dimensions of a rank-2 tensor as `(rows, cols)`.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape() {
            [r, c] => Ok((*r, *c)),
            other => Err(CoreError::InvalidArgument(format!(
                "expected a rank-2 tensor, got shape {other:?}"
            ))),
        }
    }

    pub fn as_host(&self) -> Result<&HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t),
            #[cfg(feature = "cuda")]
            Tensor::Device(_) => Err(CoreError::InvalidArgument(
                "expected a host tensor, got a device tensor".to_string(),
            )),
        }
    }

    pub fn as_host_mut(&mut self) -> Result<&mut HostTensor> {
        match self {
            Tensor::Host(t) => Ok(t),
            #[cfg(feature = "cuda")]
            Tensor::Device(_) => Err(CoreError::InvalidArgument(
                "expected a host tensor, got a device tensor".to_string(),
            )),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn as_device(&self) -> Result<&DeviceTensor> {
        match self {
            Tensor::Device(t) => Ok(t),
            Tensor::Host(_) => Err(CoreError::InvalidArgument(
                "expected a device tensor, got a host tensor".to_string(),
            )),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn as_device_mut(&mut self) -> Result<&mut DeviceTensor> {
        match self {
            Tensor::Device(t) => Ok(t),
            Tensor::Host(_) => Err(CoreError::InvalidArgument(
                "expected a device tensor, got a host tensor".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_shape_invariant() {
        let t = HostTensor::zeros(&[2, 3]).unwrap();
        assert_eq!(t.len(), 6);
        assert!(HostTensor::from_vec(&[2, 3], vec![0.0; 5]).is_err());
        assert!(HostTensor::from_vec(&[], vec![]).is_err());
    }

    #[test]
    fn test_tensor_dims2() {
        let t = Tensor::Host(HostTensor::zeros(&[4, 7]).unwrap());
        assert_eq!(t.dims2().unwrap(), (4, 7));
        let v = Tensor::Host(HostTensor::zeros(&[4]).unwrap());
        assert!(v.dims2().is_err());
    }

    #[test]
    fn test_empty_tensor() {
        let t = Tensor::Host(HostTensor::zeros(&[0]).unwrap());
        assert!(t.is_empty());
        assert_eq!(t.rank(), 1);
    }
}
