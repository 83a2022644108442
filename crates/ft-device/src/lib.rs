#![forbid(unsafe_code)]

//! The device-runtime collaborator the dispatch core launches kernels on.
//!
//! A runtime owns device buffers and runs named kernels with positional
//! arguments. [`CpuDevice`] is the host implementation: it executes the
//! kernels of `ft-kernel-cpu` synchronously.

mod cpu;

use std::collections::BTreeMap;
use std::fmt;

use ft_core::{DType, Device};
use ft_kernel_cpu::{KernelError, XorwowState};
use ft_view::TensorView5;

pub use cpu::CpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// One kernel launch: source, entry point, launch grid and compile-time
/// definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub kernel_file: String,
    pub kernel_name: String,
    pub local: [usize; 3],
    pub global: [usize; 3],
    pub build_params: BTreeMap<String, String>,
}

impl KernelInfo {
    /// Total work items in the launch grid.
    #[must_use]
    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    /// An optional buffer the caller did not supply.
    Null,
    View(TensorView5),
    Scalar(f64),
    Count(u64),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    Mismatch {
        expected: Device,
        actual: Device,
    },
    UnknownBuffer(BufferId),
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    SizeMismatch {
        buffer: BufferId,
        expected: usize,
        actual: usize,
    },
    UnknownKernel {
        name: String,
    },
    BadArgument {
        kernel: String,
        index: usize,
        expected: &'static str,
    },
    Aliased {
        buffer: BufferId,
    },
    Kernel {
        kernel: String,
        source: KernelError,
    },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
            Self::UnknownBuffer(id) => write!(f, "unknown buffer {id}"),
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of device memory: requested {requested} bytes, {available} available"
            ),
            Self::SizeMismatch {
                buffer,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch on {buffer}: expected {expected} elements, got {actual}"
            ),
            Self::UnknownKernel { name } => write!(f, "unknown kernel '{name}'"),
            Self::BadArgument {
                kernel,
                index,
                expected,
            } => write!(f, "kernel '{kernel}' argument {index}: expected {expected}"),
            Self::Aliased { buffer } => {
                write!(f, "{buffer} is bound both as input and output")
            }
            Self::Kernel { kernel, source } => write!(f, "kernel '{kernel}' failed: {source}"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Kernel { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Buffer management plus "run this kernel with these arguments".
pub trait DeviceRuntime {
    fn device(&self) -> Device;

    /// Zero-initialized buffer of `len` elements.
    fn allocate(&mut self, dtype: DType, len: usize) -> Result<BufferId, DeviceError>;

    fn release(&mut self, id: BufferId) -> Result<(), DeviceError>;

    fn write(&mut self, id: BufferId, values: &[f64]) -> Result<(), DeviceError>;

    fn read(&self, id: BufferId) -> Result<Vec<f64>, DeviceError>;

    /// Element count of a value buffer.
    fn buffer_len(&self, id: BufferId) -> Result<usize, DeviceError>;

    /// Allocated size of a value buffer in bytes.
    fn buffer_bytes(&self, id: BufferId) -> Result<usize, DeviceError>;

    /// Places a generator-state pool on the device.
    fn upload_states(&mut self, states: &[XorwowState]) -> Result<BufferId, DeviceError>;

    fn state_count(&self, id: BufferId) -> Result<usize, DeviceError>;

    fn run(&mut self, kernel: &KernelInfo, args: &[KernelArg]) -> Result<(), DeviceError>;

    /// Waits for every launched kernel to complete.
    fn synchronize(&mut self) -> Result<(), DeviceError>;

    fn upload(&mut self, dtype: DType, values: &[f64]) -> Result<BufferId, DeviceError> {
        let id = self.allocate(dtype, values.len())?;
        self.write(id, values)?;
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_runtime(&self, runtime: &dyn DeviceRuntime) -> Result<(), DeviceError> {
        let actual = runtime.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ft_core::Device;

    use super::{CpuDevice, DeviceError, DeviceGuard};

    #[test]
    fn guard_accepts_matching_runtime() {
        let device = CpuDevice::new();
        let guard = DeviceGuard::new(Device::Cpu);
        assert_eq!(guard.device(), Device::Cpu);
        assert!(guard.ensure_runtime(&device).is_ok());
    }

    #[test]
    fn guard_rejects_mismatched_runtime() {
        let device = CpuDevice::new();
        let guard = DeviceGuard::new(Device::Cuda);
        let err = guard
            .ensure_runtime(&device)
            .expect_err("cpu runtime on cuda guard should fail");
        assert!(matches!(
            err,
            DeviceError::Mismatch {
                expected: Device::Cuda,
                actual: Device::Cpu
            }
        ));
    }

    #[test]
    fn device_error_display() {
        let err = DeviceError::Mismatch {
            expected: Device::Cpu,
            actual: Device::Cuda,
        };
        let msg = format!("{err}");
        assert!(msg.contains("Cpu"));
        assert!(msg.contains("Cuda"));
        assert!(msg.contains("mismatch"));
    }
}
