// QEMU backend: argument assembly, qemu-img access, the per-instance
// state machine and the factory that wires them together.
pub mod config;
pub mod factory;
pub mod image;
pub mod vm;

pub use config::SUSPEND_TAG;
pub use factory::QemuFactory;
pub use image::{ImageOps, QemuImg};
pub use vm::QemuVirtualMachine;
