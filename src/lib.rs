pub use burst_align as align;
pub use burst_core as core;
pub use burst_fusion as fusion;
pub use burst_imgproc as imgproc;
pub use burst_runtime as runtime;

pub use burst_runtime::{resume, submit_burst, JobHandle, JobOptions};
