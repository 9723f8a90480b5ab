pub mod controller;
pub mod device;
pub mod encoder;
pub mod loop_worker;

pub use controller::{FrameSampler, SamplerConfig};
pub use device::{CaptureDevice, CaptureStream, DirectoryDevice, UnavailableDevice};
pub use encoder::{encode_frame, to_data_url};
