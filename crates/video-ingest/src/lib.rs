//! Frame acquisition: capture devices, the bounded frame buffer, and the
//! capture loop that connects them.

use std::{io, thread};

pub mod buffer;
#[cfg(feature = "opencv")]
pub mod camera;
pub mod device;
pub mod source;
mod types;

pub use buffer::{DEFAULT_BUFFER_CAPACITY, DEFAULT_FRAME_INTERVAL, FrameBuffer};
#[cfg(feature = "opencv")]
pub use camera::OpenCvBackend;
pub use device::{CameraBackend, CaptureDevice, SyntheticBackend};
pub use source::{FrameSource, FrameSourceConfig, Heartbeat};
pub use types::{CaptureError, Frame, FrameFormat};

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
