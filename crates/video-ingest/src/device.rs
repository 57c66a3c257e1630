//! Capture device boundary.
//!
//! A [`CameraBackend`] opens devices by numeric id and hands back an owned
//! [`CaptureDevice`]. Dropping the device releases the underlying handle, so
//! whoever owns the box owns the hardware.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use crate::types::{CaptureError, Frame};

/// An open capture device. Dropping it releases the handle.
pub trait CaptureDevice: Send {
    /// Blocking read of the next frame.
    fn read(&mut self) -> Result<Frame, CaptureError>;
}

/// Factory for capture devices.
pub trait CameraBackend: Send + Sync {
    fn open(&self, device_id: i32) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

type FrameGenerator = dyn FnMut(u64) -> Result<Frame, CaptureError> + Send;

/// In-process backend whose frames come from a generator closure.
///
/// Used by the demo binary and by tests. The generator receives a frame
/// counter shared across reopen cycles so scripted sequences survive a device
/// reinitialisation. Only devices listed in `available` can be opened; the
/// list can be changed at any time to simulate a camera being unplugged.
/// Clones share all state.
#[derive(Clone)]
pub struct SyntheticBackend {
    available: Arc<Mutex<Vec<i32>>>,
    generator: Arc<Mutex<Box<FrameGenerator>>>,
    counter: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl SyntheticBackend {
    pub fn new<F>(available: Vec<i32>, generator: F) -> Self
    where
        F: FnMut(u64) -> Result<Frame, CaptureError> + Send + 'static,
    {
        Self {
            available: Arc::new(Mutex::new(available)),
            generator: Arc::new(Mutex::new(Box::new(generator))),
            counter: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Backend producing blank frames of the given size on device 0.
    pub fn blank(width: i32, height: i32) -> Self {
        let len = (width.max(0) * height.max(0) * 3) as usize;
        Self::new(vec![0], move |_| Ok(Frame::bgr(vec![0; len], width, height)))
    }

    /// Replace the set of devices that can be opened. Already open devices
    /// keep working until dropped.
    pub fn set_available(&self, available: Vec<i32>) {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner) = available;
    }

    /// Number of `open` calls so far, successful or not.
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of devices opened and not yet released.
    pub fn live_devices(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl CameraBackend for SyntheticBackend {
    fn open(&self, device_id: i32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&device_id);
        if !available {
            return Err(CaptureError::Open { device_id });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticDevice {
            device_id,
            generator: self.generator.clone(),
            counter: self.counter.clone(),
            live: self.live.clone(),
        }))
    }
}

struct SyntheticDevice {
    device_id: i32,
    generator: Arc<Mutex<Box<FrameGenerator>>>,
    counter: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) as u64;
        let mut generator = self
            .generator
            .lock()
            .map_err(|_| CaptureError::ReadTransient {
                device_id: self.device_id,
                reason: "generator lock poisoned".into(),
            })?;
        (generator)(index)
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
