//! Display and capture surfaces.
//!
//! Surfaces belong to an external provider; the engine only sees them
//! through these traits. `InMemorySurfaceProvider` keeps everything in
//! process and is what a server uses unless told otherwise.

use super::element::Sample;
use super::graph::GraphFeeder;
use crate::error::{CodecError, Result};
use crate::format::{keys, Format};
use crate::types::{BufferFlag, SurfaceHandle};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Crop rectangle applied when rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl CropRect {
    /// Build from the crop keys of a parameter update, if any are present.
    pub fn from_format(params: &Format, current: Option<CropRect>) -> Option<CropRect> {
        let crop_keys = [
            keys::CROP_LEFT,
            keys::CROP_TOP,
            keys::CROP_RIGHT,
            keys::CROP_BOTTOM,
        ];
        if !crop_keys.iter().any(|k| params.contains_key(k)) {
            return None;
        }
        let base = current.unwrap_or_default();
        Some(CropRect {
            left: params.get_i32(keys::CROP_LEFT).unwrap_or(base.left),
            top: params.get_i32(keys::CROP_TOP).unwrap_or(base.top),
            right: params.get_i32(keys::CROP_RIGHT).unwrap_or(base.right),
            bottom: params.get_i32(keys::CROP_BOTTOM).unwrap_or(base.bottom),
        })
    }
}

/// A surface that produces frames into an encoder.
pub trait InputSurface: Send + Sync {
    fn connect(&self, feeder: GraphFeeder);
    fn disconnect(&self);
    fn set_parameter(&self, _params: &Format) {}
}

/// A surface that displays decoded frames.
pub trait OutputSurface: Send + Sync {
    fn render(&self, frame: &[u8], pts_us: i64) -> Result<()>;
    fn set_crop(&self, crop: CropRect);
}

/// Source of surfaces, supplied to the server at construction.
pub trait SurfaceProvider: Send + Sync {
    fn create_input_surface(&self, format: &Format)
        -> Result<(SurfaceHandle, Arc<dyn InputSurface>)>;

    fn output_surface(&self, handle: SurfaceHandle) -> Result<Arc<dyn OutputSurface>>;
}

/// Input surface whose frames are queued by in-process code.
pub struct InMemoryInputSurface {
    format: Format,
    feeder: Mutex<Option<GraphFeeder>>,
}

impl InMemoryInputSurface {
    pub fn format(&self) -> &Format {
        &self.format
    }

    /// Push one raw frame into the connected encoder.
    pub fn queue_frame(&self, frame: impl Into<Bytes>, pts_us: i64) -> Result<()> {
        let feeder = self
            .feeder
            .lock()
            .expect("input surface lock poisoned")
            .clone()
            .ok_or_else(|| CodecError::not_permitted("queue_frame", "disconnected surface"))?;
        feeder.push(
            Sample {
                data: frame.into(),
                pts_us,
                flags: BufferFlag::NONE,
            },
            None,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.feeder
            .lock()
            .expect("input surface lock poisoned")
            .is_some()
    }
}

impl InputSurface for InMemoryInputSurface {
    fn connect(&self, feeder: GraphFeeder) {
        *self.feeder.lock().expect("input surface lock poisoned") = Some(feeder);
    }

    fn disconnect(&self) {
        self.feeder
            .lock()
            .expect("input surface lock poisoned")
            .take();
    }
}

/// A frame that reached an output surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFrame {
    pub pts_us: i64,
    pub size: usize,
    pub crop: Option<CropRect>,
}

/// Output surface that records what it was asked to display.
#[derive(Default)]
pub struct InMemoryOutputSurface {
    frames: Mutex<Vec<RenderedFrame>>,
    crop: Mutex<Option<CropRect>>,
}

impl InMemoryOutputSurface {
    pub fn rendered(&self) -> Vec<RenderedFrame> {
        self.frames
            .lock()
            .expect("output surface lock poisoned")
            .clone()
    }
}

impl OutputSurface for InMemoryOutputSurface {
    fn render(&self, frame: &[u8], pts_us: i64) -> Result<()> {
        let crop = *self.crop.lock().expect("output surface lock poisoned");
        self.frames
            .lock()
            .expect("output surface lock poisoned")
            .push(RenderedFrame {
                pts_us,
                size: frame.len(),
                crop,
            });
        Ok(())
    }

    fn set_crop(&self, crop: CropRect) {
        *self.crop.lock().expect("output surface lock poisoned") = Some(crop);
    }
}

/// Provider keeping all surfaces in this process.
#[derive(Default)]
pub struct InMemorySurfaceProvider {
    next_id: AtomicU64,
    inputs: Mutex<HashMap<SurfaceHandle, Arc<InMemoryInputSurface>>>,
    outputs: Mutex<HashMap<SurfaceHandle, Arc<InMemoryOutputSurface>>>,
}

impl InMemorySurfaceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&self) -> SurfaceHandle {
        SurfaceHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a display surface that decoders may render to.
    pub fn create_output_surface(&self) -> SurfaceHandle {
        let handle = self.allocate_handle();
        self.outputs
            .lock()
            .expect("surface registry lock poisoned")
            .insert(handle, Arc::new(InMemoryOutputSurface::default()));
        debug!("Created output {}", handle);
        handle
    }

    pub fn input_surface(&self, handle: SurfaceHandle) -> Option<Arc<InMemoryInputSurface>> {
        self.inputs
            .lock()
            .expect("surface registry lock poisoned")
            .get(&handle)
            .cloned()
    }

    pub fn output(&self, handle: SurfaceHandle) -> Option<Arc<InMemoryOutputSurface>> {
        self.outputs
            .lock()
            .expect("surface registry lock poisoned")
            .get(&handle)
            .cloned()
    }
}

impl SurfaceProvider for InMemorySurfaceProvider {
    fn create_input_surface(
        &self,
        format: &Format,
    ) -> Result<(SurfaceHandle, Arc<dyn InputSurface>)> {
        let handle = self.allocate_handle();
        let surface = Arc::new(InMemoryInputSurface {
            format: format.clone(),
            feeder: Mutex::new(None),
        });
        self.inputs
            .lock()
            .expect("surface registry lock poisoned")
            .insert(handle, surface.clone());
        debug!("Created input {}", handle);
        Ok((handle, surface))
    }

    fn output_surface(&self, handle: SurfaceHandle) -> Result<Arc<dyn OutputSurface>> {
        let surface: Arc<dyn OutputSurface> = self
            .output(handle)
            .ok_or_else(|| CodecError::invalid_value(format!("unknown {}", handle)))?;
        Ok(surface)
    }
}
