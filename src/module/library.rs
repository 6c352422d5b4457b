//! Loadable module images.
//!
//! Images are registered with the [`LibraryManager`] and instantiated on first use. The
//! build info of an image decides the ABI: images built against an older API major use
//! the legacy binary interface, which this runtime does not host.

use super::{
    FragmentPosition, InputStreamBuffer, ModuleConfig, ModuleInterface, OutputStreamBuffer,
    ProcType, ProcessingMode, Sinks, Sources,
};
use crate::error::{Error, Result};
use crate::heap::{Heap, Zone, ZoneAlloc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// API major version of natively built modules.
pub const NATIVE_API_MAJOR: u16 = 5;

/// Module API version an image was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Build information found in an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub format: u32,
    pub api_version: ApiVersion,
}

/// Binary interface of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAbi {
    Native,
    Legacy,
}

impl BuildInfo {
    pub fn abi(&self) -> ModuleAbi {
        if self.api_version.major < NATIVE_API_MAJOR {
            ModuleAbi::Legacy
        } else {
            ModuleAbi::Native
        }
    }
}

/// Constructor of a module instance.
pub type ModuleEntry = Arc<dyn Fn() -> Box<dyn ModuleInterface> + Send + Sync>;

/// A registered image.
#[derive(Clone)]
pub struct LoadableImage {
    pub module_id: u32,
    pub name: String,
    pub build_info: BuildInfo,
    pub entry: ModuleEntry,
}

impl std::fmt::Debug for LoadableImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadableImage")
            .field("module_id", &self.module_id)
            .field("name", &self.name)
            .field("build_info", &self.build_info)
            .finish()
    }
}

struct Entry {
    image: LoadableImage,
    instances: Arc<AtomicUsize>,
}

/// Registry of loadable images.
pub struct LibraryManager {
    heap: Arc<Heap>,
    images: Mutex<HashMap<u32, Entry>>,
}

impl std::fmt::Debug for LibraryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryManager")
            .field("images", &self.images.lock().len())
            .finish()
    }
}

impl LibraryManager {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Add an image. EEXIST if its module id is taken.
    pub fn register(&self, image: LoadableImage) -> Result<()> {
        let mut images = self.images.lock();
        if images.contains_key(&image.module_id) {
            return Err(Error::Exists);
        }
        tracing::info!(module_id = image.module_id, name = %image.name, abi = ?image.build_info.abi(), "library image registered");
        images.insert(
            image.module_id,
            Entry {
                image,
                instances: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Remove an image. EBUSY while instances of it exist.
    pub fn unregister(&self, module_id: u32) -> Result<()> {
        let mut images = self.images.lock();
        let entry = images.get(&module_id).ok_or(Error::NoDevice)?;
        if entry.instances.load(Ordering::Acquire) > 0 {
            return Err(Error::Busy);
        }
        images.remove(&module_id);
        Ok(())
    }

    /// Live instances of `module_id`.
    pub fn instances(&self, module_id: u32) -> usize {
        self.images
            .lock()
            .get(&module_id)
            .map_or(0, |e| e.instances.load(Ordering::Acquire))
    }

    /// Instantiate `module_id`. EINVAL for an unknown image, EOPNOTSUPP for a legacy one.
    pub fn load(&self, module_id: u32) -> Result<LoadedModule> {
        let (image, instances) = {
            let images = self.images.lock();
            let entry = images
                .get(&module_id)
                .ok_or(Error::Invalid("module image not registered"))?;
            (entry.image.clone(), entry.instances.clone())
        };
        if image.build_info.abi() == ModuleAbi::Legacy {
            tracing::warn!(module_id, api = ?image.build_info.api_version, "legacy module ABI not supported");
            return Err(Error::NotSupported);
        }
        let charge = self.heap.alloc_for::<LoadedModule>(Zone::Runtime)?;
        let inner = (image.entry)();
        instances.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(module_id, name = %image.name, "module instantiated");
        Ok(LoadedModule {
            module_id,
            inner,
            instances,
            _charge: charge,
        })
    }
}

/// An instance of a native image. Forwards every call to the image's interface.
pub struct LoadedModule {
    module_id: u32,
    inner: Box<dyn ModuleInterface>,
    instances: Arc<AtomicUsize>,
    _charge: ZoneAlloc,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("module_id", &self.module_id)
            .field("proc_type", &self.inner.proc_type())
            .finish()
    }
}

impl LoadedModule {
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    pub fn modules_init(&mut self, cfg: &ModuleConfig) -> Result<()> {
        self.inner.init(cfg)
    }

    pub fn modules_prepare(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        self.inner.prepare(sources, sinks)
    }

    pub fn modules_process(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        self.inner.process(sources, sinks)
    }

    pub fn modules_process_audio_stream(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        self.inner.process_audio_stream(input, output)
    }

    pub fn modules_process_raw_data(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        self.inner.process_raw_data(input, output)
    }

    pub fn modules_set_configuration(
        &mut self,
        config_id: u32,
        pos: FragmentPosition,
        data_offset_size: usize,
        fragment: &[u8],
        response: &mut [u8],
    ) -> Result<()> {
        self.inner
            .set_configuration(config_id, pos, data_offset_size, fragment, response)
    }

    pub fn modules_reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    pub fn modules_free(&mut self) -> Result<()> {
        self.inner.free()
    }
}

impl ModuleInterface for LoadedModule {
    fn proc_type(&self) -> ProcType {
        self.inner.proc_type()
    }

    fn init(&mut self, cfg: &ModuleConfig) -> Result<()> {
        self.modules_init(cfg)
    }

    fn prepare(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        self.modules_prepare(sources, sinks)
    }

    fn process(&mut self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Result<()> {
        self.modules_process(sources, sinks)
    }

    fn process_audio_stream(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        self.modules_process_audio_stream(input, output)
    }

    fn process_raw_data(
        &mut self,
        input: &mut [InputStreamBuffer<'_>],
        output: &mut [OutputStreamBuffer<'_>],
    ) -> Result<()> {
        self.modules_process_raw_data(input, output)
    }

    fn set_configuration(
        &mut self,
        config_id: u32,
        pos: FragmentPosition,
        data_offset_size: usize,
        fragment: &[u8],
        response: &mut [u8],
    ) -> Result<()> {
        self.modules_set_configuration(config_id, pos, data_offset_size, fragment, response)
    }

    fn get_configuration(&mut self, config_id: u32, out: &mut Vec<u8>) -> Result<()> {
        self.inner.get_configuration(config_id, out)
    }

    fn set_processing_mode(&mut self, mode: ProcessingMode) -> Result<()> {
        self.inner.set_processing_mode(mode)
    }

    fn reset(&mut self) -> Result<()> {
        self.modules_reset()
    }

    fn free(&mut self) -> Result<()> {
        self.modules_free()
    }

    fn is_ready_to_process(&self, sources: &Sources<'_>, sinks: &Sinks<'_>) -> Option<bool> {
        self.inner.is_ready_to_process(sources, sinks)
    }

    fn deadline_us(&self) -> Option<u64> {
        self.inner.deadline_us()
    }

    fn lpt_us(&self) -> u64 {
        self.inner.lpt_us()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.instances.fetch_sub(1, Ordering::AcqRel);
    }
}
