//! Kernel event ingestion.
//!
//! The [`Tracer`] loads the precompiled instrumentation object matching the running
//! kernel, attaches its programs, and drains each perf event map on a dedicated
//! thread. Every record is decoded into an [`Event`] and fanned out to the
//! channels subscribed to its [`EventType`].

mod decode;
mod event;
mod program;
mod subscribers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libbpf_rs::{
    KprobeOpts, Link, MapCore, Object, ObjectBuilder, PerfBuffer, PerfBufferBuilder, ProgramType,
    TracepointCategory, TracepointOpts,
};
use tokio::sync::mpsc;

pub use decode::{DecodeError, MAX_PAYLOAD_SIZE, RecordKind, decode};
pub use event::{Event, EventReason, EventType, L7Request, Protocol};
pub use program::{PERF_MAPS, PerfMapSpec, ProgramImage, list_images, select_image};
pub use subscribers::Stats;
use subscribers::Subscribers;

use crate::proc::KernelVersion;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_TRACING_DIR: &str = "/sys/kernel/debug/tracing";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("unsupported kernel version: {0}")]
    UnsupportedKernelVersion(String),
    #[error("kernel tracing is not available at `{path}`: {source}")]
    TracingUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load instrumentation image `{path}`: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libbpf_rs::Error,
    },
    #[error("failed to open perf reader for map `{map}`: {source}")]
    OpenReader {
        map: &'static str,
        #[source]
        source: libbpf_rs::Error,
    },
    #[error("failed to spawn perf reader thread: {0}")]
    SpawnReader(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Directory holding `<arch>/v<MAJOR>.<MINOR>.o` images.
    pub ebpf_dir: PathBuf,
    pub tracing_dir: PathBuf,
    pub disable_l7: bool,
}

impl TracerConfig {
    pub fn new(ebpf_dir: impl Into<PathBuf>) -> Self {
        Self {
            ebpf_dir: ebpf_dir.into(),
            tracing_dir: PathBuf::from(DEFAULT_TRACING_DIR),
            disable_l7: false,
        }
    }
}

struct Reader {
    map: &'static str,
    buffer: PerfBuffer<'static>,
}

/// Owner of every kernel-side resource of the instrumentation.
pub struct Tracer {
    object: Option<Object>,
    links: Vec<Link>,
    uprobes: Vec<String>,
    readers: Vec<Reader>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    subscribers: Arc<Subscribers>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("loaded", &self.object.is_some())
            .field("links", &self.links.len())
            .field("uprobes", &self.uprobes)
            .field("readers", &self.readers.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Resolves the image to load for `kernel_release` on `arch` and verifies that
/// kernel tracing is available.
///
/// # Errors
///
/// Returns [`Error::UnsupportedArchitecture`], [`Error::UnsupportedKernelVersion`]
/// or [`Error::TracingUnavailable`].
pub fn resolve_image(config: &TracerConfig, arch: &str, kernel_release: &str) -> Result<ProgramImage> {
    let images = list_images(&config.ebpf_dir, arch)?;
    let kernel = KernelVersion::parse(kernel_release)
        .map_err(|_| Error::UnsupportedKernelVersion(kernel_release.to_owned()))?;
    let image = select_image(&images, kernel)
        .cloned()
        .ok_or_else(|| Error::UnsupportedKernelVersion(kernel_release.to_owned()))?;

    std::fs::metadata(&config.tracing_dir).map_err(|source| Error::TracingUnavailable {
        path: config.tracing_dir.clone(),
        source,
    })?;

    Ok(image)
}

impl Tracer {
    /// Loads and attaches the instrumentation for the running kernel.
    ///
    /// Programs whose attachment fails are skipped with a warning. A perf map that
    /// is missing from the image is skipped; one that fails to open aborts the load.
    ///
    /// # Errors
    ///
    /// See [`resolve_image`]; additionally [`Error::Load`] and [`Error::OpenReader`].
    pub fn new(kernel_release: &str, config: &TracerConfig) -> Result<Self> {
        let image = resolve_image(config, std::env::consts::ARCH, kernel_release)?;
        log::info!(
            "Loading instrumentation `{}` for kernel {}",
            image.path.display(),
            kernel_release
        );

        let mut tracer = Self {
            object: None,
            links: Vec::new(),
            uprobes: Vec::new(),
            readers: Vec::new(),
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(Subscribers::default()),
        };

        let mut object = load_object(&image.path)?;
        tracer.attach_programs(&mut object);
        let opened = tracer.open_readers(&object, config.disable_l7);
        tracer.object = Some(object);
        // On failure `tracer` is dropped here, which releases whatever was set up.
        opened?;

        log::info!(
            "Attached {} programs, retained {} uprobes, opened {} perf readers",
            tracer.links.len(),
            tracer.uprobes.len(),
            tracer.readers.len()
        );
        Ok(tracer)
    }

    fn attach_programs(&mut self, object: &mut Object) {
        for prog in object.progs_mut() {
            let name = prog.name().to_string_lossy().into_owned();
            let section = prog.section().to_string_lossy().into_owned();

            let link = match prog.prog_type() {
                ProgramType::Tracepoint => {
                    let Some((category, tp)) = program::tracepoint_target(&section) else {
                        log::warn!("program `{name}` has unexpected section `{section}`");
                        continue;
                    };
                    prog.attach_tracepoint_with_opts(
                        TracepointCategory::Custom(category.to_owned()),
                        tp,
                        TracepointOpts::default(),
                    )
                }
                ProgramType::Kprobe => {
                    if program::is_uprobe_section(&section) {
                        self.uprobes.push(name);
                        continue;
                    }
                    let Some((func, retprobe)) = program::kprobe_target(&section) else {
                        log::warn!("program `{name}` has unexpected section `{section}`");
                        continue;
                    };
                    prog.attach_kprobe_with_opts(retprobe, func, KprobeOpts::default())
                }
                other => {
                    log::debug!("not attaching program `{name}` of type {other:?}");
                    continue;
                }
            };

            match link {
                Ok(link) => {
                    log::debug!("attached `{name}` at `{section}`");
                    self.links.push(link);
                }
                Err(err) => log::warn!("failed to attach `{name}` at `{section}`: {err}"),
            }
        }
    }

    fn open_readers(&mut self, object: &Object, disable_l7: bool) -> Result<()> {
        for spec in PERF_MAPS {
            if disable_l7 && spec.kind == RecordKind::L7 {
                log::info!("L7 tracing disabled, not opening `{}`", spec.name);
                continue;
            }
            let Some(map) = object.maps().find(|m| m.name() == spec.name) else {
                log::warn!("perf map `{}` not found in image", spec.name);
                continue;
            };

            let sample_subs = Arc::clone(&self.subscribers);
            let lost_subs = Arc::clone(&self.subscribers);
            let buffer = PerfBufferBuilder::new(&map)
                .pages(spec.pages)
                .sample_cb(move |_cpu: i32, data: &[u8]| match decode(spec.kind, data) {
                    Ok(Some(event)) => sample_subs.dispatch(event),
                    Ok(None) => {}
                    Err(err) => log::warn!("failed to decode record from `{}`: {}", spec.name, err),
                })
                .lost_cb(move |cpu: i32, count: u64| {
                    log::error!("{} lost {} samples on cpu {}", spec.name, count, cpu);
                    lost_subs.record_lost(count);
                })
                .build()
                .map_err(|source| Error::OpenReader {
                    map: spec.name,
                    source,
                })?;
            self.readers.push(Reader {
                map: spec.name,
                buffer,
            });
        }
        Ok(())
    }

    /// Registers `tx` as a recipient of events of type `kind`.
    ///
    /// Safe to call while readers are running.
    pub fn subscribe(&self, kind: EventType, tx: mpsc::Sender<Arc<Event>>) {
        self.subscribers.subscribe(kind, tx);
    }

    /// Starts one reader thread per perf map. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpawnReader`] if a thread cannot be spawned.
    pub fn run(&mut self) -> Result<()> {
        for reader in self.readers.drain(..) {
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name(format!("perf-{}", reader.map))
                .spawn(move || poll_loop(reader, &stop))
                .map_err(Error::SpawnReader)?;
            self.workers.push(handle);
        }
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.subscribers.stats()
    }

    /// Releases probes, links, and readers in that order, then the loaded object.
    ///
    /// Blocks until every reader thread has exited. Calling it more than once is safe.
    pub fn close(&mut self) {
        self.uprobes.clear();
        for link in self.links.drain(..) {
            drop(link);
        }

        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("perf reader thread panicked");
            }
        }
        self.readers.clear();

        if self.object.take().is_some() {
            log::info!("Tracer closed: {:?}", self.subscribers.stats());
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.close();
    }
}

fn load_object(path: &Path) -> Result<Object> {
    let load_err = |source| Error::Load {
        path: path.to_path_buf(),
        source,
    };
    ObjectBuilder::default()
        .open_file(path)
        .map_err(load_err)?
        .load()
        .map_err(load_err)
}

fn poll_loop(reader: Reader, stop: &AtomicBool) {
    log::debug!("perf reader `{}` started", reader.map);
    while !stop.load(Ordering::Relaxed) {
        match reader.buffer.poll(POLL_TIMEOUT) {
            Ok(()) => {}
            Err(err) if err.kind() == libbpf_rs::ErrorKind::Interrupted => {}
            Err(err) => {
                log::error!("perf reader `{}` failed: {}", reader.map, err);
                break;
            }
        }
    }
    log::debug!("perf reader `{}` stopped", reader.map);
}
