//! The tracer object and the callbacks the host runtime drives it with.

use tracing_subscriber::EnvFilter;

use crate::config::*;
use crate::cpu::*;
use crate::error::*;
use crate::hooks::*;
use crate::host::*;
use crate::image::*;
use crate::insn::*;
use crate::planner::*;
use crate::probes::*;
use crate::trace::*;
use crate::writer::*;

/// Scratch registers claimed from the host when the tracer is created.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct ScratchRegs {
    /// Address of the next free trace entry.
    pub next: Reg,
    /// End of the trace buffer.
    pub end: Reg,
    /// `CPUID` input `EAX`.
    pub cpuid_eax: Reg,
    /// `CPUID` input `ECX`.
    pub cpuid_ecx: Reg,
}

impl ScratchRegs {
    /// Claims the four registers from the host.
    fn claim<H: Host + ?Sized>(host: &mut H) -> Result<Self> {
        let mut claim = || host.claim_scratch_reg().ok_or(HookError::NoScratchRegister);
        Ok(Self {
            next: claim()?,
            end: claim()?,
            cpuid_eax: claim()?,
            cpuid_ecx: claim()?,
        })
    }

    /// The registers holding the buffer pointers.
    pub fn buffer(&self) -> BufferRegs {
        BufferRegs {
            next: self.next,
            end: self.end,
        }
    }
}

/// What the host should do with an exception raised inside the tracer.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum ExceptionHandling {
    /// The exception was dealt with, execution can resume.
    Handled,
    /// The exception should be forwarded to the default handler.
    Unhandled,
}

/// Installs a stderr subscriber filtered by `RUST_LOG` (`info` by default), unless the
/// embedding application already installed one.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Main tracer structure.
///
/// # Role of the Tracer
///
/// The tracer reacts to the events of the host runtime:
///
///  * when an image is loaded, it is classified, logged to `<prefix>_images.log` and its
///    notification and allocator routines are hooked (see [`ImageHooks`]);
///  * when code is about to be executed for the first time, its basic blocks are instrumented
///    (see [`Planner`]);
///  * when the main thread starts, its trace buffer is created and its scratch registers point
///    to it. Other threads get null pointers and are not traced;
///  * when the main thread exits, the remaining entries are written to disk.
///
/// # Example
///
/// ```
/// use leaktrace::config::Config;
/// use leaktrace::core::Tracer;
/// use leaktrace::host::*;
/// use leaktrace::insn::*;
/// use leaktrace::probes::*;
/// use leaktrace::error::Result;
///
/// // A host runtime.
/// struct DummyHost(u16);
///
/// impl Host for DummyHost {
///     fn claim_scratch_reg(&mut self) -> Option<Reg> {
///         self.0 += 1;
///         Some(Reg::Scratch(self.0))
///     }
///     fn insert_probe(&mut self, ins: &Ins, probe: Probe) {
///         // [...]
///     }
///     fn find_routine(&mut self, image: &ImageInfo, name: &str) -> Option<Routine> {
///         None
///     }
///     fn insert_routine_probe(&mut self, routine: Routine, probe: Probe) -> Result<()> {
///         Ok(())
///     }
/// }
///
/// let mut host = DummyHost(0);
/// let prefix = std::env::temp_dir().join("leaktrace_doc");
/// let mut tracer = Tracer::init(["-o", prefix.to_str().unwrap(), "-i", "app.exe"], &mut host)
///     .expect("could not create the tracer");
/// tracer
///     .on_image_load(&mut host, &ImageInfo::new("/bin/app.exe", 0x1000, 0x1fff))
///     .unwrap();
/// ```
pub struct Tracer {
    /// A copy of the initial configuration structure.
    config: Config,
    /// Registers reserved on the host.
    scratch: ScratchRegs,
    /// Images loaded so far.
    images: Images,
    /// Log of loaded images.
    image_log: ImageLog,
    /// Basic block instrumentation.
    planner: Planner,
    /// Routine instrumentation.
    hooks: ImageHooks,
}

impl Tracer {
    /// Parses the tool's command line and creates the tracer. On invalid arguments, the error and
    /// the full help are printed on stderr and an error is returned so that the host can exit.
    pub fn init<H, I, T>(args: I, host: &mut H) -> Result<Self>
    where
        H: Host + ?Sized,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        init_logging();
        let options = Options::parse_args(args).map_err(|e| {
            eprintln!("{}", e);
            eprintln!("{}", Options::usage());
            ConfigError::InvalidArguments(e.to_string())
        })?;
        Self::new(options.into_config()?, host)
    }

    /// Creates the tracer from a configuration.
    pub fn new<H: Host + ?Sized>(config: Config, host: &mut H) -> Result<Self> {
        let scratch = ScratchRegs::claim(host)?;
        if config.cpu_model != CpuModel::Default {
            tracing::info!("Emulating CPU model {}", config.cpu_model);
            check_host_superset(config.cpu_model);
        }
        if let Some(value) = config.fixed_random {
            tracing::info!("Using fixed RDRAND output {:#x}", value);
        }
        let images = Images::new(&config.interesting_images)?;
        let image_log = ImageLog::create(&config.output_prefix)?;
        let planner = Planner {
            regs: scratch.buffer(),
            cpuid_eax: scratch.cpuid_eax,
            cpuid_ecx: scratch.cpuid_ecx,
            cpu_model: config.cpu_model,
            fixed_random: config.fixed_random,
        };
        let hooks = ImageHooks::new(scratch.buffer(), config.allocator_abi);
        Ok(Self {
            config,
            scratch,
            images,
            image_log,
            planner,
            hooks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scratch_regs(&self) -> ScratchRegs {
        self.scratch
    }

    pub fn images(&self) -> &Images {
        &self.images
    }

    /// Registers a newly loaded image and hooks its routines. Returns the number of probes
    /// inserted.
    pub fn on_image_load<H: Host + ?Sized>(&mut self, host: &mut H, info: &ImageInfo) -> Result<usize> {
        let image = self.images.register(info)?;
        self.image_log.append(image)?;
        self.hooks.install(host, info)
    }

    /// Instruments the basic blocks of a trace. Returns the number of probes inserted.
    pub fn on_trace<H: Host + ?Sized>(&self, host: &mut H, bbls: &[Bbl]) -> usize {
        self.planner.instrument_trace(host, &self.images, bbls)
    }

    /// Instruments a single basic block. Returns the number of probes inserted.
    pub fn on_bbl<H: Host + ?Sized>(&self, host: &mut H, bbl: &Bbl) -> usize {
        self.on_trace(host, std::slice::from_ref(bbl))
    }

    /// Sets up tracing for a new thread. Only the main thread gets a trace buffer.
    pub fn on_thread_start<C: ExecContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        let tid = ctx.thread_id();
        if tid != MAIN_THREAD {
            tracing::warn!("Ignoring thread #{}", tid);
            ctx.set_reg(self.scratch.next, 0);
            ctx.set_reg(self.scratch.end, 0);
            return Ok(());
        }
        let writer = TraceWriter::new(&self.config)?;
        ctx.set_reg(self.scratch.next, writer.begin() as u64);
        ctx.set_reg(self.scratch.end, writer.end() as u64);
        TraceWriter::install(writer);
        Ok(())
    }

    /// Writes the remaining entries of the main thread and releases its buffer.
    pub fn on_thread_fini<C: ExecContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        if ctx.thread_id() != MAIN_THREAD {
            return Ok(());
        }
        if let Some(mut writer) = TraceWriter::take() {
            let next = ctx.reg(self.scratch.next) as *mut TraceEntry;
            ctx.set_reg(self.scratch.next, 0);
            ctx.set_reg(self.scratch.end, 0);
            writer.finish(next)?;
        }
        Ok(())
    }

    /// Reports an exception raised inside the tracer.
    pub fn on_internal_exception(&self, tid: ThreadId, description: &str) -> ExceptionHandling {
        tracing::error!("Internal exception: {} (thread #{})", description, tid);
        ExceptionHandling::Unhandled
    }
}
