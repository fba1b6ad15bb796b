//! Implements the tracer configuration builder and its command line.

use clap::{CommandFactory, Parser};
use clap_num::{maybe_hex, number_range};

use crate::cpu::*;
use crate::error::*;
use crate::hooks::*;
use crate::trace::*;

/// Default number of entries in the trace buffer.
pub const DEFAULT_BUFFER_ENTRIES: usize = 16384;

/// Structure that contains the different configuration options for the tracer.
///
/// # Example
///
/// ```
/// use leaktrace::config::Config;
/// use leaktrace::cpu::CpuModel;
///
/// // Traces memory accesses in `app.exe` and `crypto.dll`, writes traces to `/tmp/run_*`,
/// // emulates an Ivy Bridge CPU and makes `RDRAND` always return 4.
/// let config = Config::builder("/tmp/run")
///     .interesting_images(&["app.exe", "crypto.dll"])
///     .cpu_model(CpuModel::IvyBridge)
///     .fixed_random(Some(4))
///     .build()
///     .expect("invalid configuration");
/// assert_eq!(config.output_prefix(), "/tmp/run");
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Prefix of every output file.
    pub(crate) output_prefix: String,
    /// Lowercase substrings identifying interesting images.
    pub(crate) interesting_images: Vec<String>,
    /// CPU model answered to `CPUID`.
    pub(crate) cpu_model: CpuModel,
    /// Value returned by `RDRAND`, if it is overridden.
    pub(crate) fixed_random: Option<u64>,
    /// Number of entries in the trace buffer.
    pub(crate) buffer_entries: usize,
    /// Allocator routines hooked in loaded images.
    pub(crate) allocator_abi: AllocatorAbi,
    /// Records entries preceding the first testcase in a prefix trace if set to `true`.
    pub(crate) prefix_trace: bool,
    /// Prints completed testcase traces on stdout if set to `true`.
    pub(crate) testcase_notifications: bool,
}

impl Config {
    /// Creates a new builder instance for the tracer's configuration.
    pub fn builder(output_prefix: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(output_prefix.into())
    }

    pub fn output_prefix(&self) -> &str {
        &self.output_prefix
    }

    pub fn interesting_images(&self) -> &[String] {
        &self.interesting_images
    }

    pub fn cpu_model(&self) -> CpuModel {
        self.cpu_model
    }

    pub fn fixed_random(&self) -> Option<u64> {
        self.fixed_random
    }

    pub fn buffer_entries(&self) -> usize {
        self.buffer_entries
    }

    pub fn allocator_abi(&self) -> AllocatorAbi {
        self.allocator_abi
    }

    pub fn prefix_trace(&self) -> bool {
        self.prefix_trace
    }

    pub fn testcase_notifications(&self) -> bool {
        self.testcase_notifications
    }
}

/// Configuration builder.
pub struct ConfigBuilder {
    /// The inner configuration object.
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new configuration builder.
    fn new(output_prefix: String) -> Self {
        Self {
            config: Config {
                output_prefix,
                interesting_images: vec![".exe".to_string()],
                cpu_model: CpuModel::Default,
                fixed_random: None,
                buffer_entries: DEFAULT_BUFFER_ENTRIES,
                allocator_abi: AllocatorAbi::default(),
                prefix_trace: true,
                testcase_notifications: true,
            },
        }
    }

    /// Returns the [`Config`] object built with the current [`ConfigBuilder`].
    pub fn build(self) -> Result<Config> {
        if self.config.buffer_entries < BUFFER_FULL_MARGIN + 2 {
            return Err(ConfigError::BufferTooSmall(self.config.buffer_entries))?;
        }
        Ok(self.config)
    }

    /// Sets the output prefix.
    pub fn output_prefix(mut self, output_prefix: impl Into<String>) -> Self {
        self.config.output_prefix = output_prefix.into();
        self
    }

    /// Sets the substrings identifying interesting images. Matching is case-insensitive.
    pub fn interesting_images<S: AsRef<str>>(mut self, images: &[S]) -> Self {
        self.config.interesting_images = images
            .iter()
            .map(|s| s.as_ref().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    /// Sets the CPU model answered to `CPUID`.
    pub fn cpu_model(mut self, cpu_model: CpuModel) -> Self {
        self.config.cpu_model = cpu_model;
        self
    }

    /// Sets the value returned by `RDRAND`. `None` leaves the instruction untouched.
    pub fn fixed_random(mut self, fixed_random: Option<u64>) -> Self {
        self.config.fixed_random = fixed_random;
        self
    }

    /// Sets the number of entries in the trace buffer.
    pub fn buffer_entries(mut self, buffer_entries: usize) -> Self {
        self.config.buffer_entries = buffer_entries;
        self
    }

    /// Sets the allocator routines hooked in loaded images.
    pub fn allocator_abi(mut self, allocator_abi: AllocatorAbi) -> Self {
        self.config.allocator_abi = allocator_abi;
        self
    }

    /// Enables the prefix trace if set to `true`.
    pub fn prefix_trace(mut self, prefix_trace: bool) -> Self {
        self.config.prefix_trace = prefix_trace;
        self
    }

    /// Enables testcase completion notifications on stdout if set to `true`.
    pub fn testcase_notifications(mut self, testcase_notifications: bool) -> Self {
        self.config.testcase_notifications = testcase_notifications;
        self
    }
}

// -----------------------------------------------------------------------------------------------
// Command line
// -----------------------------------------------------------------------------------------------

fn cpu_level(s: &str) -> std::result::Result<u32, String> {
    number_range(s, 0, 4)
}

/// Command line of the tracer, as passed by the host runtime.
#[derive(Parser, Debug)]
#[clap(
    name = "leaktrace",
    author = "lyte <hyperpom@impalabs.fr>",
    version = "1.0",
    about = "Records memory, control-flow and heap events for leakage analysis",
    long_about = None)]
pub struct Options {
    /// Prefix of the output files.
    #[clap(short = 'o', long = "output", value_name = "PREFIX", default_value = "out")]
    output_prefix: String,

    /// Interesting images, as case-insensitive substrings separated by semicolons.
    #[clap(short = 'i', long = "images", value_name = "IMAGES", default_value = ".exe")]
    interesting_images: String,

    /// CPU model: 0 = Default, 1 = Pentium3, 2 = Merom, 3 = Westmere, 4 = Ivybridge (the host
    /// CPU should support every feature of the selected model).
    #[clap(short = 'c', long = "cpu", value_name = "LEVEL", default_value = "0",
        value_parser = cpu_level)]
    cpu_level: u32,

    /// Constant output of the RDRAND instruction.
    #[clap(short = 'r', long = "rdrand", value_name = "VALUE", default_value = "0xBADBADBADBADBAD",
        value_parser = maybe_hex::<u64>)]
    fixed_random: u64,

    /// Allocator routines to hook (windows-heap or libc).
    #[clap(short = 'a', long = "allocator", value_name = "ABI")]
    allocator_abi: Option<String>,

    /// Number of entries of the trace buffer.
    #[clap(short = 'b', long = "buffer", value_name = "ENTRIES", default_value = "16384")]
    buffer_entries: usize,

    /// Discards the entries recorded before the first testcase.
    #[clap(long = "no-prefix")]
    no_prefix: bool,

    /// Does not print completed testcase traces on stdout.
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,
}

impl Options {
    /// Parses the tool arguments. `args` does not contain the program name.
    pub fn parse_args<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let args = std::iter::once("leaktrace".to_string()).chain(args.into_iter().map(Into::into));
        Self::try_parse_from(args)
    }

    /// Full help listing every option, printed when the arguments are invalid.
    pub fn usage() -> String {
        Self::command().render_help().to_string()
    }

    /// Converts the options into a [`Config`].
    pub fn into_config(self) -> Result<Config> {
        let images: Vec<&str> = self.interesting_images.split(';').collect();
        let fixed_random = if self.fixed_random != RDRAND_SENTINEL {
            Some(self.fixed_random)
        } else {
            None
        };
        let allocator_abi = match self.allocator_abi {
            Some(abi) => abi.parse()?,
            None => AllocatorAbi::default(),
        };
        Config::builder(self.output_prefix)
            .interesting_images(images.as_slice())
            .cpu_model(CpuModel::try_from(self.cpu_level)?)
            .fixed_random(fixed_random)
            .allocator_abi(allocator_abi)
            .buffer_entries(self.buffer_entries)
            .prefix_trace(!self.no_prefix)
            .testcase_notifications(!self.quiet)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Options::parse_args(Vec::<String>::new())
            .unwrap()
            .into_config()
            .unwrap();
        assert_eq!(config, Config::builder("out").build().unwrap());
        assert_eq!(config.interesting_images(), &[".exe".to_string()]);
        assert_eq!(config.cpu_model(), CpuModel::Default);
        assert_eq!(config.fixed_random(), None);
        assert_eq!(config.buffer_entries(), DEFAULT_BUFFER_ENTRIES);
        assert!(config.prefix_trace());
        assert!(config.testcase_notifications());
    }

    #[test]
    fn config_options() {
        let config = Options::parse_args([
            "-o", "/tmp/x", "-i", "App.exe;;Crypto.dll", "-c", "4", "-r", "0x1234", "-a", "libc",
            "-b", "64", "--no-prefix", "-q",
        ])
        .unwrap()
        .into_config()
        .unwrap();
        assert_eq!(config.output_prefix(), "/tmp/x");
        assert_eq!(
            config.interesting_images(),
            &["app.exe".to_string(), "crypto.dll".to_string()]
        );
        assert_eq!(config.cpu_model(), CpuModel::IvyBridge);
        assert_eq!(config.fixed_random(), Some(0x1234));
        assert_eq!(config.allocator_abi(), AllocatorAbi::Libc);
        assert_eq!(config.buffer_entries(), 64);
        assert!(!config.prefix_trace());
        assert!(!config.testcase_notifications());

        let config = Options::parse_args(["-r", "42"]).unwrap().into_config().unwrap();
        assert_eq!(config.fixed_random(), Some(42));
    }

    #[test]
    fn config_invalid_options() {
        assert!(Options::parse_args(["-c", "5"]).is_err());
        assert!(Options::parse_args(["-r", "zz"]).is_err());
        assert!(Options::parse_args(["--unknown"]).is_err());
        let usage = Options::usage();
        for option in ["--output", "--images", "--cpu", "--rdrand", "--allocator", "--buffer"] {
            assert!(usage.contains(option), "{} missing from the usage", option);
        }
        assert_eq!(
            Options::parse_args(["-b", "3"]).unwrap().into_config(),
            Err(Error::Config(ConfigError::BufferTooSmall(3)))
        );
        assert_eq!(
            Options::parse_args(["-a", "tcmalloc"]).unwrap().into_config(),
            Err(Error::Config(ConfigError::UnknownAllocatorAbi(
                "tcmalloc".to_string()
            )))
        );
    }
}
