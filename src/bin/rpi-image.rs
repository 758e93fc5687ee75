use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rpi_image::error::TeardownError;
use rpi_image::image::fetch::fetch_image;
use rpi_image::{
    preflight, run_boot, run_chroot, CommandExecutor, Config, Interrupt, InterruptGuard,
    LoopDevice, LoopDeviceBinder, ProjectMode, ProvisionError, SystemExecutor,
};

#[derive(Parser, Debug)]
#[command(
    name = "rpi-image",
    version,
    about = "Boot a Raspberry Pi OS image under QEMU or enter it as an aarch64 chroot"
)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/rpi-image/config.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every executed command
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot the image with qemu-system-aarch64
    Boot(BootArgs),
    /// Mount the image and open a shell (or run a command) inside it
    Chroot(ChrootArgs),
    /// Download and decompress a Raspberry Pi OS image
    Fetch(FetchArgs),
    /// Detach a loop device left behind by an interrupted run
    Detach {
        /// Loop device, e.g. /dev/loop7
        device: String,
    },
}

#[derive(Args, Debug)]
struct BootArgs {
    #[arg(long)]
    img: Option<PathBuf>,
    #[arg(long)]
    mount_boot: Option<PathBuf>,
    /// Guest memory in MiB
    #[arg(long)]
    ram: Option<u32>,
    #[arg(long)]
    cpus: Option<u32>,
    #[arg(long)]
    machine: Option<String>,
    /// CPU model
    #[arg(long)]
    cpu: Option<String>,
    /// Host port forwarded to the guest's SSH port
    #[arg(long)]
    ssh_port: Option<u16>,
    /// Extra kernel command-line text
    #[arg(long, allow_hyphen_values = true)]
    extra_args: Option<String>,
    /// Fail instead of growing the image to a power-of-two size
    #[arg(long)]
    no_resize: bool,
    /// No display window; serial console on stdio
    #[arg(long)]
    headless: bool,
}

impl BootArgs {
    fn apply(self, config: &mut Config) {
        let emu = &mut config.emulator;
        if let Some(img) = self.img {
            config.paths.image = img;
        }
        if let Some(mount_boot) = self.mount_boot {
            config.paths.mount_boot = mount_boot;
        }
        if let Some(ram) = self.ram {
            emu.memory_mb = ram;
        }
        if let Some(cpus) = self.cpus {
            emu.cores = cpus;
        }
        if let Some(machine) = self.machine {
            emu.machine = machine;
        }
        if let Some(cpu) = self.cpu {
            emu.cpu = cpu;
        }
        if let Some(port) = self.ssh_port {
            emu.ssh_port = port;
        }
        if let Some(extra) = self.extra_args {
            emu.extra_args = extra;
        }
        if self.no_resize {
            emu.resize = false;
        }
        if self.headless {
            emu.headless = true;
        }
    }
}

#[derive(Args, Debug)]
struct ChrootArgs {
    #[arg(long)]
    img: Option<PathBuf>,
    #[arg(long)]
    mount_root: Option<PathBuf>,
    #[arg(long)]
    mount_boot: Option<PathBuf>,
    /// Host directory to expose inside the root
    #[arg(long)]
    project_src: Option<PathBuf>,
    /// Location of the project inside the root
    #[arg(long)]
    project_dst: Option<PathBuf>,
    /// bind for live iteration, copy for an isolated build
    #[arg(long, value_enum)]
    project_mode: Option<ProjectMode>,
    #[arg(long)]
    shell: Option<String>,
    /// Static aarch64 user-mode interpreter on the host
    #[arg(long)]
    interpreter: Option<PathBuf>,
    /// Command to run instead of the interactive shell
    #[arg(last = true)]
    command: Vec<String>,
}

impl ChrootArgs {
    fn apply(self, config: &mut Config) -> Vec<String> {
        let chroot = &mut config.chroot;
        if let Some(img) = self.img {
            config.paths.image = img;
        }
        if let Some(root) = self.mount_root {
            config.paths.mount_root = root;
        }
        if let Some(boot) = self.mount_boot {
            config.paths.mount_boot = boot;
        }
        if let Some(src) = self.project_src {
            chroot.project_src = Some(src);
        }
        if let Some(dst) = self.project_dst {
            chroot.project_dst = dst;
        }
        if let Some(mode) = self.project_mode {
            chroot.project_mode = mode;
        }
        if let Some(shell) = self.shell {
            chroot.shell = shell;
        }
        if let Some(interpreter) = self.interpreter {
            chroot.interpreter = interpreter;
        }
        self.command
    }
}

#[derive(Args, Debug)]
struct FetchArgs {
    /// Image source URL (.img.xz)
    #[arg(long)]
    url: Option<String>,
    /// Directory that receives raspios.img (default: current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Expected SHA-256 of the downloaded archive
    #[arg(long)]
    sha256: Option<String>,
}

fn install_tracing(verbose: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "info" };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    match run(cli) {
        Ok(status) => ExitCode::from(u8::try_from(status).unwrap_or(1)),
        Err(err) => {
            match &err {
                ProvisionError::Other(inner) => eprintln!("error: {inner:#}"),
                other => eprintln!("error: {other}"),
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<i32, ProvisionError> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Boot(args) => {
            args.apply(&mut config);
            config.validate()?;
            preflight::require_root()?;
            let qemu_img = config
                .emulator
                .resize
                .then_some(config.emulator.qemu_img.as_str());
            preflight::check_boot_host(&config.emulator.binary, qemu_img)?;

            let _guard = InterruptGuard::install().context("installing signal handlers")?;
            let status =
                run_boot(&SystemExecutor, &Interrupt::process(), &config.boot_options());
            report_signal();
            status
        }
        Command::Chroot(args) => {
            let command = args.apply(&mut config);
            config.validate()?;
            preflight::require_root()?;
            preflight::check_chroot_host()?;

            let _guard = InterruptGuard::install().context("installing signal handlers")?;
            let status = run_chroot(
                &SystemExecutor,
                &Interrupt::process(),
                &config.chroot_options(command),
            );
            report_signal();
            status
        }
        Command::Fetch(args) => {
            preflight::check_required_tools(preflight::FETCH_TOOLS)?;
            let workdir = match args.workdir.or(config.fetch.workdir) {
                Some(dir) => rpi_image::config::expand_home(&dir),
                None => std::env::current_dir().context("resolving current directory")?,
            };
            let url = args.url.unwrap_or(config.fetch.url);
            let sha256 = args.sha256.or(config.fetch.sha256);

            let image = fetch_image(&SystemExecutor, &workdir, &url, sha256.as_deref())?;
            println!("{}", image.display());
            Ok(0)
        }
        Command::Detach { device } => {
            preflight::require_root()?;
            detach_device(&SystemExecutor, device)?;
            Ok(0)
        }
    }
}

/// Explicit detach of a device left behind by an earlier run.
fn detach_device(exec: &dyn CommandExecutor, device: String) -> Result<(), ProvisionError> {
    LoopDeviceBinder::new(exec)
        .detach(&LoopDevice::from_path(device))
        .map_err(TeardownError::from)?;
    Ok(())
}

/// Log the signal that stopped the run, if any.
fn report_signal() {
    if let Some(signal) = Interrupt::received_signal() {
        tracing::warn!("received {signal}");
    }
}
