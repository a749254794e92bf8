//! ramroot - RAM-resident maintenance environment builder and launcher.
//!
//! Builds a self-contained initramfs from the host's own binaries:
//! - Dependency-complete root tree (tools, libraries, busybox applets)
//! - Storage pool and driver modules for the target kernel
//! - `ramroot-init` as process 1, with safe reboot/poweroff/halt wrappers
//!
//! The bundled artifact carries kernel, image and this binary; run on the
//! target host it injects the host's identity and kexecs into the image.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use ramroot::commands;
use ramroot::config::BuildConfig;
use ramroot::launch::LaunchOptions;
use ramroot::logging;
use ramroot::prompt::TerminalPrompter;
use ramroot::shutdown::TerminalAction;

#[derive(Parser)]
#[command(name = "ramroot")]
#[command(about = "RAM-resident maintenance environment builder")]
#[command(
    after_help = "QUICK START:\n  ramroot preflight  Check the build host\n  ramroot build      Assemble and package the image\n  ramroot bundle     Write the self-extracting artifact\n  ./ramroot-<release>.run  (on the target host, as root)"
)]
struct Cli {
    /// Directory holding .env and the default output directory
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run preflight checks (verify the host before build or launch)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,

        /// Check this host as a launch target, using this scratch directory
        #[arg(long)]
        launch: Option<PathBuf>,
    },

    /// Assemble the root tree and package the image
    Build {
        /// Build even when no storage pool modules exist for the kernel
        #[arg(long)]
        allow_missing_pool_modules: bool,

        /// Kernel release to harvest modules for (default: running kernel)
        #[arg(long)]
        kernel_release: Option<String>,

        /// Host root to harvest from (default: /). Libraries are resolved with
        /// that root's own dynamic loader, which must run on this machine.
        #[arg(long)]
        host_root: Option<PathBuf>,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the self-extracting artifact (kernel + image + launcher)
    Bundle {
        /// Artifact path (default: output/ramroot-<release>.run)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inject host identity and switch into the image (target host, root)
    Launch {
        /// Scratch directory holding (or receiving) the payload
        #[arg(long)]
        scratch: Option<PathBuf>,

        /// Extract this artifact into the scratch directory first
        #[arg(long)]
        artifact: Option<PathBuf>,

        /// Skip network capture; the environment falls back to DHCP
        #[arg(long)]
        no_network: bool,

        /// Pass ramroot.debug to the environment
        #[arg(long)]
        debug: bool,

        /// Extra kernel arguments (ramroot.mac=..., ramroot.ip=...)
        #[arg(long = "kernel-arg")]
        kernel_args: Vec<String>,
    },

    /// Print this host's network identity as launch would capture it
    CaptureNetwork,

    /// Show current configuration
    ShowConfig,

    /// Export pools, unmount and perform a terminal action on this host
    Shutdown {
        #[arg(value_enum, default_value = "reboot")]
        action: ActionArg,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Reboot,
    Poweroff,
    Halt,
}

impl From<ActionArg> for TerminalAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Reboot => TerminalAction::Reboot,
            ActionArg::Poweroff => TerminalAction::PowerOff,
            ActionArg::Halt => TerminalAction::Halt,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(true);

    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = BuildConfig::load(&base_dir)?;
    let mut prompter = TerminalPrompter;

    match cli.command {
        Commands::Preflight { strict, launch } => {
            commands::cmd_preflight(&config, strict, launch.as_deref())?;
        }

        Commands::Build {
            allow_missing_pool_modules,
            kernel_release,
            host_root,
            output,
        } => {
            // CLI flags override .env and the environment
            if allow_missing_pool_modules {
                config.allow_missing_pool_modules = true;
            }
            if let Some(root) = host_root {
                config.host_root = root;
            }
            if let Some(release) = kernel_release {
                config.kernel_image = config
                    .host_root
                    .join("boot")
                    .join(format!("vmlinuz-{}", release));
                config.kernel_release = release;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            commands::cmd_build(&config, &mut prompter)?;
        }

        Commands::Bundle { output } => {
            commands::cmd_bundle(&config, output.as_deref())?;
        }

        Commands::Launch {
            scratch,
            artifact,
            no_network,
            debug,
            kernel_args,
        } => {
            let mut extra_cmdline = kernel_args;
            if debug {
                extra_cmdline.push("ramroot.debug".to_string());
            }
            let options = LaunchOptions {
                scratch: scratch.unwrap_or_else(|| std::env::temp_dir().join("ramroot")),
                host_root: config.host_root.clone(),
                min_memory_mib: config.min_memory_mib,
                extra_cmdline,
                capture_network: !no_network,
            };
            commands::cmd_launch(&options, artifact.as_deref(), &mut prompter)?;
        }

        Commands::CaptureNetwork => {
            commands::cmd_capture_network(&config)?;
        }

        Commands::ShowConfig => {
            commands::cmd_show_config(&config)?;
        }

        Commands::Shutdown { action, yes } => {
            commands::cmd_shutdown(action.into(), yes, &mut prompter)?;
        }
    }

    Ok(())
}
