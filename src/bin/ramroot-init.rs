//! ramroot-init - process 1 of the RAM environment.
//!
//! Installed as `/init`, and as `reboot`, `poweroff` and `halt`: under those
//! names it runs the safe shutdown sequence for that action instead.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use ramroot::build::etc::ENV_PATH;
use ramroot::config::BOOT_CONFIG_PATH;
use ramroot::init::cmdline::parse_cmdline;
use ramroot::init::{load_boot_config, InitController, LiveSystem};
use ramroot::logging;
use ramroot::shutdown::{run_shutdown, LiveShutdown, TerminalAction};

fn main() -> ExitCode {
    let argv0 = std::env::args().next().unwrap_or_default();
    let name = Path::new(&argv0)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(action) = TerminalAction::from_command_name(&name) {
        return wrapper(action);
    }

    if std::process::id() != 1 {
        eprintln!("ramroot-init: must run as process 1 (invoke as reboot, poweroff or halt otherwise)");
        return ExitCode::FAILURE;
    }
    run_as_init()
}

/// `reboot`/`poweroff`/`halt` inside the environment.
fn wrapper(action: TerminalAction) -> ExitCode {
    logging::init(false);
    if !nix::unistd::geteuid().is_root() {
        eprintln!("{}: must be root", action);
        return ExitCode::FAILURE;
    }
    run_shutdown(&mut LiveShutdown, action);
    // Only reached when the reboot syscall failed
    ExitCode::FAILURE
}

fn run_as_init() -> ExitCode {
    std::env::set_var("PATH", ENV_PATH);
    std::env::set_var("HOME", "/root");
    std::env::set_var("TERM", "linux");
    let filter = logging::init_reloadable(false);
    tracing::info!("ramroot-init starting");

    let boot = load_boot_config(fs::read_to_string(BOOT_CONFIG_PATH).ok().as_deref());
    let system = match LiveSystem::new() {
        Ok(system) => system,
        Err(e) => {
            tracing::error!("cannot set up signal handling: {:#}", e);
            // Process 1 must not exit
            loop {
                std::thread::park();
            }
        }
    };

    let mut controller = InitController::new(system, boot);

    // Mount the virtual filesystems first so the command line is readable
    if controller.step().is_ok() {
        let debug = fs::read_to_string("/proc/cmdline")
            .map(|text| parse_cmdline(&text).debug)
            .unwrap_or(false);
        if debug {
            if let Some(filter) = &filter {
                if let Err(e) = filter.set("debug") {
                    tracing::warn!("{:#}", e);
                }
            }
            tracing::debug!("debug logging enabled");
        }
    }

    loop {
        let report = controller.run();
        tracing::error!(
            unmount_failures = report.unmount_failures.len(),
            "terminal action did not take effect, returning to service"
        );
    }
}
