//! The live kernel switch.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;
use crate::process::Cmd;
use crate::prompt::{confirm, Prompter};

pub const BOOT_CMDLINE: &str = "rdinit=/init rw quiet";

pub const FINAL_GATE: &str =
    "Type 'yes' to switch this machine into the RAM environment now (all running services stop):";

/// Kernel, image and command line for one `kexec -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBootSpec {
    pub kernel: PathBuf,
    pub image: PathBuf,
    pub cmdline: String,
    /// Use kexec_file_load (`-s`), needed under Secure Boot.
    pub file_load: bool,
}

impl KernelBootSpec {
    pub fn new(kernel: &Path, image: &Path) -> Self {
        Self {
            kernel: kernel.to_path_buf(),
            image: image.to_path_buf(),
            cmdline: BOOT_CMDLINE.to_string(),
            file_load: false,
        }
    }

    /// Append `ramroot.*` arguments.
    pub fn with_extra_args(mut self, extra: &[String]) -> Self {
        for arg in extra {
            self.cmdline.push(' ');
            self.cmdline.push_str(arg);
        }
        self
    }

    pub fn load_args(&self) -> Vec<String> {
        let mut args = vec!["-l".to_string()];
        if self.file_load {
            args.push("-s".to_string());
        }
        args.push(self.kernel.display().to_string());
        args.push(format!("--initrd={}", self.image.display()));
        args.push(format!("--command-line={}", self.cmdline));
        args
    }
}

pub trait Switcher {
    fn load(&mut self, spec: &KernelBootSpec) -> Result<()>;
    fn unload(&mut self) -> Result<()>;
    /// Does not return on success.
    fn execute(&mut self) -> Result<()>;
}

/// `kexec` at a resolved path.
pub struct KexecSwitcher {
    pub kexec: PathBuf,
}

impl Switcher for KexecSwitcher {
    fn load(&mut self, spec: &KernelBootSpec) -> Result<()> {
        Cmd::for_path(&self.kexec)
            .args(spec.load_args())
            .error_msg("kexec -l failed")
            .run()?;
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        Cmd::for_path(&self.kexec)
            .arg("-u")
            .error_msg("kexec -u failed")
            .run()?;
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        nix::unistd::sync();
        Cmd::for_path(&self.kexec)
            .arg("-e")
            .error_msg("kexec -e failed")
            .run()?;
        Ok(())
    }
}

/// Load the kernel, ask at the final gate, execute.
///
/// Anything but an exact `yes` unloads the staged kernel and returns
/// [`LaunchError::Aborted`]; the host is unchanged. Returning from
/// execute at all is [`LaunchError::SwitchFailed`].
pub fn switch(
    switcher: &mut dyn Switcher,
    spec: &KernelBootSpec,
    prompter: &mut dyn Prompter,
) -> Result<()> {
    println!("Staging kernel {}", spec.kernel.display());
    println!("  image:        {}", spec.image.display());
    println!("  command line: {}", spec.cmdline);
    switcher.load(spec)?;

    let go = match confirm(prompter, FINAL_GATE) {
        Ok(go) => go,
        Err(e) => {
            unload(switcher);
            return Err(e);
        }
    };
    if !go {
        unload(switcher);
        return Err(LaunchError::aborted("kernel switch").into());
    }

    tracing::info!("executing kexec");
    let reason = match switcher.execute() {
        Ok(()) => "kexec -e returned without switching".to_string(),
        Err(e) => format!("{:#}", e),
    };
    Err(LaunchError::SwitchFailed { reason }.into())
}

fn unload(switcher: &mut dyn Switcher) {
    match switcher.unload() {
        Ok(()) => println!("Staged kernel unloaded; the host is unchanged."),
        Err(e) => tracing::warn!("could not unload the staged kernel: {:#}", e),
    }
}
