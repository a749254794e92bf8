//! Launch command - runs on the target host.

use anyhow::{bail, Result};
use std::path::Path;

use crate::launch::artifact::{self, PayloadLayout};
use crate::launch::{self, LaunchOptions};
use crate::prompt::Prompter;

/// Execute the launch command.
///
/// With `artifact`, its payload is extracted into the scratch directory
/// first; otherwise the scratch directory already holds the payload.
pub fn cmd_launch(
    options: &LaunchOptions,
    artifact: Option<&Path>,
    prompter: &mut dyn Prompter,
) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("ramroot launch must run as root");
    }

    let layout = match artifact {
        Some(path) => {
            println!("Extracting {} into {}", path.display(), options.scratch.display());
            artifact::extract(path, &options.scratch)?
        }
        None => PayloadLayout::locate(&options.scratch)?,
    };

    launch::launch(options, &layout, prompter)
}
