//! SSH identity for the booted environment.
//!
//! Host keys are converted from the host's OpenSSH keys so clients see the
//! same fingerprint after the switch. Trusted keys are picked from the keys
//! already authorized on the host, or freshly generated.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;
use crate::process::Cmd;
use crate::prompt::{confirm, Prompter};

/// Host key types, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    Ed25519,
    Ecdsa,
    Rsa,
}

impl HostKeyAlgorithm {
    pub const ALL: [HostKeyAlgorithm; 3] = [
        HostKeyAlgorithm::Ed25519,
        HostKeyAlgorithm::Ecdsa,
        HostKeyAlgorithm::Rsa,
    ];

    /// Name used by both OpenSSH file names and `dropbearkey -t`.
    pub fn name(self) -> &'static str {
        match self {
            HostKeyAlgorithm::Ed25519 => "ed25519",
            HostKeyAlgorithm::Ecdsa => "ecdsa",
            HostKeyAlgorithm::Rsa => "rsa",
        }
    }

    pub fn openssh_key_name(self) -> String {
        format!("ssh_host_{}_key", self.name())
    }

    pub fn dropbear_file_name(self) -> String {
        format!("dropbear_{}_host_key", self.name())
    }

    /// Location inside the image.
    pub fn dropbear_path(self) -> String {
        format!("/etc/dropbear/{}", self.dropbear_file_name())
    }
}

/// One `authorized_keys` / `.pub` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// `authorized_keys` options (`from=...`, `no-pty`), kept verbatim.
    pub options: Option<String>,
    pub key_type: String,
    pub blob: String,
    pub comment: Option<String>,
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

/// Split a leading options field off `line`. Quoted values may hold spaces.
fn split_options(line: &str) -> (Option<&str>, &str) {
    if line.split_whitespace().next().is_some_and(is_key_type) {
        return (None, line);
    }
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                return (Some(&line[..i]), line[i..].trim_start());
            }
            _ => {}
        }
    }
    (Some(line), "")
}

impl PublicKey {
    /// Parse `[options] type base64 [comment]`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (options, rest) = split_options(line);
        let mut fields = rest.split_whitespace();
        let key_type = fields.next()?;
        if !is_key_type(key_type) {
            return None;
        }
        let blob = fields.next()?;
        STANDARD.decode(blob).ok()?;
        let comment = fields.collect::<Vec<_>>().join(" ");
        Some(Self {
            options: options.map(str::to_string),
            key_type: key_type.to_string(),
            blob: blob.to_string(),
            comment: (!comment.is_empty()).then_some(comment),
        })
    }

    /// OpenSSH `SHA256:` fingerprint.
    pub fn fingerprint(&self) -> Result<String> {
        let raw = STANDARD
            .decode(&self.blob)
            .context("Public key is not valid base64")?;
        let digest = Sha256::digest(&raw);
        Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
    }

    /// Same key regardless of comment.
    pub fn same_key(&self, other: &PublicKey) -> bool {
        self.key_type == other.key_type && self.blob == other.blob
    }

    pub fn to_line(&self) -> String {
        let mut line = String::new();
        if let Some(options) = &self.options {
            line.push_str(options);
            line.push(' ');
        }
        line.push_str(&self.key_type);
        line.push(' ');
        line.push_str(&self.blob);
        if let Some(comment) = &self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }
}

/// First public key line in free-form tool output.
pub fn find_public_key(text: &str) -> Option<PublicKey> {
    text.lines().find_map(PublicKey::parse)
}

/// Key conversion and generation tools.
pub trait KeyTool {
    /// Convert an OpenSSH private key into dropbear format at `dest`.
    fn convert(&mut self, openssh_key: &Path, dest: &Path) -> Result<()>;
    /// Public half of a dropbear private key.
    fn dropbear_public(&mut self, dropbear_key: &Path) -> Result<PublicKey>;
    fn generate_dropbear(&mut self, algorithm: HostKeyAlgorithm, dest: &Path) -> Result<()>;
    /// OpenSSH client keypair: private key at `dest`, public at `dest.pub`.
    fn generate_keypair(&mut self, dest: &Path, comment: &str) -> Result<()>;
}

/// `dropbearconvert`, `dropbearkey` and `ssh-keygen` at resolved paths.
pub struct LiveKeyTool {
    pub dropbearconvert: Option<PathBuf>,
    pub dropbearkey: Option<PathBuf>,
    pub ssh_keygen: Option<PathBuf>,
}

fn required<'a>(tool: &'a Option<PathBuf>, name: &str) -> Result<&'a Path> {
    match tool {
        Some(path) => Ok(path),
        None => bail!("{} is not available on this host or in the image", name),
    }
}

impl KeyTool for LiveKeyTool {
    fn convert(&mut self, openssh_key: &Path, dest: &Path) -> Result<()> {
        Cmd::for_path(required(&self.dropbearconvert, "dropbearconvert")?)
            .args(["openssh", "dropbear"])
            .arg_path(openssh_key)
            .arg_path(dest)
            .error_msg(format!("dropbearconvert {} failed", openssh_key.display()))
            .run()?;
        Ok(())
    }

    fn dropbear_public(&mut self, dropbear_key: &Path) -> Result<PublicKey> {
        let result = Cmd::for_path(required(&self.dropbearkey, "dropbearkey")?)
            .args(["-y", "-f"])
            .arg_path(dropbear_key)
            .error_msg("dropbearkey -y failed")
            .run()?;
        find_public_key(&result.stdout)
            .with_context(|| format!("No public key in dropbearkey output for {}", dropbear_key.display()))
    }

    fn generate_dropbear(&mut self, algorithm: HostKeyAlgorithm, dest: &Path) -> Result<()> {
        Cmd::for_path(required(&self.dropbearkey, "dropbearkey")?)
            .args(["-t", algorithm.name(), "-f"])
            .arg_path(dest)
            .error_msg("dropbearkey failed")
            .run()?;
        Ok(())
    }

    fn generate_keypair(&mut self, dest: &Path, comment: &str) -> Result<()> {
        Cmd::for_path(required(&self.ssh_keygen, "ssh-keygen")?)
            .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
            .arg_path(dest)
            .error_msg("ssh-keygen failed")
            .run()?;
        Ok(())
    }
}

/// A host key ready for the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropbearHostKey {
    pub algorithm: HostKeyAlgorithm,
    pub key: Vec<u8>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeys {
    pub keys: Vec<DropbearHostKey>,
    /// No host key converted; a new one was generated.
    pub ephemeral: bool,
}

/// Convert the host's OpenSSH host keys found in `ssh_dir`, using `work` for
/// intermediate files. A conversion is kept only if its fingerprint matches
/// the source's `.pub`. With nothing kept, one ed25519 key is generated.
pub fn convert_host_keys(tool: &mut dyn KeyTool, ssh_dir: &Path, work: &Path) -> Result<HostKeys> {
    fs::create_dir_all(work).with_context(|| format!("Failed to create {}", work.display()))?;
    let mut keys = Vec::new();

    for algorithm in HostKeyAlgorithm::ALL {
        let source = ssh_dir.join(algorithm.openssh_key_name());
        if !source.is_file() {
            continue;
        }
        let public_path = source.with_extension("pub");
        let expected = match fs::read_to_string(&public_path)
            .ok()
            .as_deref()
            .and_then(find_public_key)
        {
            Some(public) => public.fingerprint()?,
            None => {
                tracing::warn!(key = %source.display(), "no readable .pub, cannot verify conversion");
                continue;
            }
        };

        let dest = work.join(algorithm.dropbear_file_name());
        if let Err(e) = tool.convert(&source, &dest) {
            tracing::warn!(algorithm = algorithm.name(), "host key conversion failed: {:#}", e);
            continue;
        }
        let actual = match tool.dropbear_public(&dest).and_then(|k| k.fingerprint()) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::warn!(algorithm = algorithm.name(), "cannot read converted key: {:#}", e);
                continue;
            }
        };
        if actual != expected {
            tracing::warn!(
                algorithm = algorithm.name(),
                expected = %expected,
                actual = %actual,
                "converted key fingerprint differs, discarding"
            );
            continue;
        }

        tracing::info!(algorithm = algorithm.name(), fingerprint = %actual, "host key converted");
        keys.push(DropbearHostKey {
            algorithm,
            key: fs::read(&dest)?,
            fingerprint: actual,
        });
    }

    if !keys.is_empty() {
        return Ok(HostKeys {
            keys,
            ephemeral: false,
        });
    }

    tracing::warn!("no host key could be converted, generating a new ed25519 key; clients will see a changed fingerprint");
    let algorithm = HostKeyAlgorithm::Ed25519;
    let dest = work.join(algorithm.dropbear_file_name());
    tool.generate_dropbear(algorithm, &dest)?;
    let fingerprint = tool.dropbear_public(&dest)?.fingerprint()?;
    Ok(HostKeys {
        keys: vec![DropbearHostKey {
            algorithm,
            key: fs::read(&dest)?,
            fingerprint,
        }],
        ephemeral: true,
    })
}

/// A trusted key and the first file it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKey {
    pub key: PublicKey,
    pub source: PathBuf,
}

/// Files that may hold keys the operator already trusts, in listing order.
pub fn key_source_paths(root_home: &Path, homes: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = vec![root_home.join(".ssh/authorized_keys")];
    for home in homes {
        let ssh = home.join(".ssh");
        paths.push(ssh.join("authorized_keys"));
        let mut pubs: Vec<PathBuf> = fs::read_dir(&ssh)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "pub"))
            .collect();
        pubs.sort();
        paths.extend(pubs);
    }
    let mut unique: Vec<PathBuf> = Vec::new();
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    unique
}

/// Every distinct key in `paths`. Unreadable files are skipped.
pub fn collect_trusted_keys(paths: &[PathBuf]) -> Vec<CandidateKey> {
    let mut found: Vec<CandidateKey> = Vec::new();
    for path in paths {
        let Ok(text) = fs::read_to_string(path) else {
            continue;
        };
        for (number, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(key) = PublicKey::parse(trimmed) else {
                tracing::warn!(
                    file = %path.display(),
                    line = number + 1,
                    "unparsable key line skipped, it will not be trusted"
                );
                continue;
            };
            if found.iter().any(|c| c.key.same_key(&key)) {
                continue;
            }
            found.push(CandidateKey {
                key,
                source: path.clone(),
            });
        }
    }
    found
}

/// Home directory of `user` from a passwd file.
pub fn passwd_home(passwd: &str, user: &str) -> Option<PathBuf> {
    passwd.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        (fields.len() >= 6 && fields[0] == user).then(|| PathBuf::from(fields[5]))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    Keys(Vec<usize>),
    GenerateNew,
}

/// `all`, `new`, or 1-based indices separated by commas or spaces.
pub fn parse_selection(answer: &str, count: usize) -> Option<KeySelection> {
    let answer = answer.trim();
    match answer {
        "new" => return Some(KeySelection::GenerateNew),
        "all" if count > 0 => return Some(KeySelection::Keys((0..count).collect())),
        _ => {}
    }
    let mut picked = Vec::new();
    for token in answer.split([',', ' ']).filter(|t| !t.is_empty()) {
        let index: usize = token.parse().ok()?;
        if index == 0 || index > count {
            return None;
        }
        if !picked.contains(&(index - 1)) {
            picked.push(index - 1);
        }
    }
    (!picked.is_empty()).then_some(KeySelection::Keys(picked))
}

/// Keys root will accept in the booted environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKeys {
    pub keys: Vec<PublicKey>,
    pub generated: bool,
}

impl TrustedKeys {
    pub fn authorized_keys(&self) -> String {
        let mut out = String::new();
        for key in &self.keys {
            out.push_str(&key.to_line());
            out.push('\n');
        }
        out
    }
}

const SELECTION_ATTEMPTS: usize = 3;

/// Ask which keys to trust. Choosing `new` generates exactly one keypair in
/// `work`, shows the private key once and requires a `yes` before going on.
pub fn select_trusted_keys(
    prompter: &mut dyn Prompter,
    tool: &mut dyn KeyTool,
    candidates: &[CandidateKey],
    work: &Path,
    comment: &str,
) -> Result<TrustedKeys> {
    println!("=== Trusted SSH keys ===\n");
    if candidates.is_empty() {
        println!("  No authorized keys found on this host.");
    }
    for (i, candidate) in candidates.iter().enumerate() {
        let fingerprint = candidate.key.fingerprint().unwrap_or_default();
        println!(
            "  {}) {} {} {} ({})",
            i + 1,
            candidate.key.key_type,
            fingerprint,
            candidate.key.comment.as_deref().unwrap_or(""),
            candidate.source.display()
        );
    }
    println!();

    let question = if candidates.is_empty() {
        "Type 'new' to generate a keypair:"
    } else {
        "Keys to trust (numbers, 'all', or 'new' to generate a keypair):"
    };

    let mut selection = None;
    for _ in 0..SELECTION_ATTEMPTS {
        let answer = prompter.ask(question)?;
        selection = parse_selection(&answer, candidates.len());
        if selection.is_some() {
            break;
        }
        println!("  Not understood: {:?}", answer.trim());
    }

    match selection {
        None => Err(LaunchError::aborted("trusted key selection").into()),
        Some(KeySelection::Keys(indices)) => Ok(TrustedKeys {
            keys: indices.iter().map(|&i| candidates[i].key.clone()).collect(),
            generated: false,
        }),
        Some(KeySelection::GenerateNew) => generate_trusted_key(prompter, tool, work, comment),
    }
}

fn generate_trusted_key(
    prompter: &mut dyn Prompter,
    tool: &mut dyn KeyTool,
    work: &Path,
    comment: &str,
) -> Result<TrustedKeys> {
    fs::create_dir_all(work).with_context(|| format!("Failed to create {}", work.display()))?;
    let private_path = work.join("ramroot_ed25519");
    let public_path = work.join("ramroot_ed25519.pub");
    if private_path.exists() {
        bail!("{} already exists; refusing to overwrite a key", private_path.display());
    }

    tool.generate_keypair(&private_path, comment)?;
    let private = fs::read_to_string(&private_path)
        .with_context(|| format!("Failed to read {}", private_path.display()))?;
    let public = fs::read_to_string(&public_path)
        .ok()
        .as_deref()
        .and_then(find_public_key)
        .with_context(|| format!("No public key in {}", public_path.display()))?;

    prompter.reveal("private key for root@ramroot", &private)?;
    // Shown once, never kept on disk
    fs::remove_file(&private_path)
        .with_context(|| format!("Failed to remove {}", private_path.display()))?;

    if !confirm(
        prompter,
        "Type 'yes' once the private key is stored somewhere safe:",
    )? {
        return Err(LaunchError::aborted("private key confirmation").into());
    }

    Ok(TrustedKeys {
        keys: vec![public],
        generated: true,
    })
}
