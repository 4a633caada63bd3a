//! minijail-based sandbox around untrusted fuzz targets.
//!
//! A [`SandboxSession`] owns a temporary chroot directory and the full
//! argument vector that runs the target inside minijail. The root
//! filesystem is mounted read-only; everything the target may write has to
//! be bound explicitly.
//!
//! minijail cannot keep the working directory across the namespace
//! switch, so the target is started through `process_wrapper <cwd>
//! <argv...>`, which `chdir`s before `exec`.

use crate::binding::{Binding, BindingError, parse_binding_list};
use crate::tools::{Tool, ToolError, ToolFinder};
use std::env;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Additional bindings, colon separated, in minijail's
/// `<src>[,<dest>[,<writable>]]` syntax.
pub const BINDINGS_ENV: &str = "CIFUZZ_MINIJAIL_BINDINGS";

/// When set, the sandbox starts `/bin/sh` instead of the target.
pub const DEBUG_ENV: &str = "DEBUG_MINIJAIL";

// Mount flags from <sys/mount.h>. Spelled out because the values are
// passed to minijail as numbers.
const MS_RDONLY: u64 = 0x1;
const MS_NOSUID: u64 = 0x2;
const MS_NODEV: u64 = 0x4;
const MS_BIND: u64 = 0x1000;
const MS_REC: u64 = 0x4000;
const MS_STRICTATIME: u64 = 0x100_0000;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("No command given to run in the sandbox")]
    EmptyCommand,
    #[error("Failed to resolve symlinks of {path:?}: {source}")]
    ResolveExecutable { path: PathBuf, source: io::Error },
    #[error("Failed to create {path:?} for the sandbox: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("Failed to determine the current working directory: {0}")]
    CurrentDir(io::Error),
    #[error("Failed to set up the sandbox: {0}")]
    Tool(#[from] ToolError),
    #[error("Invalid binding in ${BINDINGS_ENV}: {0}")]
    Binding(#[from] BindingError),
}

/// What to run in the sandbox and what it may see.
#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Target argv. `args[0]` must be the executable.
    pub args: Vec<String>,
    pub bindings: Vec<Binding>,
    /// Directory the target may write to, besides the working directory.
    pub output_dir: Option<PathBuf>,
    /// Raw value of `CIFUZZ_MINIJAIL_BINDINGS`.
    pub extra_bindings: Option<String>,
    /// Start an interactive shell instead of the target.
    pub debug_shell: bool,
}

impl SandboxOptions {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Fills `extra_bindings` and `debug_shell` from the environment.
    pub fn with_env(mut self) -> Self {
        self.extra_bindings = env::var(BINDINGS_ENV).ok().filter(|v| !v.is_empty());
        self.debug_shell = env::var_os(DEBUG_ENV).is_some_and(|v| !v.is_empty());
        self
    }
}

/// A prepared sandbox. Not shareable between target processes.
#[derive(Debug)]
pub struct SandboxSession {
    chroot: Option<TempDir>,
    chroot_path: PathBuf,
    args: Vec<String>,
}

impl SandboxSession {
    /// Builds the chroot skeleton and the minijail command line.
    ///
    /// On error nothing needs to be cleaned up: the chroot directory, if
    /// it was already created, is removed before returning.
    pub fn new(
        mut options: SandboxOptions,
        finder: &dyn ToolFinder,
    ) -> Result<Self, SandboxError> {
        let first = options.args.first().ok_or(SandboxError::EmptyCommand)?;

        // The sandbox only sees bound paths, so a symlink pointing outside
        // of them would dangle.
        let executable =
            fs::canonicalize(first).map_err(|source| SandboxError::ResolveExecutable {
                path: PathBuf::from(first),
                source,
            })?;
        options.args[0] = executable.display().to_string();

        let minijail = finder.tool_path(Tool::Minijail)?;
        let process_wrapper = finder.tool_path(Tool::ProcessWrapper)?;
        let workdir = env::current_dir().map_err(SandboxError::CurrentDir)?;

        let chroot = tempfile::Builder::new()
            .prefix("minijail-chroot-")
            .tempdir()
            .map_err(|source| SandboxError::CreateDir {
                path: env::temp_dir(),
                source,
            })?;
        let chroot_path = chroot.path().to_path_buf();

        for dir in ["proc", "tmp", "dev/shm"] {
            create_dir(&chroot_path.join(dir))?;
        }

        let mut args = vec![minijail.display().to_string()];
        args.extend(fixed_minijail_args());
        // Without preload hooking a static minijail0 works and its error
        // messages are not swallowed. Some jailing is lost, which is fine
        // since the sandbox guards against accidents, not attackers.
        args.extend(["-T", "static", "--ambient"].map(String::from));
        args.push("-P".to_string());
        args.push(chroot_path.display().to_string());

        let mut bindings = std::mem::take(&mut options.bindings);
        bindings.extend(default_bindings());
        if let Some(output_dir) = &options.output_dir {
            bindings.push(Binding::read_write(output_dir));
        }
        // Targets may write scratch files to the working directory.
        bindings.push(Binding::read_write(&workdir));
        bindings.push(Binding::read_only(&executable));
        bindings.push(Binding::read_only(&process_wrapper));

        if let Some(extra) = &options.extra_bindings {
            for binding in parse_binding_list(extra)? {
                if !binding.source.exists() {
                    debug!(
                        "Skipping binding {}: No such file or directory",
                        binding.source.display()
                    );
                    continue;
                }
                debug!("Adding binding {}", binding.source.display());
                bindings.push(binding);
            }
        }

        for binding in &bindings {
            if !binding.source.exists() {
                continue;
            }
            create_mount_point(&chroot_path, binding)?;
            args.push("-b".to_string());
            args.push(binding.to_string());
        }

        args.push("--".to_string());
        args.push(process_wrapper.display().to_string());
        args.push(workdir.display().to_string());

        if options.debug_shell {
            info!("Sandboxed command: {}", options.args.join(" "));
            args.push("/bin/sh".to_string());
        } else {
            args.extend(options.args);
        }

        Ok(Self {
            chroot: Some(chroot),
            chroot_path,
            args,
        })
    }

    /// The argv to execute.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_path
    }

    /// Removes the chroot directory. Calling it again is a no-op.
    pub fn cleanup(&mut self) {
        if let Some(chroot) = self.chroot.take() {
            if let Err(e) = chroot.close() {
                warn!(
                    "Failed to remove sandbox directory {}: {}",
                    self.chroot_path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Recognizes minijail's own diagnostics, which it writes to the same
/// stderr as the target.
pub fn is_minijail_log_line(line: &str) -> bool {
    line.starts_with("libminijail[")
}

fn fixed_minijail_args() -> Vec<String> {
    let tmpfs_flags = MS_NOSUID | MS_NODEV | MS_STRICTATIME;
    let mut args: Vec<String> = [
        // user namespace, uid 0 inside maps to the current user
        "-U", "-m", "-M",
        "-c", "0", // drop all capabilities
        "-n", // no_new_privs
        "-v", "-p", "-l", // mount, PID and IPC namespaces
        "-I", // run the jailed process as init
    ]
    .map(String::from)
    .to_vec();

    let mounts = [
        format!("/,/,none,{}", MS_RDONLY | MS_BIND | MS_REC),
        format!("proc,/proc,proc,{MS_RDONLY}"),
        format!("tmpfs,/dev/shm,tmpfs,{tmpfs_flags},mode=1777"),
        // Fresh tmpfs mounts instead of the host's, so PID files and
        // sockets of concurrent runs cannot collide.
        format!("tmpfs,/tmp,tmpfs,{tmpfs_flags},mode=1777"),
        format!("tmpfs,/run,tmpfs,{tmpfs_flags},mode=1777"),
        format!("tmpfs,/var/run,tmpfs,{tmpfs_flags},mode=1777"),
    ];
    for mount in mounts {
        args.push("-k".to_string());
        args.push(mount);
    }
    args.push("--logging=stderr".to_string());
    args
}

fn default_bindings() -> [Binding; 2] {
    // Device nodes must be bound read-write, otherwise minijail fails to
    // bind-remount them.
    [
        Binding::read_write("/dev/null"),
        Binding::read_write("/dev/urandom"),
    ]
}

fn create_dir(path: &Path) -> Result<(), SandboxError> {
    fs::create_dir_all(path).map_err(|source| SandboxError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn create_mount_point(chroot: &Path, binding: &Binding) -> Result<(), SandboxError> {
    let target = binding.target();
    let relative = target.strip_prefix("/").unwrap_or(target);
    let mount_point = chroot.join(relative);

    if binding.source.is_dir() {
        return create_dir(&mount_point);
    }
    if let Some(parent) = mount_point.parent() {
        create_dir(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&mount_point)
        .map_err(|source| SandboxError::CreateDir {
            path: mount_point.clone(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::StaticToolFinder;

    struct Fixture {
        _dir: TempDir,
        executable: PathBuf,
        link: PathBuf,
        finder: StaticToolFinder,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let executable = dir.path().join("fuzz_target");
        fs::write(&executable, b"#!/bin/sh\n").unwrap();
        let link = dir.path().join("fuzz_target_link");
        std::os::unix::fs::symlink(&executable, &link).unwrap();
        let wrapper = dir.path().join("process_wrapper");
        fs::write(&wrapper, b"").unwrap();
        let finder = StaticToolFinder::new()
            .with(Tool::Minijail, "/usr/local/bin/minijail0")
            .with(Tool::ProcessWrapper, &wrapper);
        Fixture {
            executable: fs::canonicalize(executable).unwrap(),
            link,
            finder,
            _dir: dir,
        }
    }

    fn flag_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn builds_minijail_command_line() {
        let fx = fixture();
        let options = SandboxOptions::new(vec![
            fx.link.display().to_string(),
            "-runs=10".to_string(),
        ]);
        let session = SandboxSession::new(options, &fx.finder).unwrap();
        let args = session.args();

        assert_eq!(args[0], "/usr/local/bin/minijail0");
        assert_eq!(
            &args[1..11],
            &["-U", "-m", "-M", "-c", "0", "-n", "-v", "-p", "-l", "-I"]
        );
        assert!(session.chroot_dir().join("proc").is_dir());
        assert!(session.chroot_dir().join("tmp").is_dir());
        assert!(session.chroot_dir().join("dev/shm").is_dir());
        assert_eq!(
            flag_values(args, "-P"),
            vec![session.chroot_dir().display().to_string()]
        );

        let mounts = flag_values(args, "-k");
        assert!(mounts.contains(&"/,/,none,20481"));
        assert!(mounts.iter().any(|m| m.starts_with("tmpfs,/var/run,tmpfs,")));

        let bindings = flag_values(args, "-b");
        let cwd = env::current_dir().unwrap();
        assert!(bindings.contains(&"/dev/null,/dev/null,1"));
        assert!(bindings.contains(&format!("{0},{0},1", cwd.display()).as_str()));
        assert!(bindings.contains(&fx.executable.display().to_string().as_str()));

        // The symlink was resolved and the wrapper restores the cwd.
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 2], cwd.display().to_string());
        assert_eq!(args[sep + 3], fx.executable.display().to_string());
        assert_eq!(args.last().unwrap(), "-runs=10");
    }

    #[test]
    fn extra_bindings_skip_missing_sources() {
        let fx = fixture();
        let present = tempfile::tempdir().unwrap();
        let mut options = SandboxOptions::new(vec![fx.executable.display().to_string()]);
        options.extra_bindings = Some(format!(
            "/definitely/not/here:{},/mnt/data,1",
            present.path().display()
        ));
        let session = SandboxSession::new(options, &fx.finder).unwrap();

        let bindings = flag_values(session.args(), "-b");
        assert!(!bindings.iter().any(|b| b.contains("/definitely/not/here")));
        assert!(bindings.contains(&format!("{},/mnt/data,1", present.path().display()).as_str()));
        assert!(session.chroot_dir().join("mnt/data").is_dir());
    }

    #[test]
    fn debug_shell_replaces_target() {
        let fx = fixture();
        let mut options = SandboxOptions::new(vec![fx.executable.display().to_string()]);
        options.debug_shell = true;
        let session = SandboxSession::new(options, &fx.finder).unwrap();
        assert_eq!(session.args().last().unwrap(), "/bin/sh");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let fx = fixture();
        let options = SandboxOptions::new(vec![fx.executable.display().to_string()]);
        let mut session = SandboxSession::new(options, &fx.finder).unwrap();
        let chroot = session.chroot_dir().to_path_buf();
        assert!(chroot.exists());
        session.cleanup();
        assert!(!chroot.exists());
        session.cleanup();
    }

    #[test]
    fn missing_executable_is_fatal() {
        let fx = fixture();
        let options = SandboxOptions::new(vec!["/no/such/fuzz_target".to_string()]);
        let err = SandboxSession::new(options, &fx.finder).unwrap_err();
        assert!(matches!(err, SandboxError::ResolveExecutable { .. }));
    }

    #[test]
    fn missing_minijail_is_fatal() {
        let fx = fixture();
        let options = SandboxOptions::new(vec![fx.executable.display().to_string()]);
        let err = SandboxSession::new(options, &StaticToolFinder::new()).unwrap_err();
        assert!(matches!(err, SandboxError::Tool(_)));
    }

    #[test]
    fn recognizes_minijail_log_lines() {
        assert!(is_minijail_log_line(
            "libminijail[12]: mount /dev/null -> /dev/null type ''"
        ));
        assert!(!is_minijail_log_line("INFO: Seed: 1234"));
    }
}
