//! Kernel overlay mount backend (Linux)
//!
//! Hands the layer stack to the kernel's `overlay` filesystem. Only the
//! configuration is shared with the user-space engine; once mounted, the
//! kernel serves every operation.

use super::MountBackend;
use crate::config::{MountConfig, OverlayConfig};
use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Build the overlay option string
///
/// `lowerdir` lists the highest-priority layer first, matching the order the
/// user-space resolver searches.
pub fn mount_options(config: &OverlayConfig) -> Result<String> {
    if config.lower.is_empty() {
        return Err(Error::InvalidConfig(
            "at least one lower layer is required".into(),
        ));
    }

    let lower = config
        .lower
        .iter()
        .rev()
        .map(|p| option_path(p))
        .collect::<Result<Vec<_>>>()?
        .join(":");

    match config.upper_dir() {
        Some(upper) => {
            let workdir = config
                .workdir
                .as_deref()
                .filter(|w| !w.as_os_str().is_empty())
                .ok_or_else(|| {
                    Error::InvalidConfig("workdir is required when upper is set".into())
                })?;
            Ok(format!(
                "upperdir={},workdir={},lowerdir={}",
                option_path(upper)?,
                option_path(workdir)?,
                lower
            ))
        }
        None => Ok(format!("lowerdir={}", lower)),
    }
}

/// A path as it may appear in the option string
fn option_path(path: &Path) -> Result<String> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::InvalidConfig(format!("{:?} is not valid UTF-8", path)))?;
    if s.contains([',', ':']) {
        return Err(Error::InvalidConfig(format!(
            "{:?} contains a character reserved by overlay options",
            path
        )));
    }
    Ok(s.to_string())
}

/// Mount points listed in a mountinfo table
pub fn parse_mountinfo(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_octal)
        .collect()
}

/// Decode the `\NNN` escapes mountinfo uses for spaces and friends
fn unescape_octal(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let is_escape = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if is_escape {
            let code = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Whether `target` is currently a mount point of this process's namespace
pub fn is_mounted_at(target: &Path) -> Result<bool> {
    let target = match fs::canonicalize(target) {
        Ok(path) => path,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::at(target, e)),
    };
    let table = fs::read_to_string(MOUNTINFO).map_err(|e| Error::at(MOUNTINFO, e))?;
    Ok(parse_mountinfo(&table).iter().any(|p| *p == target))
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// The union mounted by the kernel's overlay filesystem
pub struct KernelOverlay {
    overlay: OverlayConfig,
    target: PathBuf,
    retries: u32,
    interval: Duration,
}

impl KernelOverlay {
    pub fn new(overlay: OverlayConfig, target: impl Into<PathBuf>, config: &MountConfig) -> Self {
        Self {
            overlay,
            target: target.into(),
            retries: config.unmount_retries,
            interval: Duration::from_millis(config.unmount_interval_ms),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Every directory the kernel expects to exist
    fn required_dirs(&self) -> Vec<&Path> {
        let mut dirs = vec![self.target.as_path()];
        dirs.extend(self.overlay.upper_dir());
        dirs.extend(
            self.overlay
                .workdir
                .as_deref()
                .filter(|w| !w.as_os_str().is_empty()),
        );
        dirs.extend(self.overlay.lower.iter().map(PathBuf::as_path));
        dirs
    }
}

impl MountBackend for KernelOverlay {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn mount(&self) -> Result<()> {
        let options = mount_options(&self.overlay)?;

        for dir in self.required_dirs() {
            fs::create_dir_all(dir).map_err(|e| Error::at(dir, e))?;
        }

        debug!("mount -t overlay overlay -o {} {:?}", options, self.target);
        mount(
            Some("overlay"),
            self.target.as_path(),
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|errno| match errno {
            Errno::EPERM | Errno::EACCES => Error::PermissionDenied(self.target.clone()),
            other => Error::Mount {
                target: self.target.clone(),
                source: errno_to_io(other),
            },
        })?;

        info!("Mounted overlay at {:?}", self.target);
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        for attempt in 0..=self.retries {
            if !is_mounted_at(&self.target)? {
                if attempt > 0 {
                    info!("Unmounted overlay at {:?}", self.target);
                }
                return Ok(());
            }

            match umount2(self.target.as_path(), MntFlags::MNT_DETACH) {
                Ok(()) => {}
                Err(Errno::EBUSY) | Err(Errno::EAGAIN) => {
                    debug!("{:?} busy, retrying ({}/{})", self.target, attempt + 1, self.retries);
                    thread::sleep(self.interval);
                }
                // Already gone between the check and the call
                Err(Errno::EINVAL) => {}
                Err(Errno::EPERM) | Err(Errno::EACCES) => {
                    return Err(Error::PermissionDenied(self.target.clone()));
                }
                Err(other) => {
                    return Err(Error::Mount {
                        target: self.target.clone(),
                        source: errno_to_io(other),
                    });
                }
            }
        }

        // The last attempt may have succeeded
        if !is_mounted_at(&self.target)? {
            info!("Unmounted overlay at {:?}", self.target);
            return Ok(());
        }

        Err(Error::Mount {
            target: self.target.clone(),
            source: errno_to_io(Errno::EBUSY),
        })
    }

    fn is_mounted(&self) -> bool {
        is_mounted_at(&self.target).unwrap_or(false)
    }
}
