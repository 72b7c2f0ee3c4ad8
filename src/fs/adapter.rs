//! Generic read-only filesystem adapter
//!
//! [`ReadFs`] is the read side of the union as a plain trait, so consumers that
//! only need to read a merged view (archiving a server directory, for
//! instance) can do so without an OS mount, on any platform.

use crate::error::{Error, Result};
use crate::fs::merge::DirEntry;
use crate::fs::union::UnionFs;
use crate::fs::{path, sys};
use regex::bytes::Regex;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read-only access to a tree addressed by logical paths
pub trait ReadFs {
    fn open(&self, path: &Path) -> Result<File>;

    /// Metadata with symlinks followed
    fn stat(&self, path: &Path) -> Result<Metadata>;

    /// Metadata of the entry itself
    fn lstat(&self, path: &Path) -> Result<Metadata>;

    fn read_link(&self, path: &Path) -> Result<PathBuf>;

    /// Entries of a directory, sorted by name
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(path)?
            .read_to_end(&mut data)
            .map_err(|e| Error::at(path, e))?;
        Ok(data)
    }

    /// Paths matching a shell-style pattern, sorted
    ///
    /// Matching is per path component: `*` and `?` never cross a `/`,
    /// `[...]` is a character class (`[!...]` negates) and `\` escapes.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let mut matches = vec![PathBuf::new()];

        for component in pattern.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let mut next = Vec::new();
            if has_magic(component) {
                let matcher = component_regex(component)?;
                for dir in &matches {
                    let entries = match self.read_dir(dir) {
                        Ok(entries) => entries,
                        Err(Error::NotFound(_)) | Err(Error::NotADirectory(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    next.extend(
                        entries
                            .into_iter()
                            .filter(|e| matcher.is_match(e.name.as_encoded_bytes()))
                            .map(|e| e.path),
                    );
                }
            } else {
                let literal = unescape(component);
                for dir in &matches {
                    let candidate = dir.join(&literal);
                    if self.lstat(&candidate).is_ok() {
                        next.push(candidate);
                    }
                }
            }
            matches = next;
        }

        matches.retain(|p| !path::is_root(p));
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    /// A view of this tree rooted at `dir`
    fn sub(&self, dir: &Path) -> Result<SubFs<'_, Self>>
    where
        Self: Sized,
    {
        let root = path::normalize(dir)?;
        if !self.stat(&root)?.is_dir() {
            return Err(Error::NotADirectory(root));
        }
        Ok(SubFs { inner: self, root })
    }

    /// Visit every entry below `root` depth-first, parents before children
    fn walk(&self, root: &Path, visit: &mut dyn FnMut(&DirEntry) -> Result<()>) -> Result<()> {
        for entry in self.read_dir(root)? {
            visit(&entry)?;
            if entry.is_dir() {
                self.walk(&entry.path, visit)?;
            }
        }
        Ok(())
    }
}

impl ReadFs for UnionFs {
    fn open(&self, path: &Path) -> Result<File> {
        UnionFs::open(self, path)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        UnionFs::stat(self, path)
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        UnionFs::lstat(self, path)
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        UnionFs::read_link(self, path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        UnionFs::read_dir(self, path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        UnionFs::read_file(self, path)
    }
}

/// A [`ReadFs`] restricted to one sub-directory of another
pub struct SubFs<'a, F: ReadFs + ?Sized> {
    inner: &'a F,
    root: PathBuf,
}

impl<'a, F: ReadFs + ?Sized> SubFs<'a, F> {
    /// Logical root of this view inside the parent tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn outer(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root.join(path::normalize(path)?))
    }

    /// Rewrite an error's path back into this view's namespace
    fn inner_err(&self, err: Error) -> Error {
        let strip = |p: PathBuf| p.strip_prefix(&self.root).map(Path::to_path_buf).unwrap_or(p);
        match err {
            Error::NotFound(p) => Error::NotFound(strip(p)),
            Error::NotADirectory(p) => Error::NotADirectory(strip(p)),
            Error::PermissionDenied(p) => Error::PermissionDenied(strip(p)),
            other => other,
        }
    }
}

impl<'a, F: ReadFs + ?Sized> ReadFs for SubFs<'a, F> {
    fn open(&self, path: &Path) -> Result<File> {
        self.inner.open(&self.outer(path)?).map_err(|e| self.inner_err(e))
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.inner.stat(&self.outer(path)?).map_err(|e| self.inner_err(e))
    }

    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.inner.lstat(&self.outer(path)?).map_err(|e| self.inner_err(e))
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        self.inner.read_link(&self.outer(path)?).map_err(|e| self.inner_err(e))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let entries = self
            .inner
            .read_dir(&self.outer(path)?)
            .map_err(|e| self.inner_err(e))?;
        Ok(entries
            .into_iter()
            .map(|mut entry| {
                if let Ok(rel) = entry.path.strip_prefix(&self.root) {
                    entry.path = rel.to_path_buf();
                }
                entry
            })
            .collect())
    }
}

/// Counts reported by [`export`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Copy the merged view of `source` into the plain directory `dest`
///
/// Files, directories and symlinks are written with their modes; other
/// entry types are skipped.
pub fn export<F: ReadFs + ?Sized>(source: &F, dest: &Path) -> Result<ExportStats> {
    fs::create_dir_all(dest).map_err(|e| Error::at(dest, e))?;

    let mut stats = ExportStats::default();
    let mut dir_modes = Vec::new();

    source.walk(Path::new(""), &mut |entry| {
        let target = dest.join(&entry.path);
        let metadata = source.lstat(&entry.path)?;
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::at(&entry.path, e))?;
            dir_modes.push((target, sys::mode_of(&metadata)));
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            let link = source.read_link(&entry.path)?;
            sys::symlink(&link, &target).map_err(|e| Error::at(&entry.path, e))?;
            stats.symlinks += 1;
        } else if file_type.is_file() {
            let mut reader = source.open(&entry.path)?;
            let mut writer = File::create(&target).map_err(|e| Error::at(&entry.path, e))?;
            stats.bytes += io::copy(&mut reader, &mut writer).map_err(|e| Error::at(&entry.path, e))?;
            sys::set_mode(&target, sys::mode_of(&metadata)).map_err(|e| Error::at(&entry.path, e))?;
            stats.files += 1;
        } else {
            warn!("Skipping {:?}: {}", entry.path, sys::special_kind(&metadata));
        }
        Ok(())
    })?;

    // Deepest first, so read-only parents are sealed last
    for (dir, mode) in dir_modes.into_iter().rev() {
        sys::set_mode(&dir, mode).map_err(|e| Error::at(&dir, e))?;
    }

    debug!("Exported {:?}: {:?}", dest, stats);
    Ok(stats)
}

fn has_magic(component: &str) -> bool {
    component.contains(['*', '?', '[', '\\'])
}

fn unescape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Translate one glob component into an anchored regex
fn component_regex(component: &str) -> Result<Regex> {
    let invalid = || Error::InvalidPath(PathBuf::from(component));
    let mut re = String::from("^");
    let mut chars = component.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '\\' => {
                let escaped = chars.next().ok_or_else(invalid)?;
                re.push_str(&regex::escape(&escaped.to_string()));
            }
            '[' => {
                re.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    re.push('^');
                }
                let mut first = true;
                loop {
                    let c = chars.next().ok_or_else(invalid)?;
                    match c {
                        ']' if !first => break,
                        '-' if !first && chars.peek() != Some(&']') => re.push('-'),
                        '\\' => {
                            let escaped = chars.next().ok_or_else(invalid)?;
                            re.push_str(&regex::escape(&escaped.to_string()));
                        }
                        c => re.push_str(&regex::escape(&c.to_string())),
                    }
                    first = false;
                }
                re.push(']');
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::layer::LayerStack;
    use crate::fs::union::DEFAULT_FILE_MODE;
    use tempfile::{tempdir, TempDir};

    fn server_union() -> (TempDir, TempDir, UnionFs) {
        let upper = tempdir().unwrap();
        let lower = tempdir().unwrap();
        fs::create_dir_all(lower.path().join("plugins/essentials")).unwrap();
        fs::write(lower.path().join("plugins/essentials.jar"), b"ess").unwrap();
        fs::write(lower.path().join("plugins/worldedit.jar"), b"we").unwrap();
        fs::write(lower.path().join("plugins/essentials/config.yml"), b"c").unwrap();
        fs::write(lower.path().join("server.properties"), b"motd=hi").unwrap();

        let union = UnionFs::new(LayerStack::new(
            Some(upper.path().to_path_buf()),
            vec![lower.path().to_path_buf()],
        ));
        (upper, lower, union)
    }

    #[test]
    fn test_glob_merged_names() {
        let (_upper, _lower, union) = server_union();
        union
            .write_file("plugins/luckperms.jar", b"lp", DEFAULT_FILE_MODE)
            .unwrap();
        union.remove("plugins/worldedit.jar").unwrap();

        let found = ReadFs::glob(&union, "plugins/*.jar").unwrap();
        assert_eq!(
            found,
            vec![
                PathBuf::from("plugins/essentials.jar"),
                PathBuf::from("plugins/luckperms.jar"),
            ]
        );
        assert_eq!(
            ReadFs::glob(&union, "/*/essentials/*.yml").unwrap(),
            vec![PathBuf::from("plugins/essentials/config.yml")]
        );
        assert!(ReadFs::glob(&union, "*.wh.*").unwrap().is_empty());
    }

    #[test]
    fn test_glob_classes_and_escapes() {
        let (_upper, _lower, union) = server_union();
        assert_eq!(
            ReadFs::glob(&union, "plugins/[e-f]ssentials.jar").unwrap(),
            vec![PathBuf::from("plugins/essentials.jar")]
        );
        assert_eq!(
            ReadFs::glob(&union, "plugins/[!e]*.jar").unwrap(),
            vec![PathBuf::from("plugins/worldedit.jar")]
        );
        assert_eq!(
            ReadFs::glob(&union, "server\\.propertie?").unwrap(),
            vec![PathBuf::from("server.properties")]
        );
        assert!(matches!(
            ReadFs::glob(&union, "plugins/[abc"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_sub_view() {
        let (_upper, _lower, union) = server_union();
        let plugins = union.sub(Path::new("plugins")).unwrap();

        assert_eq!(plugins.read_file(Path::new("worldedit.jar")).unwrap(), b"we");
        let names: Vec<PathBuf> = plugins
            .read_dir(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("essentials"),
                PathBuf::from("essentials.jar"),
                PathBuf::from("worldedit.jar"),
            ]
        );
        assert_eq!(
            plugins.glob("essentials/*").unwrap(),
            vec![PathBuf::from("essentials/config.yml")]
        );
        assert!(matches!(
            plugins.stat(Path::new("missing.jar")),
            Err(Error::NotFound(ref p)) if p == Path::new("missing.jar")
        ));
        assert!(matches!(
            union.sub(Path::new("server.properties")),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_walk_order() {
        let (_upper, _lower, union) = server_union();
        let mut seen = Vec::new();
        ReadFs::walk(&union, Path::new(""), &mut |entry| {
            seen.push(entry.path.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                PathBuf::from("plugins"),
                PathBuf::from("plugins/essentials"),
                PathBuf::from("plugins/essentials/config.yml"),
                PathBuf::from("plugins/essentials.jar"),
                PathBuf::from("plugins/worldedit.jar"),
                PathBuf::from("server.properties"),
            ]
        );
    }

    #[test]
    fn test_export_merged_view() {
        let (_upper, _lower, union) = server_union();
        union
            .write_file("server.properties", b"motd=instance", DEFAULT_FILE_MODE)
            .unwrap();
        union.remove_all("plugins/essentials").unwrap();

        let out = tempdir().unwrap();
        let dest = out.path().join("bundle");
        let stats = export(&union, &dest).unwrap();

        assert_eq!(fs::read(dest.join("server.properties")).unwrap(), b"motd=instance");
        assert_eq!(fs::read(dest.join("plugins/worldedit.jar")).unwrap(), b"we");
        assert!(!dest.join("plugins/essentials").exists());
        assert!(!dest.join(".wh.plugins").exists());
        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 1);
    }
}
