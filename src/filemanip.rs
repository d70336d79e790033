//! Filename helpers: split a path into directory/base/extension and rebuild
//! sibling names with a new prefix or suffix.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Extensions treated as a single unit when splitting.
const COMPOUND_EXTENSIONS: [&str; 3] = [".nii.gz", ".tar.gz", ".niml.dset"];

/// A path split into its parent directory, base name and extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitName {
    pub dir: PathBuf,
    pub base: String,
    pub ext: String,
}

/// Split `path` into directory, base name and extension.
///
/// `.nii.gz` and the other compound extensions are kept whole, so
/// `/data/img.nii.gz` splits into `/data`, `img`, `.nii.gz`.
pub fn split_filename(path: impl AsRef<Path>) -> SplitName {
    let path = path.as_ref();
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    for compound in COMPOUND_EXTENSIONS {
        if name.len() <= compound.len() {
            continue;
        }
        let cut = name.len() - compound.len();
        if let (Some(base), Some(tail)) = (name.get(..cut), name.get(cut..)) {
            if tail.eq_ignore_ascii_case(compound) {
                return SplitName {
                    dir,
                    base: base.to_string(),
                    ext: tail.to_string(),
                };
            }
        }
    }

    let (base, ext) = split_extension(&name);
    SplitName {
        dir,
        base: base.to_string(),
        ext: ext.to_string(),
    }
}

// Leading dots never start an extension (`.bashrc` has none).
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if name[..idx].chars().any(|c| c != '.') => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Rebuild `path` as `<newpath or dir>/<prefix><base><suffix>[ext]`.
///
/// The original extension is kept only when `keep_ext` is set.
pub fn fname_presuffix(
    path: impl AsRef<Path>,
    prefix: &str,
    suffix: &str,
    newpath: Option<&Path>,
    keep_ext: bool,
) -> PathBuf {
    let split = split_filename(path);
    let ext = if keep_ext { split.ext.as_str() } else { "" };
    let dir = newpath.map(Path::to_path_buf).unwrap_or(split.dir);
    dir.join(format!("{}{}{}{}", prefix, split.base, suffix, ext))
}

/// Resolve `path` against the process working directory.
pub fn absolute_from_cwd(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir()?
    };
    Ok(absolute(&base, path))
}

/// Resolve `path` against `base` and normalise `.`/`..` lexically.
///
/// The filesystem is never consulted.
pub fn absolute(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
