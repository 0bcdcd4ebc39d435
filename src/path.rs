//! Path handling for the uniform interface.
//!
//! Drivers consume ASCII paths with `/` separators; `/` alone names the
//! root. The UEFI side talks CHAR16 with `\` separators, so the boundary
//! conversion lives here too.

use crate::error::{FsError, Result};
use crate::{MAX_NAME_LEN, MAX_PATH_LEN};

/// Validates a path and splits it into components. The root path yields an
/// empty component list.
pub(crate) fn split(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(FsError::InvalidArgument("empty path"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::InvalidArgument("path too long"));
    }
    if !path.is_ascii() {
        return Err(FsError::InvalidArgument("path is not ASCII"));
    }
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument("path is not absolute"));
    }
    let mut components = Vec::new();
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        if component.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidArgument("name too long"));
        }
        components.push(component);
    }
    Ok(components)
}

/// Splits a path into the components of its parent directory and the leaf
/// name. Fails on the root path, which has no leaf.
pub(crate) fn parent_and_leaf(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut components = split(path)?;
    let leaf = components.pop().ok_or(FsError::InvalidArgument(
        "operation needs a non-root path",
    ))?;
    Ok((components, leaf))
}

/// Validates a single name as written by `rename`.
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidArgument("name too long"));
    }
    if !name.is_ascii() || name.contains('/') {
        return Err(FsError::InvalidArgument("illegal character in name"));
    }
    Ok(())
}

/// ASCII-range case-insensitive name comparison. Non-ASCII code points never
/// appear here; lossy conversion has already replaced them with `?`.
pub(crate) fn eq_fold(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Converts a NUL-terminated CHAR16 path with `\` separators, as the UEFI
/// caller supplies it, into the crate's ASCII `/` form. Code units outside
/// the ASCII range become `?`.
pub fn from_ucs2(units: &[u16]) -> String {
    let mut out = String::with_capacity(units.len());
    for &u in units {
        match u {
            0 => break,
            0x5c => out.push('/'), // '\'
            1..=0x7f => out.push(u as u8 as char),
            _ => out.push('?'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_components() {
        assert_eq!(split("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split("//a//b/").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(matches!(split(""), Err(FsError::InvalidArgument(_))));
        assert!(matches!(split("a/b"), Err(FsError::InvalidArgument(_))));
        let long = format!("/{}", "x".repeat(MAX_PATH_LEN));
        assert!(matches!(split(&long), Err(FsError::InvalidArgument(_))));
        let long_name = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(split(&long_name), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn parent_and_leaf_splits() {
        let (parent, leaf) = parent_and_leaf("/a/b/c.txt").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(leaf, "c.txt");
        assert!(parent_and_leaf("/").is_err());
    }

    #[test]
    fn ucs2_boundary_conversion() {
        let units: Vec<u16> = "\\docs\\readme.txt"
            .chars()
            .map(|c| c as u16)
            .chain([0])
            .collect();
        assert_eq!(from_ucs2(&units), "/docs/readme.txt");
        assert_eq!(from_ucs2(&[0x5c, 0x00e9, 0]), "/?");
    }
}
