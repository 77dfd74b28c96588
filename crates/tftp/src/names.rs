//! Remote file name validation
//!
//! Names travel as ASCII and are resolved relative to the server root, so a
//! name is normalized lexically and refused when it would climb above that
//! root or contains multibyte characters.

use crate::error::{ErrorKind, Result};

/// Normalize a remote file name
///
/// Empty and `.` segments are dropped, `..` segments cancel the preceding
/// segment and a leading `/` is removed. A name that still starts with `..`
/// after that, that ends up empty, or that contains non-ASCII characters is
/// rejected with `EBADNAME`.
///
/// # Examples
/// ```
/// use tftp::normalize_filename;
///
/// assert_eq!(normalize_filename("/pxe/./boot/../grub.cfg").unwrap(), "pxe/grub.cfg");
/// assert!(normalize_filename("../etc/passwd").is_err());
/// ```
pub fn normalize_filename(name: &str) -> Result<String> {
    if !name.is_ascii() {
        return Err(ErrorKind::BadName.into());
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ErrorKind::BadName.into());
                }
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(ErrorKind::BadName.into());
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names() {
        assert_eq!(normalize_filename("boot.img").unwrap(), "boot.img");
        assert_eq!(normalize_filename("a//b/").unwrap(), "a/b");
        assert_eq!(normalize_filename("a/b/../../c").unwrap(), "c");
    }

    #[test]
    fn test_rejects_escape() {
        for name in ["..", "../x", "a/../../x", "/../x"] {
            assert_eq!(
                normalize_filename(name).unwrap_err().kind(),
                Some(ErrorKind::BadName),
                "{name}"
            );
        }
    }

    #[test]
    fn test_rejects_multibyte_and_empty() {
        assert!(normalize_filename("caf\u{e9}.txt").is_err());
        assert!(normalize_filename("").is_err());
        assert!(normalize_filename("/./").is_err());
    }
}
