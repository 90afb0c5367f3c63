//! Path validation and mapping utilities
//!
//! Every path handed to the adapter is normalized here before it can reach
//! the device. Paths are plain `/`-separated strings because they name files
//! on the device, not on the local machine.

use std::path::{Component, Path};

use crate::error::PathError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Normalize an absolute path within the mounted namespace.
///
/// Rejects relative paths, null bytes, overlong paths and names, and any
/// `..` component. `.` components and repeated separators are dropped, so
/// `/a//./b/` becomes `/a/b`.
pub fn normalize(path: &str) -> Result<String, PathError> {
    if path.contains('\0') {
        return Err(PathError::NullByte);
    }

    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong {
            len: path.len(),
            max: MAX_PATH_LEN,
        });
    }

    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }

    let mut result = String::with_capacity(path.len());

    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                if name.len() > MAX_FILENAME_LEN {
                    return Err(PathError::TooLong {
                        len: name.len(),
                        max: MAX_FILENAME_LEN,
                    });
                }
                result.push('/');
                result.push_str(&name);
            }
            Component::ParentDir => {
                return Err(PathError::Traversal(path.to_string()));
            }
            Component::Prefix(_) => {
                return Err(PathError::NotAbsolute(path.to_string()));
            }
        }
    }

    if result.is_empty() {
        result.push('/');
    }

    Ok(result)
}

/// Map a normalized mount-relative path onto the device root.
pub fn device_path(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    if path == "/" {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{}{}", root, path)
    }
}

/// Parent directory of a normalized path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of a normalized path; empty for the root
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Join a directory path and a validated file name
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Whether `path` is `dir` itself or lies beneath it
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return true;
    }
    path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::InvalidName("empty filename".into()));
    }

    if name.contains('\0') {
        return Err(PathError::NullByte);
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(PathError::TooLong {
            len: name.len(),
            max: MAX_FILENAME_LEN,
        });
    }

    if name == "." || name == ".." {
        return Err(PathError::Traversal(name.to_string()));
    }

    if name.contains('/') {
        return Err(PathError::InvalidName(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/sdcard/DCIM").unwrap(), "/sdcard/DCIM");
        assert_eq!(normalize("/a//./b/").unwrap(), "/a/b");
    }

    #[test]
    fn test_normalize_rejects_traversal() {
        assert!(matches!(
            normalize("/../etc/passwd"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            normalize("/a/b/../../.."),
            Err(PathError::Traversal(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_relative_and_null() {
        assert!(matches!(normalize("foo.txt"), Err(PathError::NotAbsolute(_))));
        assert!(matches!(normalize(""), Err(PathError::NotAbsolute(_))));
        assert_eq!(normalize("/a\0b"), Err(PathError::NullByte));
    }

    #[test]
    fn test_path_length_limits() {
        let long_name = format!("/{}", "a".repeat(MAX_FILENAME_LEN + 1));
        assert!(matches!(normalize(&long_name), Err(PathError::TooLong { .. })));

        let long_path = "/a".repeat(MAX_PATH_LEN);
        assert!(matches!(normalize(&long_path), Err(PathError::TooLong { .. })));
    }

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("/", "/"), "/");
        assert_eq!(device_path("/", "/sdcard"), "/sdcard");
        assert_eq!(device_path("/sdcard", "/"), "/sdcard");
        assert_eq!(device_path("/sdcard/", "/Music/a.mp3"), "/sdcard/Music/a.mp3");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/"), "");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("file.txt").is_ok());
        assert!(validate_filename("my-file_v2.tar.gz").is_ok());

        assert!(validate_filename("").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("file/name").is_err());
        assert!(validate_filename("file\0name").is_err());
    }
}
