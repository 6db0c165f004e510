use std::path::{Path, PathBuf};

/// Prefix baked into every derived resource name. Bump the version suffix if
/// the transform or the wire format ever changes incompatibly.
pub const RESOURCE_PREFIX: &str = "solo-instance-v1";

/// Longest slug we will embed in a socket path. `sun_path` is only ~108 bytes
/// on Linux and the runtime dir already eats a chunk of that.
const MAX_SLUG_LEN: usize = 64;

/// Filesystem locations derived from an application identity.
///
/// The transform is the interop contract: any process (in any language) that
/// derives the same two paths from the same identity string participates in
/// the same single-instance group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePaths {
    /// Advisory lock file gating the primary role.
    pub lock: PathBuf,
    /// Unix socket the primary listens on.
    pub socket: PathBuf,
}

/// Derive the lock and socket paths for `identity`.
///
/// `runtime_dir` overrides the base directory; otherwise `$XDG_RUNTIME_DIR`
/// is used, falling back to `/tmp`. The identity is sanitized to
/// `[A-Za-z0-9._-]` (everything else becomes `_`) and truncated to
/// [`MAX_SLUG_LEN`] bytes.
pub fn derive_paths(identity: &str, runtime_dir: Option<&Path>) -> ResourcePaths {
    let base = match runtime_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var_os("XDG_RUNTIME_DIR")
            .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from),
    };

    let slug = sanitize(identity);
    ResourcePaths {
        lock: base.join(format!("{RESOURCE_PREFIX}-{slug}.lock")),
        socket: base.join(format!("{RESOURCE_PREFIX}-{slug}.sock")),
    }
}

fn sanitize(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SLUG_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_same_paths() {
        let a = derive_paths("My App", Some(Path::new("/tmp")));
        let b = derive_paths("My App", Some(Path::new("/tmp")));
        assert_eq!(a, b);
        assert_ne!(a.lock, a.socket);
    }

    #[test]
    fn hostile_identity_is_sanitized() {
        let paths = derive_paths("../../etc/passwd", Some(Path::new("/tmp")));
        let name = paths.lock.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/'));
        assert!(name.starts_with(RESOURCE_PREFIX));
    }

    #[test]
    fn long_identity_is_truncated() {
        let long = "x".repeat(500);
        let paths = derive_paths(&long, Some(Path::new("/tmp")));
        let name = paths.socket.file_name().unwrap().to_str().unwrap();
        assert!(name.len() < MAX_SLUG_LEN + RESOURCE_PREFIX.len() + 16);
    }
}
