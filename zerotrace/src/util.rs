use std::path::Path;

/// Upper bound on error text carried into `SpaceError` variants.
const MAX_REASON_LEN: usize = 256;

/// Strip host paths out of a command's error output.
///
/// Every occurrence of `root` is replaced with `<mount-root>`, so messages
/// keep their meaning ("target is busy", "permission denied") without
/// revealing where spaces live. The result is trimmed and capped.
pub(crate) fn redact_reason(message: &str, root: &Path) -> String {
    let root = root.to_string_lossy();
    let redacted = if root.is_empty() || root == "/" {
        message.trim().to_string()
    } else {
        message.trim().replace(root.as_ref(), "<mount-root>")
    };

    if redacted.len() <= MAX_REASON_LEN {
        return redacted;
    }
    let mut end = MAX_REASON_LEN;
    while !redacted.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &redacted[..end])
}

/// Whole milliseconds of a duration, saturating.
pub(crate) fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_replaces_mount_root() {
        let msg = "umount: /run/zerotrace/spaces/zt-abc: target is busy.";
        assert_eq!(
            redact_reason(msg, Path::new("/run/zerotrace/spaces")),
            "umount: <mount-root>/zt-abc: target is busy."
        );
    }

    #[test]
    fn redact_leaves_unrelated_text() {
        assert_eq!(
            redact_reason("  permission denied\n", Path::new("/run/zerotrace")),
            "permission denied"
        );
    }

    #[test]
    fn redact_ignores_filesystem_root() {
        assert_eq!(redact_reason("mount: /a/b failed", Path::new("/")), "mount: /a/b failed");
    }

    #[test]
    fn redact_caps_length_on_char_boundary() {
        let long = "é".repeat(300);
        let out = redact_reason(&long, Path::new("/x"));
        assert!(out.ends_with("..."));
        assert!(out.len() <= MAX_REASON_LEN + 3);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(std::time::Duration::from_millis(42)), 42);
        assert_eq!(millis(std::time::Duration::MAX), u64::MAX);
    }
}
