use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;

/// Rejects names the server is known to reject, before the entry is even
/// minted locally (spec §4.8 "Name restrictions"). Grounded on the
/// audit-before-use shape of a `PathAuditor`: a pure function, no state,
/// called on the hot path of every `mknod`/`mkdir`/`rename`.
pub fn validate(name: &str, denylist: &[String]) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidName("name must not be empty".into()));
    }
    if name == "." || name == ".." {
        return Err(CoreError::InvalidName(format!("reserved name: {name}")));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(CoreError::InvalidName(format!("name contains a path separator: {name}")));
    }
    if name.contains('\0') {
        return Err(CoreError::InvalidName("name contains a NUL byte".into()));
    }
    let stem = name.split('.').next().unwrap_or(name);
    if denylist.iter().any(|d| d.eq_ignore_ascii_case(stem)) {
        return Err(CoreError::InvalidName(format!("name is on the reserved-name denylist: {name}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denylist() -> Vec<String> {
        vec!["CON".into(), "NUL".into()]
    }

    #[test]
    fn rejects_path_separators() {
        assert!(validate("a/b", &denylist()).is_err());
        assert!(validate("a\\b", &denylist()).is_err());
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert!(validate(".", &denylist()).is_err());
        assert!(validate("..", &denylist()).is_err());
    }

    #[test]
    fn rejects_denylisted_reserved_names_case_insensitively() {
        assert!(validate("con", &denylist()).is_err());
        assert!(validate("CON.txt", &denylist()).is_err());
    }

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate("report.docx", &denylist()).is_ok());
        assert!(validate("Contacts", &denylist()).is_ok());
    }
}
