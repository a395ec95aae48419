//! Input validation performed before any side effect.

use crate::error::{Error, Result};

pub const MAX_BUILD_NAME_LEN: usize = 64;
pub const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Build names become file names, dataset names and container names.
pub fn validate_build_name(name: &str) -> Result<()> {
    validate_identifier("build name", name, MAX_BUILD_NAME_LEN)
}

/// Operation names become marker file names.
pub fn validate_operation_name(name: &str) -> Result<()> {
    validate_identifier("operation name", name, MAX_BUILD_NAME_LEN)
}

fn validate_identifier(field: &'static str, name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation(field, name, "must not be empty"));
    }
    if name.len() > max_len {
        return Err(Error::validation(
            field,
            name,
            format!("must be at most {} characters", max_len),
        ));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(Error::validation(
            field,
            name,
            "must not start with '.' or '-'",
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(Error::validation(
            field,
            name,
            format!(
                "contains '{}'; only letters, digits, '.', '-' and '_' are allowed",
                bad
            ),
        ));
    }
    Ok(())
}

/// RFC 1123 hostname: dot-separated labels of letters, digits and hyphens.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return Err(Error::validation(
            "hostname",
            hostname,
            format!("must be 1-{} characters", MAX_HOSTNAME_LEN),
        ));
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(Error::validation(
                "hostname",
                hostname,
                format!("each label must be 1-{} characters", MAX_LABEL_LEN),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::validation(
                "hostname",
                hostname,
                "labels must not start or end with '-'",
            ));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::validation(
                "hostname",
                hostname,
                "labels may contain only letters, digits and '-'",
            ));
        }
    }
    Ok(())
}

/// Debian package names, optionally pinned with `=version`.
pub fn validate_package_name(package: &str) -> Result<()> {
    let (name, version) = match package.split_once('=') {
        Some((name, version)) => (name, Some(version)),
        None => (package, None),
    };
    let name_ok = name.len() >= 2
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | ':'));
    if !name_ok {
        return Err(Error::validation(
            "package",
            package,
            "not a valid Debian package name",
        ));
    }
    if let Some(version) = version {
        let version_ok = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | ':' | '~'));
        if !version_ok {
            return Err(Error::validation(
                "package",
                package,
                "not a valid Debian version",
            ));
        }
    }
    Ok(())
}

/// Split a comma-delimited package list, dropping empty items.
pub fn parse_package_list(list: &str) -> Result<Vec<String>> {
    let mut packages = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        validate_package_name(item)?;
        packages.push(item.to_string());
    }
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_names() {
        assert!(validate_build_name("demo").is_ok());
        assert!(validate_build_name("noble-base_2.1").is_ok());
        assert!(validate_build_name("").is_err());
        assert!(validate_build_name("../etc").is_err());
        assert!(validate_build_name("a/b").is_err());
        assert!(validate_build_name("has space").is_err());
        assert!(validate_build_name("-flag").is_err());
        assert!(validate_build_name(&"x".repeat(MAX_BUILD_NAME_LEN)).is_ok());
        assert!(validate_build_name(&"x".repeat(MAX_BUILD_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_hostnames() {
        assert!(validate_hostname("demo").is_ok());
        assert!(validate_hostname("build-01.example.com").is_ok());
        assert!(validate_hostname("under_score").is_err());
        assert!(validate_hostname("-lead").is_err());
        assert!(validate_hostname("a..b").is_err());
        assert!(validate_hostname(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_package_list() {
        assert_eq!(
            parse_package_list("openssh-server, vim ,,libc6=2.39-0ubuntu8").unwrap(),
            vec!["openssh-server", "vim", "libc6=2.39-0ubuntu8"]
        );
        assert!(parse_package_list("").unwrap().is_empty());
        assert!(parse_package_list("vim; rm -rf /").is_err());
        assert!(parse_package_list("Vim").is_err());
    }
}
