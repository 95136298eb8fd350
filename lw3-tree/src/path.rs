//! Node path helpers.

use crate::error::TreeError;

/// Splits an absolute node path into its segments.
///
/// `/` is the root and yields no segments. Every other path must start with
/// `/` and contain no empty segment, so `/A//B` and `/A/` are rejected.
pub fn split_path(path: &str) -> Result<Vec<&str>, TreeError> {
    if path == "/" {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| TreeError::InvalidPath(path.to_string()))?;
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Formats segments as an absolute path.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment.as_ref());
    }
    out
}

/// Appends a child segment to a node path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Checks that `name` can be addressed by the line grammar.
///
/// Names may not be empty and may not contain whitespace or any of the
/// separators `/ . : = ( ) , #`.
pub fn validate_name(name: &str) -> Result<(), TreeError> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '.' | ':' | '=' | '(' | ')' | ',' | '#'));
    if bad {
        Err(TreeError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert!(split_path("/").unwrap().is_empty());
        assert_eq!(split_path("/A").unwrap(), vec!["A"]);
        assert_eq!(
            split_path("/PATH/TO/MY/NODE").unwrap(),
            vec!["PATH", "TO", "MY", "NODE"]
        );
        assert!(split_path("").is_err());
        assert!(split_path("A/B").is_err());
        assert!(split_path("/A//B").is_err());
        assert!(split_path("/A/").is_err());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path::<&str>(&[]), "/");
        assert_eq!(join_path(&["A", "B"]), "/A/B");
        assert_eq!(child_path("/", "A"), "/A");
        assert_eq!(child_path("/A", "B"), "/A/B");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("SignalPresent").is_ok());
        assert!(validate_name("V1_2-x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a.b").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("m()").is_err());
    }
}
