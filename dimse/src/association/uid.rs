//! Private utility module for working with UIDs

/// Remove the trailing null padding (and stray spaces)
/// which some implementations leave in UIDs.
pub(crate) fn trim_uid(uid: String) -> String {
    let trimmed = uid.trim_end_matches(|c: char| c == '\0' || c == ' ');
    if trimmed.len() == uid.len() {
        uid
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::trim_uid;

    #[test]
    fn test_trim_uid() {
        assert_eq!(trim_uid("1.2.3.4".to_string()), "1.2.3.4");
        assert_eq!(trim_uid("1.2.3.4\0".to_string()), "1.2.3.4");
        assert_eq!(trim_uid("1.2.3.45 ".to_string()), "1.2.3.45");
    }
}
