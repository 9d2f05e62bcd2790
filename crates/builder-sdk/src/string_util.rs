/// Small string helpers used when reading settings and environment values.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// True values: `"1"`, `"true"`, `"yes"`, `"on"` (case-insensitive).
    /// False values: `"0"`, `"false"`, `"no"`, `"off"` (case-insensitive).
    /// Returns `None` for anything else, including the empty string.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Returns `None` for empty or whitespace-only input, otherwise the trimmed value.
    pub fn non_empty(value: &str) -> Option<&str> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_bool_values() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool(" yes "), Some(true));
        assert_eq!(StringUtil::convert_to_bool("0"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("Off"), Some(false));
        assert_eq!(StringUtil::convert_to_bool(""), None);
        assert_eq!(StringUtil::convert_to_bool("maybe"), None);
    }

    #[test]
    fn non_empty_trims() {
        assert_eq!(StringUtil::non_empty("  a  "), Some("a"));
        assert_eq!(StringUtil::non_empty("   "), None);
    }
}
