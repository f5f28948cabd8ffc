//! Common helper functions for Looplink.

/// Read a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are true; any other value is
/// false. Unset variables yield `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    parse_bool(std::env::var(name).ok().as_deref(), default)
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_bool(Some(value), false), "{value}");
        }
    }

    #[test]
    fn test_parse_bool_falsy() {
        for value in ["0", "false", "no", "off", "", "maybe"] {
            assert!(!parse_bool(Some(value), true), "{value}");
        }
    }

    #[test]
    fn test_parse_bool_unset_uses_default() {
        assert!(parse_bool(None, true));
        assert!(!parse_bool(None, false));
        assert!(env_bool("LOOPLINK_TEST_SURELY_UNSET_FLAG", true));
    }
}
