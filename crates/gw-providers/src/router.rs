//! Pure header-driven backend selection.

use gw_domain::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cla,
    Proxy,
}

const FALSY: [&str; 3] = ["false", "0", "no"];
const TRUTHY: [&str; 3] = ["true", "1", "yes"];

/// `claude_code_header` and `session_id_present` reflect the first value
/// of a possibly-repeated header, already collapsed by the caller.
pub fn select_backend(
    claude_code_header: Option<&str>,
    session_id_present: bool,
) -> Result<Backend, Error> {
    if let Some(value) = claude_code_header {
        let lower = value.to_lowercase();
        if FALSY.contains(&lower.as_str()) {
            return Ok(Backend::Proxy);
        }
        if TRUTHY.contains(&lower.as_str()) {
            return Ok(Backend::Cla);
        }
        return Err(Error::InvalidHeaderValue);
    }

    if session_id_present {
        return Ok(Backend::Cla);
    }

    Ok(Backend::Proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_toggle_selects_proxy_regardless_of_session() {
        assert_eq!(select_backend(Some("false"), true).unwrap(), Backend::Proxy);
        assert_eq!(select_backend(Some("NO"), true).unwrap(), Backend::Proxy);
    }

    #[test]
    fn truthy_toggle_selects_cla() {
        assert_eq!(select_backend(Some("true"), false).unwrap(), Backend::Cla);
        assert_eq!(select_backend(Some("1"), false).unwrap(), Backend::Cla);
    }

    #[test]
    fn unrecognized_toggle_value_is_invalid_header() {
        assert!(select_backend(Some("maybe"), false).is_err());
    }

    #[test]
    fn session_id_without_toggle_selects_cla() {
        assert_eq!(select_backend(None, true).unwrap(), Backend::Cla);
    }

    #[test]
    fn default_with_no_signal_is_proxy() {
        assert_eq!(select_backend(None, false).unwrap(), Backend::Proxy);
    }
}
