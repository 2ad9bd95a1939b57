//! Cookie capture from responses and cookie header rendering for requests.

use std::collections::{BTreeMap, BTreeSet};

use cookie::Cookie;
use cookie::time::OffsetDateTime;
use reqwest::header::{HeaderMap, SET_COOKIE};

/// Cookie changes carried by one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedCookies {
    /// Cookies to store, name → value.
    pub set: BTreeMap<String, String>,
    /// Cookies the server expired (`Max-Age<=0` or an `Expires` in the past).
    pub removed: BTreeSet<String>,
}

impl CapturedCookies {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Applies one parsed cookie. A later header for the same name wins.
    fn apply(&mut self, cookie: &Cookie<'_>, now: OffsetDateTime) {
        let name = cookie.name().to_string();
        if is_expired(cookie, now) {
            self.set.remove(&name);
            self.removed.insert(name);
        } else {
            self.removed.remove(&name);
            self.set.insert(name, cookie.value().to_string());
        }
    }
}

/// Parses one `Set-Cookie` header value.
///
/// Returns `None` for headers the `cookie` crate rejects or with a blank name.
#[must_use]
pub fn parse_set_cookie(header: &str) -> Option<Cookie<'static>> {
    let cookie = Cookie::parse(header.to_string()).ok()?;
    if cookie.name().trim().is_empty() {
        return None;
    }
    Some(cookie)
}

/// `Max-Age` takes precedence over `Expires`.
fn is_expired(cookie: &Cookie<'_>, now: OffsetDateTime) -> bool {
    match cookie.max_age() {
        Some(max_age) => max_age.is_zero() || max_age.is_negative(),
        None => cookie.expires_datetime().is_some_and(|expires| expires <= now),
    }
}

/// Collects every `Set-Cookie` header into stored and expired cookies.
#[must_use]
pub fn capture_cookies(headers: &HeaderMap) -> CapturedCookies {
    let now = OffsetDateTime::now_utc();
    let mut captured = CapturedCookies::default();
    for cookie in headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(parse_set_cookie)
    {
        captured.apply(&cookie, now);
    }
    captured
}

/// Renders cookies as a `Cookie` request header value (`a=1; b=2`).
///
/// Returns `None` for an empty map.
#[must_use]
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    Some(
        cookies
            .iter()
            .map(|(name, value)| Cookie::new(name.as_str(), value.as_str()).stripped().to_string())
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn test_parse_set_cookie_strips_attributes() {
        let cookie = parse_set_cookie("JSESSIONID=abc123; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name(), "JSESSIONID");
        assert_eq!(cookie.value(), "abc123");
    }

    #[test]
    fn test_parse_set_cookie_keeps_equals_in_value() {
        let cookie = parse_set_cookie("token=a=b==; Secure").unwrap();
        assert_eq!(cookie.value(), "a=b==");
    }

    #[test]
    fn test_parse_set_cookie_rejects_malformed() {
        assert!(parse_set_cookie("HttpOnly").is_none());
        assert!(parse_set_cookie("=orphan").is_none());
        assert!(parse_set_cookie("").is_none());
    }

    #[test]
    fn test_capture_cookies_collects_all_headers() {
        let cookies = capture_cookies(&headers(&["a=1; Path=/", "b=2", "a=3"]));
        assert_eq!(cookies.set.len(), 2);
        assert_eq!(cookies.set["a"], "3");
        assert_eq!(cookies.set["b"], "2");
        assert!(cookies.removed.is_empty());
    }

    #[test]
    fn test_capture_cookies_treats_expired_as_removed() {
        let cookies = capture_cookies(&headers(&[
            "sid=; Max-Age=0",
            "tok=old; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            "neg=x; Max-Age=-1",
            "keep=1; Expires=Fri, 01 Jan 2100 00:00:00 GMT",
        ]));
        assert_eq!(cookies.set, BTreeMap::from([("keep".to_string(), "1".to_string())]));
        assert_eq!(
            cookies.removed.iter().map(String::as_str).collect::<Vec<_>>(),
            ["neg", "sid", "tok"]
        );
    }

    #[test]
    fn test_max_age_wins_over_past_expires() {
        let cookies = capture_cookies(&headers(&[
            "sid=live; Max-Age=600; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
        ]));
        assert_eq!(cookies.set["sid"], "live");
        assert!(cookies.removed.is_empty());
    }

    #[test]
    fn test_later_header_overrides_removal() {
        let cookies = capture_cookies(&headers(&["sid=; Max-Age=0", "sid=new"]));
        assert_eq!(cookies.set["sid"], "new");
        assert!(cookies.removed.is_empty());
    }

    #[test]
    fn test_cookie_header_rendering() {
        let cookies = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(cookie_header(&cookies).unwrap(), "a=1; b=2");
        assert!(cookie_header(&BTreeMap::new()).is_none());
    }
}
