use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use log::warn;

use crate::{now_millis, CacheEntry, NetworkResponse};

/// Case-insensitive header lookup, first match wins
pub(crate) fn header_value<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Parse an RFC 1123 date into epoch milliseconds; 0 when unparseable
pub(crate) fn parse_date_ms(value: &str) -> i64 {
    match httpdate::parse_http_date(value) {
        Ok(time) => match time.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(_) => 0,
        },
        Err(_) => {
            warn!("unparseable HTTP date: {value}");
            0
        }
    }
}

/// Format epoch milliseconds as an RFC 1123 date
pub(crate) fn format_date_ms(epoch_ms: i64) -> String {
    let epoch_ms = epoch_ms.max(0) as u64;
    httpdate::fmt_http_date(
        SystemTime::UNIX_EPOCH + Duration::from_millis(epoch_ms),
    )
}

/// Derive cache metadata for a response from its HTTP headers.
///
/// Recognized headers: `Date`, `Last-Modified`, `ETag`, `Expires`,
/// `Cache-Control`. The `max-age` and `stale-while-revalidate` tokens take
/// precedence over `Expires`; `no-cache` and `no-store` make the response
/// uncacheable (`None`). With no `Date` header the receipt time anchors the
/// expiry arithmetic.
pub fn parse_cache_headers(response: &NetworkResponse) -> Option<CacheEntry> {
    let headers = &response.headers;

    let server_date =
        header_value(headers, "Date").map(parse_date_ms).unwrap_or(0);
    let last_modified =
        header_value(headers, "Last-Modified").map(parse_date_ms).unwrap_or(0);
    let etag = header_value(headers, "ETag").map(str::to_owned);

    let mut max_age: i64 = 0;
    let mut stale_while_revalidate: i64 = 0;
    let mut has_cache_control = false;
    if let Some(cache_control) = header_value(headers, "Cache-Control") {
        has_cache_control = true;
        for token in cache_control.split(',') {
            let token = token.trim();
            if token == "no-cache" || token == "no-store" {
                return None;
            } else if let Some(seconds) = token.strip_prefix("max-age=") {
                max_age = seconds.parse().unwrap_or(0);
            } else if let Some(seconds) =
                token.strip_prefix("stale-while-revalidate=")
            {
                stale_while_revalidate = seconds.parse().unwrap_or(0);
            }
        }
    }

    let reference = if server_date > 0 { server_date } else { now_millis() };
    let (soft_ttl, ttl) = if has_cache_control {
        let soft_ttl = reference + max_age * 1000;
        (soft_ttl, soft_ttl + stale_while_revalidate * 1000)
    } else if let Some(expires) = header_value(headers, "Expires") {
        let expires = parse_date_ms(expires);
        (expires, expires)
    } else {
        (0, 0)
    };

    Some(CacheEntry {
        data: response.data.clone(),
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers: response.headers.clone(),
    })
}
