use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};

/// Length of the gateway nonce (`nonce_str`).
pub const NONCE_LENGTH: usize = 32;

const USER_PREFIX_LENGTH: usize = 8;
const ORDER_SUFFIX_LENGTH: usize = 6;

/// Random alphanumeric nonce for one outbound gateway call.
pub fn generate_nonce() -> String {
    random_alphanumeric(NONCE_LENGTH)
}

/// Build a merchant order id from the creation time and the user id.
///
/// Format: `BK` + `yyyyMMddHHmmssSSS` + first 8 alphanumerics of the user id
/// + 6 random alphanumerics. The random tail keeps two orders created by the
/// same user in the same millisecond apart; the store's unique index catches
/// anything that still collides.
pub fn generate_merchant_order_id(user_id: &str, now: DateTime<Utc>) -> String {
    let user_prefix: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(USER_PREFIX_LENGTH)
        .collect();

    format!(
        "BK{}{}{}",
        now.format("%Y%m%d%H%M%S%3f"),
        user_prefix,
        random_alphanumeric(ORDER_SUFFIX_LENGTH)
    )
}

/// Unix seconds as the gateway expects them (`timestamp` field).
pub fn unix_timestamp(now: DateTime<Utc>) -> String {
    now.timestamp().to_string()
}

/// Parse a gateway amount such as `"13000"` or `"13000.00"` into whole kyats.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i64)
}

/// Parse a gateway timestamp given in epoch seconds or milliseconds.
pub fn parse_epoch_seconds(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().and_then(normalize_epoch_seconds)
}

/// Values too large to be seconds are treated as milliseconds.
pub fn normalize_epoch_seconds(raw: i64) -> Option<i64> {
    if raw <= 0 {
        None
    } else if raw > 100_000_000_000 {
        Some(raw / 1000)
    } else {
        Some(raw)
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn nonce_is_32_alphanumerics() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LENGTH);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn merchant_order_id_embeds_time_and_truncated_user() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let id = generate_merchant_order_id("a1b2-c3d4-e5f6-0000", now);
        assert!(id.starts_with("BK20240102030405000a1b2c3d4"), "{}", id);
        assert_eq!(id.len(), 2 + 17 + 8 + 6);
    }

    #[test]
    fn merchant_order_ids_do_not_collide_within_a_millisecond() {
        let now = Utc::now();
        let ids: HashSet<String> = (0..1000)
            .map(|_| generate_merchant_order_id("user-1", now))
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn parses_integer_and_decimal_amounts() {
        assert_eq!(parse_amount("13000"), Some(13000));
        assert_eq!(parse_amount("13000.00"), Some(13000));
        assert_eq!(parse_amount(" 42 "), Some(42));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn epoch_accepts_seconds_and_millis() {
        assert_eq!(parse_epoch_seconds("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_epoch_seconds("1700000000000"), Some(1_700_000_000));
        assert_eq!(parse_epoch_seconds("0"), None);
        assert_eq!(parse_epoch_seconds(""), None);
    }
}
