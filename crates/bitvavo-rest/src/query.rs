//! Query-string encoding.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

/// Optional endpoint parameters, kept in insertion order.
pub type Options = Map<String, Value>;

/// Characters left unescaped: alphanumerics plus `-_.!~*'()`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Render options as `?k=v&k2=v2`.
///
/// Empty strings and nulls are skipped. Returns an empty string, not a bare
/// `?`, when no parameter remains; the server treats both the same.
pub fn create_postfix(options: &Options) -> String {
    let pairs: Vec<String> = options
        .iter()
        .filter_map(|(key, value)| {
            let raw = match value {
                Value::Null => return None,
                Value::String(s) if s.is_empty() => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(format!("{key}={}", utf8_percent_encode(&raw, COMPONENT)))
        })
        .collect();

    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use percent_encoding::percent_decode_str;
    use serde_json::json;

    fn options(value: Value) -> Options {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_postfix_empty() {
        assert_eq!(create_postfix(&Options::new()), "");
        assert_eq!(create_postfix(&options(json!({"market": ""}))), "");
    }

    #[test]
    fn test_postfix_keeps_order_and_skips_empty() {
        let opts = options(json!({"market": "BTC-EUR", "symbol": "", "limit": 5, "depth": null}));
        assert_eq!(create_postfix(&opts), "?market=BTC-EUR&limit=5");
    }

    #[test]
    fn test_postfix_encodes_like_uri_component() {
        let opts = options(json!({"q": "a b&c=d/e", "keep": "-_.!~*'()"}));
        assert_eq!(create_postfix(&opts), "?q=a%20b%26c%3Dd%2Fe&keep=-_.!~*'()");
    }

    #[test]
    fn test_postfix_decodes_to_same_pairs() {
        let opts = options(json!({
            "market": "BTC-EUR",
            "text": "a&b=c d/e",
            "symbol": "€uro ünicode",
            "limit": 25
        }));

        let postfix = create_postfix(&opts);
        let query = postfix.strip_prefix('?').unwrap();
        assert!(query.is_ascii());

        let decoded: Vec<(String, String)> = query
            .split('&')
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap();
                (
                    key.to_string(),
                    percent_decode_str(value).decode_utf8().unwrap().into_owned(),
                )
            })
            .collect();

        assert_eq!(
            decoded,
            vec![
                ("market".to_string(), "BTC-EUR".to_string()),
                ("text".to_string(), "a&b=c d/e".to_string()),
                ("symbol".to_string(), "€uro ünicode".to_string()),
                ("limit".to_string(), "25".to_string()),
            ]
        );
    }

    #[test]
    fn test_postfix_bool_and_number() {
        let opts = options(json!({"postOnly": true, "start": 1700000000000i64}));
        assert_eq!(create_postfix(&opts), "?postOnly=true&start=1700000000000");
    }
}
