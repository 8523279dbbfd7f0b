//! Best-effort recovery of a value from truncated JSON text
//!
//! Used while structured output is still streaming: the input is the
//! concatenation-so-far and is frequently syntactically incomplete. A
//! strict parse is tried first, so complete documents never pay for repair.
//! On failure, a single linear scan drives one repair pass: close an open
//! string literal, drop an incomplete object member (a dangling key or a
//! `key:` with no value), strip a trailing comma, and close open brackets
//! in LIFO order. Bracket characters inside string literals are ignored by
//! the scan. If the repaired text still fails to parse, the result is
//! `None`: a non-fatal, expected outcome mid-stream, not an error.

use serde_json::Value;

#[derive(Debug)]
enum Ctx {
    Array,
    Object {
        expecting_key: bool,
        key_start: Option<usize>,
    },
}

/// Parse possibly-truncated JSON, repairing the tail if needed.
///
/// Never panics and never errors; `None` simply means not enough of the
/// document has arrived yet. For growing prefixes of one document the
/// recovered values only ever gain fields and elements, never lose them.
pub fn parse_partial(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    serde_json::from_str(&repair(trimmed)).ok()
}

fn repair(text: &str) -> String {
    let mut stack: Vec<Ctx> = Vec::new();
    let mut in_string = false;
    let mut is_key = false;
    let mut escape = false;
    let mut string_start = 0usize;

    for (i, c) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_start = i;
                is_key = matches!(
                    stack.last(),
                    Some(Ctx::Object {
                        expecting_key: true,
                        ..
                    })
                );
                if is_key {
                    if let Some(Ctx::Object { key_start, .. }) = stack.last_mut() {
                        *key_start = Some(i);
                    }
                }
            }
            '{' => stack.push(Ctx::Object {
                expecting_key: true,
                key_start: None,
            }),
            '[' => stack.push(Ctx::Array),
            '}' | ']' => {
                stack.pop();
            }
            ':' => {
                if let Some(Ctx::Object { expecting_key, .. }) = stack.last_mut() {
                    *expecting_key = false;
                }
            }
            ',' => {
                if let Some(Ctx::Object {
                    expecting_key,
                    key_start,
                }) = stack.last_mut()
                {
                    *expecting_key = true;
                    *key_start = None;
                }
            }
            _ => {}
        }
    }

    let mut repaired = text.to_string();

    if in_string {
        if is_key {
            // An unterminated key can never become a member; drop it.
            repaired.truncate(string_start);
            strip_trailing_comma(&mut repaired);
        } else {
            if escape {
                // A lone trailing backslash would swallow the closing quote.
                repaired.pop();
            }
            repaired.push('"');
        }
    } else {
        let tail = repaired.trim_end();
        let incomplete_member = match stack.last() {
            Some(Ctx::Object {
                expecting_key,
                key_start: Some(key_start),
            }) => {
                // Either `"key":` with no value yet, or a complete `"key"`
                // still waiting for its colon.
                if tail.ends_with(':') || (*expecting_key && tail.ends_with('"')) {
                    Some(*key_start)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(key_start) = incomplete_member {
            repaired.truncate(key_start);
            strip_trailing_comma(&mut repaired);
        } else if tail.ends_with(',') {
            repaired.truncate(tail.len() - 1);
        }
    }

    for ctx in stack.iter().rev() {
        repaired.push(match ctx {
            Ctx::Array => ']',
            Ctx::Object { .. } => '}',
        });
    }
    repaired
}

fn strip_trailing_comma(text: &mut String) {
    text.truncate(text.trim_end().len());
    if text.ends_with(',') {
        text.pop();
        text.truncate(text.trim_end().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_document_takes_the_strict_path() {
        assert_eq!(parse_partial("{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert_eq!(parse_partial("[1, 2, 3]").unwrap(), json!([1, 2, 3]));
        assert_eq!(parse_partial("\"hello\"").unwrap(), json!("hello"));
    }

    #[test]
    fn closes_open_string_and_brackets() {
        assert_eq!(
            parse_partial("{\"a\": [1, 2, \"x").unwrap(),
            json!({"a": [1, 2, "x"]})
        );
    }

    #[test]
    fn closes_nested_structures_in_lifo_order() {
        assert_eq!(
            parse_partial("{\"a\": {\"b\": [1, {\"c\": \"x").unwrap(),
            json!({"a": {"b": [1, {"c": "x"}]}})
        );
    }

    #[test]
    fn strips_trailing_comma() {
        assert_eq!(parse_partial("[1, 2,").unwrap(), json!([1, 2]));
        assert_eq!(parse_partial("{\"a\": 1,").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn drops_dangling_key_and_colon() {
        assert_eq!(parse_partial("{\"a\":").unwrap(), json!({}));
        assert_eq!(parse_partial("{\"a\": 1, \"b\":").unwrap(), json!({"a": 1}));
        assert_eq!(parse_partial("{\"a\": 1, \"b\"").unwrap(), json!({"a": 1}));
        assert_eq!(parse_partial("{\"a\": 1, \"b").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn escaped_quotes_do_not_close_the_string() {
        assert_eq!(
            parse_partial("{\"a\": \"say \\\"hi").unwrap(),
            json!({"a": "say \"hi"})
        );
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        assert_eq!(
            parse_partial("{\"a\": \"[{\", \"b\": [1").unwrap(),
            json!({"a": "[{", "b": [1]})
        );
    }

    #[test]
    fn trailing_backslash_is_dropped_before_closing() {
        assert_eq!(parse_partial("\"abc\\").unwrap(), json!("abc"));
    }

    #[test]
    fn unrecoverable_tails_return_none() {
        assert!(parse_partial("").is_none());
        assert!(parse_partial("   ").is_none());
        assert!(parse_partial("{\"a\": tru").is_none());
        assert!(parse_partial("{\"a\": 1e").is_none());
    }

    #[test]
    fn values_grow_monotonically_over_prefixes() {
        let doc = "{\"title\": \"streaming\", \"items\": [1, 2, 3], \"done\": true}";
        let mut last_title_len = 0usize;
        let mut last_item_count = 0usize;
        for end in 1..=doc.len() {
            if !doc.is_char_boundary(end) {
                continue;
            }
            let Some(value) = parse_partial(&doc[..end]) else {
                continue;
            };
            let title_len = value
                .get("title")
                .and_then(Value::as_str)
                .map_or(0, str::len);
            let item_count = value
                .get("items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            assert!(title_len >= last_title_len, "title shrank at {end}");
            assert!(item_count >= last_item_count, "items shrank at {end}");
            last_title_len = title_len;
            last_item_count = item_count;
        }
        assert_eq!(last_item_count, 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_panics_on_arbitrary_input(input in ".{0,200}") {
                let _ = parse_partial(&input);
            }

            #[test]
            fn every_prefix_of_a_valid_document_is_safe(
                value in proptest::collection::btree_map("[a-z]{1,8}", 0i64..1000, 0..6)
            ) {
                let doc = serde_json::to_string(&value).unwrap();
                for end in 0..=doc.len() {
                    if doc.is_char_boundary(end) {
                        let _ = parse_partial(&doc[..end]);
                    }
                }
                // The complete document always round-trips exactly.
                let parsed = parse_partial(&doc).unwrap();
                prop_assert_eq!(parsed, serde_json::to_value(&value).unwrap());
            }
        }
    }
}
