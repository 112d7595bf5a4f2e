//! Single-pass `#{var}` template substitution, shared by the SMS webhook
//! forwarder and the IPv6 periodic address reporter.
//!
//! Substitution is a single left-to-right pass over the template rather
//! than "replace repeatedly until no more occurrences remain": a value
//! that itself contains a `#{...}`-shaped substring must not be
//! re-expanded, which guarantees termination regardless of value content.

use std::collections::HashMap;

/// Substitute every `#{name}` placeholder in `template` with the matching
/// entry from `vars`, in one left-to-right pass. Unknown placeholders are
/// left untouched.
#[must_use]
pub fn substitute(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("#{") {
        out.push_str(&rest[..start]);
        let after_marker = &rest[start + 2..];
        match after_marker.find('}') {
            Some(close) => {
                let name = &after_marker[..close];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                } else {
                    out.push_str(&rest[start..start + 2 + close + 1]);
                }
                rest = &after_marker[close + 1..];
            }
            None => {
                // Unterminated "#{": emit the rest verbatim and stop.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_variables() {
        let mut vars = HashMap::new();
        vars.insert("sender", "+100");
        vars.insert("content", "hello");
        let result = substitute("#{sender} #{content}", &vars);
        assert_eq!(result, "+100 hello");
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let vars = HashMap::new();
        let result = substitute("#{mystery}", &vars);
        assert_eq!(result, "#{mystery}");
    }

    #[test]
    fn does_not_re_expand_a_value_containing_placeholder_syntax() {
        let mut vars = HashMap::new();
        vars.insert("content", "#{sender}");
        vars.insert("sender", "+100");
        let result = substitute("#{content}", &vars);
        assert_eq!(result, "#{sender}");
    }

    #[test]
    fn terminates_and_contains_value_verbatim_for_any_value() {
        for value in ["", "#{x}", "####{{}}", "normal text"] {
            let mut vars = HashMap::new();
            vars.insert("v", value);
            let result = substitute("prefix #{v} suffix", &vars);
            assert!(result.contains(value));
            assert_eq!(result, format!("prefix {value} suffix"));
        }
    }

    proptest::proptest! {
        #[test]
        fn substitution_contains_the_value_verbatim_for_any_string(value in ".*") {
            let mut vars = HashMap::new();
            vars.insert("v", value.as_str());
            let result = substitute("prefix #{v} suffix", &vars);
            proptest::prop_assert_eq!(&result, &format!("prefix {value} suffix"));
        }

        #[test]
        fn substitution_never_loops_on_lookalike_markers(value in "(#\\{[a-z]*\\}|[a-z ]){0,40}") {
            let mut vars = HashMap::new();
            vars.insert("v", value.as_str());
            let result = substitute("#{v}", &vars);
            proptest::prop_assert_eq!(result, value);
        }
    }
}
