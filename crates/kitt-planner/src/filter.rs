//! Glob filtering of quant names (`skip_patterns` subtract, then
//! `include_only` intersect).

use kitt_schemas::QuantFilterConfig;
use regex::Regex;

/// Shell-style glob match (`*` any run, `?` one char), anchored to the whole
/// name.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    match Regex::new(&re) {
        Ok(r) => r.is_match(name),
        Err(_) => false,
    }
}

/// Apply the campaign quant filter to a list of quant names, preserving
/// order: first remove anything matching a skip pattern, then (when
/// `include_only` is non-empty) keep only names matching one of them.
pub fn filter_quant_names(names: &[String], filter: &QuantFilterConfig) -> Vec<String> {
    let mut result: Vec<String> = names
        .iter()
        .filter(|n| !filter.skip_patterns.iter().any(|p| glob_match(p, n)))
        .cloned()
        .collect();

    if !filter.include_only.is_empty() {
        result.retain(|n| filter.include_only.iter().any(|p| glob_match(p, n)));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn glob_star_and_question_mark() {
        assert!(glob_match("IQ1_*", "IQ1_S"));
        assert!(glob_match("Q?_K", "Q4_K"));
        assert!(!glob_match("Q?_K", "Q4_K_M"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "axb"));
    }

    #[test]
    fn skip_patterns_subtract() {
        let filter = QuantFilterConfig {
            skip_patterns: vec!["Q2_*".to_string()],
            include_only: vec![],
        };
        let out = filter_quant_names(&names(&["Q2_K", "Q4_K_M", "Q8_0"]), &filter);
        assert_eq!(out, names(&["Q4_K_M", "Q8_0"]));
    }

    #[test]
    fn include_only_intersects_after_skip() {
        let filter = QuantFilterConfig {
            skip_patterns: vec!["IQ*".to_string()],
            include_only: vec!["Q4_*".to_string(), "Q8_*".to_string()],
        };
        let out = filter_quant_names(
            &names(&["IQ4_XS", "Q4_K_M", "Q5_K_M", "Q8_0"]),
            &filter,
        );
        assert_eq!(out, names(&["Q4_K_M", "Q8_0"]));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let filter = QuantFilterConfig::default();
        let all = names(&["Q2_K", "Q8_0"]);
        assert_eq!(filter_quant_names(&all, &filter), all);
    }
}
