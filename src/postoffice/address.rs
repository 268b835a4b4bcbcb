//! Hierarchical address matching.
//!
//! Addresses are `.`-separated words. In a pattern `*` matches exactly one
//! word and `#` matches zero or more words.

pub const DELIMITER: char = '.';
pub const SINGLE_WORD: &str = "*";
pub const ANY_WORDS: &str = "#";

pub fn is_wildcard(pattern: &str) -> bool {
    pattern
        .split(DELIMITER)
        .any(|word| word == SINGLE_WORD || word == ANY_WORDS)
}

/// True when `address` matches `pattern`. A pattern without wildcards only
/// matches itself.
pub fn matches(pattern: &str, address: &str) -> bool {
    if pattern == address {
        return true;
    }
    let pattern: Vec<&str> = pattern.split(DELIMITER).collect();
    let address: Vec<&str> = address.split(DELIMITER).collect();
    match_words(&pattern, &address)
}

fn match_words(pattern: &[&str], address: &[&str]) -> bool {
    match pattern.split_first() {
        None => address.is_empty(),
        Some((&ANY_WORDS, rest)) => (0..=address.len()).any(|skip| match_words(rest, &address[skip..])),
        Some((&word, rest)) => match address.split_first() {
            Some((&first, tail)) if word == SINGLE_WORD || word == first => match_words(rest, tail),
            _ => false,
        },
    }
}

/// Ordering key for picking the most specific pattern: literal patterns
/// first, then more literal words, then `*` over `#`.
pub fn specificity(pattern: &str) -> (bool, usize, usize, usize) {
    let mut literal = 0;
    let mut single = 0;
    let mut any = 0;
    for word in pattern.split(DELIMITER) {
        match word {
            SINGLE_WORD => single += 1,
            ANY_WORDS => any += 1,
            _ => literal += 1,
        }
    }
    (any == 0 && single == 0, literal, single, usize::MAX - any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_word_wildcard() {
        assert!(matches("orders.*", "orders.eu"));
        assert!(!matches("orders.*", "orders"));
        assert!(!matches("orders.*", "orders.eu.paris"));
        assert!(matches("*.eu", "orders.eu"));
    }

    #[test]
    fn multi_word_wildcard() {
        assert!(matches("orders.#", "orders"));
        assert!(matches("orders.#", "orders.eu.paris"));
        assert!(matches("#", "anything.at.all"));
        assert!(matches("orders.#.paris", "orders.paris"));
        assert!(matches("orders.#.paris", "orders.eu.fr.paris"));
        assert!(!matches("orders.#.paris", "orders.eu.lyon"));
    }

    #[test]
    fn literal_patterns_match_only_themselves() {
        assert!(matches("testaddress", "testaddress"));
        assert!(!matches("testaddress", "testaddress2"));
        assert!(!is_wildcard("a.b"));
        assert!(is_wildcard("a.*"));
    }

    #[test]
    fn exact_beats_wildcards() {
        let mut patterns = vec!["#", "orders.#", "orders.*", "orders.eu"];
        patterns.sort_by_key(|p| std::cmp::Reverse(specificity(p)));
        assert_eq!(patterns, vec!["orders.eu", "orders.*", "orders.#", "#"]);
    }
}
