// 🧹 Normalizer - Canonical forms for names, addresses and boroughs
//
// Sources disagree on case, punctuation, abbreviations and unit suffixes:
//   "123 MAIN ST #4B", "123 Main Street", "123 main st." → "123 main street"
// Every function here is pure and idempotent.

// ============================================================================
// TABLES
// ============================================================================

/// Street-suffix and directional abbreviations → full word
const SUFFIXES: &[(&str, &str)] = &[
    ("st", "street"),
    ("str", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("blvd", "boulevard"),
    ("bvd", "boulevard"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("pl", "place"),
    ("rd", "road"),
    ("ct", "court"),
    ("cir", "circle"),
    ("ter", "terrace"),
    ("terr", "terrace"),
    ("pkwy", "parkway"),
    ("pky", "parkway"),
    ("hwy", "highway"),
    ("hgwy", "highway"),
    ("sq", "square"),
    ("tpke", "turnpike"),
    ("expy", "expressway"),
    ("expwy", "expressway"),
    ("e", "east"),
    ("w", "west"),
    ("n", "north"),
    ("s", "south"),
];

/// Designators that introduce a unit/suite/floor value
const UNIT_KEYWORDS: &[&str] = &["ste", "suite", "apt", "unit", "fl", "floor", "rm", "room"];

const PUNCTUATION: &[char] = &['.', ',', '#', '-', '\''];

/// Borough aliases → canonical borough
const BOROUGH_ALIASES: &[(&str, &str)] = &[
    ("manhattan", "manhattan"),
    ("new york", "manhattan"),
    ("ny", "manhattan"),
    ("brooklyn", "brooklyn"),
    ("bklyn", "brooklyn"),
    ("kings", "brooklyn"),
    ("queens", "queens"),
    ("bronx", "bronx"),
    ("the bronx", "bronx"),
    ("staten island", "staten island"),
    ("richmond", "staten island"),
];

/// The five canonical borough names
pub const BOROUGHS: [&str; 5] = ["manhattan", "brooklyn", "queens", "bronx", "staten island"];

// ============================================================================
// TEXT
// ============================================================================

/// Lowercase, trim, collapse whitespace runs
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// ADDRESS
// ============================================================================

/// Normalize an address for equality matching.
///
/// "81 HUDSON ST AKA 1 HARRISON ST" → "81 hudson street"
/// "100 BROADWAY STE 200"           → "100 broadway"
/// "30-12 20TH AVE"                 → "30 12 20 avenue"
pub fn normalize_address(s: &str) -> String {
    let text = normalize_text(s);

    // Secondary "aka" address: keep only the primary
    let primary = strip_aka(&text);

    let cleaned: String = primary
        .chars()
        .map(|c| if PUNCTUATION.contains(&c) { ' ' } else { c })
        .collect();

    let mut tokens: Vec<String> = cleaned
        .split_whitespace()
        .map(strip_ordinal)
        .collect();

    strip_units(&mut tokens);
    expand_suffixes(&tokens)
}

/// Cut at the first standalone "aka", including one glued to punctuation
/// like "(aka", and drop the separators left in front of it
fn strip_aka(text: &str) -> &str {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    for (pos, _) in text.match_indices("aka") {
        let before_ok = !text[..pos].chars().next_back().is_some_and(is_word);
        let after_ok = !text[pos + 3..].chars().next().is_some_and(is_word);
        if before_ok && after_ok {
            return text[..pos].trim_end_matches(|c: char| !c.is_alphanumeric());
        }
    }
    text
}

/// "86th" → "86", "3rd" → "3"; anything else unchanged
fn strip_ordinal(token: &str) -> String {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(digits) = token.strip_suffix(suffix) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return digits.to_string();
            }
        }
    }
    token.to_string()
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// digits, one letter, digits: "1a", "b2", "e"
fn is_bare_unit(token: &str) -> bool {
    let letters = token.chars().filter(|c| c.is_ascii_alphabetic()).count();
    letters == 1 && token.chars().all(|c| c.is_ascii_alphanumeric())
}

/// "ste200", "fl2": keyword glued to a numeric value
fn is_glued_unit(token: &str) -> bool {
    UNIT_KEYWORDS.iter().any(|k| {
        token
            .strip_prefix(k)
            .map(|rest| is_numeric(rest))
            .unwrap_or(false)
    })
}

/// Drop trailing unit designators until none remain.
///
/// A leading pair of numbers (block-lot "30-12", or a range "77 79") is
/// never eaten, and at least one token always survives.
fn strip_units(tokens: &mut Vec<String>) {
    let protected = if tokens.len() >= 2 && is_numeric(&tokens[0]) && is_numeric(&tokens[1]) {
        2
    } else {
        1
    };

    loop {
        let n = tokens.len();
        if n <= protected {
            return;
        }

        let last = tokens[n - 1].as_str();
        if UNIT_KEYWORDS.contains(&last) || is_glued_unit(last) || is_bare_unit(last) || is_numeric(last) {
            tokens.pop();
            continue;
        }

        // keyword followed by its value: "ste 200", "apt 4b"
        if n - 1 > protected && UNIT_KEYWORDS.contains(&tokens[n - 2].as_str()) {
            tokens.truncate(n - 2);
            continue;
        }

        return;
    }
}

fn suffix_word(token: &str) -> Option<&'static str> {
    SUFFIXES
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| *full)
}

fn is_suffix_word(token: &str) -> bool {
    let full = suffix_word(token).unwrap_or(token);
    SUFFIXES.iter().any(|(_, f)| *f == full)
}

fn expand_suffixes(tokens: &[String]) -> String {
    let mut out = Vec::with_capacity(tokens.len());

    for (i, token) in tokens.iter().enumerate() {
        let word = match token.as_str() {
            // "St Marks Pl" and "Saint Marks Pl" collapse to "st marks place";
            // a trailing "st" (or one before a suffix/directional) is a street
            "st" | "saint" => {
                let saint = tokens
                    .get(i + 1)
                    .map(|next| !is_suffix_word(next))
                    .unwrap_or(false);
                if saint { "st" } else { "street" }
            }
            other => suffix_word(other).unwrap_or(other),
        };
        out.push(word);
    }

    out.join(" ")
}

// ============================================================================
// BOROUGH
// ============================================================================

/// Map borough aliases to the canonical name; unknown input passes through
pub fn normalize_borough(s: &str) -> String {
    let text = normalize_text(s);
    BOROUGH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == text)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(text)
}

// ============================================================================
// NAMES
// ============================================================================

/// Fuzzy score between two business names in [0, 1].
///
/// 1.0 when identical, 0.85 when one contains the other, otherwise
/// 2·LCS / (|a| + |b|) over characters.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();

    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.85;
    }

    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let lcs = longest_common_subsequence(&a, &b);

    (2 * lcs) as f64 / (a.len() + b.len()) as f64
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ============================================================================
// VENUE KEY
// ============================================================================

/// Stable ledger key: lowercase-trimmed `name|address|borough`
pub fn venue_key(name: &str, address: &str, borough: &str) -> String {
    format!(
        "{}|{}|{}",
        name.trim().to_lowercase(),
        address.trim().to_lowercase(),
        borough.trim().to_lowercase()
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_collapses_whitespace() {
        assert_eq!(normalize_text("  Joe's   PIZZA \t"), "joe's pizza");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_suffix_expansion() {
        assert_eq!(normalize_address("123 Main St"), "123 main street");
        assert_eq!(normalize_address("123 MAIN STREET"), "123 main street");
        assert_eq!(normalize_address("55 W 86th St."), "55 west 86 street");
        assert_eq!(normalize_address("1 Fifth Ave"), "1 fifth avenue");
    }

    #[test]
    fn test_aka_suffix_dropped() {
        assert_eq!(
            normalize_address("81 HUDSON ST AKA 1 HARRISON ST"),
            "81 hudson street"
        );
        assert_eq!(
            normalize_address("81 HUDSON ST (AKA 1 HARRISON ST)"),
            "81 hudson street"
        );
        assert_eq!(normalize_address("81 Hudson St,aka 1 Harrison"), "81 hudson street");
        assert_eq!(normalize_address("12 Bakah Ave"), "12 bakah avenue");
    }

    #[test]
    fn test_unit_designators_stripped() {
        assert_eq!(normalize_address("100 BROADWAY STE 200"), "100 broadway");
        assert_eq!(normalize_address("25 N MOORE ST 1A"), "25 north moore street");
        assert_eq!(normalize_address("10 Main St #4"), "10 main street");
        assert_eq!(normalize_address("10 Main St Fl2"), "10 main street");
        assert_eq!(normalize_address("1 Flatbush Ave"), "1 flatbush avenue");
    }

    #[test]
    fn test_block_lot_survives_unit_stripping() {
        assert_eq!(normalize_address("30-12 20TH AVE"), "30 12 20 avenue");
        assert_eq!(normalize_address("64-18"), "64 18");
    }

    #[test]
    fn test_saint_collapses() {
        assert_eq!(normalize_address("2 Saint Marks Pl"), "2 st marks place");
        assert_eq!(normalize_address("2 St Marks Pl"), "2 st marks place");
        assert_eq!(normalize_address("2 St. Marks Place"), "2 st marks place");
    }

    #[test]
    fn test_address_idempotent() {
        let samples = [
            "123 Main St",
            "81 HUDSON ST AKA 1 HARRISON ST",
            "100 BROADWAY STE 200",
            "30-12 20TH AVE",
            "2 Saint Marks Pl",
            "77 79 HUDSON ST",
            "12 Avenue B 3",
            "5 E 3rd St Apt 4",
            "64-18",
            "",
        ];
        for s in samples {
            let once = normalize_address(s);
            assert_eq!(normalize_address(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_borough_aliases() {
        assert_eq!(normalize_borough("BKLYN"), "brooklyn");
        assert_eq!(normalize_borough("Kings"), "brooklyn");
        assert_eq!(normalize_borough("NY"), "manhattan");
        assert_eq!(normalize_borough("The Bronx"), "bronx");
        assert_eq!(normalize_borough("Richmond"), "staten island");
        assert_eq!(normalize_borough("  Jersey City "), "jersey city");

        for s in ["bklyn", "the bronx", "Staten  Island", "nowhere"] {
            let once = normalize_borough(s);
            assert_eq!(normalize_borough(&once), once);
        }
    }

    #[test]
    fn test_name_similarity_rules() {
        assert_eq!(name_similarity("Joe's Pizza", "JOE'S PIZZA"), 1.0);
        assert_eq!(name_similarity("Joe's Pizza", "Joe's Pizza Inc"), 0.85);
        assert_eq!(name_similarity("", "anything"), 0.0);

        let s = name_similarity("Joes Pizza", "Joe's Pizzeria");
        assert!(s > 0.6 && s < 0.85, "got {}", s);

        let d = name_similarity("Tea House", "Burger Joint");
        assert!(d < 0.35, "got {}", d);
    }

    #[test]
    fn test_venue_key_format() {
        assert_eq!(
            venue_key(" Joe's Pizza ", "7 CARMINE ST", "Manhattan"),
            "joe's pizza|7 carmine st|manhattan"
        );
    }
}
