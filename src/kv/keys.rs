//! Key Namespaces
//!
//! Every key the cache layer writes belongs to one [`Namespace`]. Key
//! builders live here so no component hand-formats key strings.

use crate::domain::EntityType;

/// Snapshot of the usage map.
pub const USAGE_STATS_KEY: &str = "system:usage_stats";

/// Sorted set of the most accessed entities, scored by access count.
pub const HOT_ENTITIES_KEY: &str = "system:hot_entities";

/// KV key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Preloaded entities and per-type collections
    Cache,
    /// Relationship mirror sets
    Relationship,
    /// On-demand entity cache
    Lazy,
    /// Memoised index searches
    Search,
    /// Computed report payloads
    Report,
    /// Internal bookkeeping
    System,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Cache,
        Namespace::Relationship,
        Namespace::Lazy,
        Namespace::Search,
        Namespace::Report,
        Namespace::System,
    ];

    /// Namespaces whose keys the client tracks in-process.
    pub const TRACKED: [Namespace; 3] = [Namespace::Lazy, Namespace::Search, Namespace::Report];

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Cache => "cache",
            Namespace::Relationship => "rel",
            Namespace::Lazy => "lazy",
            Namespace::Search => "search",
            Namespace::Report => "report",
            Namespace::System => "system",
        }
    }

    /// Glob pattern matching every key of the namespace.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix())
    }

    /// Namespace a key belongs to, if any.
    pub fn of_key(key: &str) -> Option<Namespace> {
        let prefix = key.split(':').next()?;
        Namespace::ALL.into_iter().find(|ns| ns.prefix() == prefix)
    }

    pub fn is_tracked(&self) -> bool {
        Namespace::TRACKED.contains(self)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

// =============================================================================
// Key Builders
// =============================================================================

/// `cache:{type}:{id}`
pub fn entity_key(entity_type: EntityType, id: &str) -> String {
    format!("cache:{}:{}", entity_type, id)
}

/// `cache:{type}:list` - JSON id list snapshot
pub fn list_key(entity_type: EntityType) -> String {
    format!("cache:{}:list", entity_type)
}

/// `cache:{type}:all` - set of all ids
pub fn all_key(entity_type: EntityType) -> String {
    format!("cache:{}:all", entity_type)
}

/// `rel:{parent}:{id}:{child}s`
pub fn relationship_key(parent_type: EntityType, parent_id: &str, child_type: EntityType) -> String {
    format!("rel:{}:{}:{}s", parent_type, parent_id, child_type)
}

/// `lazy:{type}:{id}`
pub fn lazy_key(entity_type: EntityType, id: &str) -> String {
    format!("lazy:{}:{}", entity_type, id)
}

/// `search:{type}:{index_key}:{value}` with the value lowercased.
pub fn search_key(entity_type: EntityType, index_key: &str, value: &str) -> String {
    format!(
        "search:{}:{}:{}",
        entity_type,
        index_key,
        value.trim().to_lowercase()
    )
}

/// `search:{type}:*` - every memoised search of one type
pub fn search_pattern(entity_type: EntityType) -> String {
    format!("search:{}:*", glob_escape(entity_type.as_str()))
}

/// Usage map key, `{type}:{id}`.
pub fn usage_key(entity_type: EntityType, id: &str) -> String {
    format!("{}:{}", entity_type, id)
}

/// Split a usage key back into its parts.
pub fn parse_usage_key(key: &str) -> Option<(EntityType, &str)> {
    let (ty, id) = key.split_once(':')?;
    let ty = ty.parse().ok()?;
    Some((ty, id))
}

/// Usage key for a lazy cache key (`lazy:{type}:{id}` -> `{type}:{id}`).
pub fn usage_key_for_lazy(key: &str) -> Option<&str> {
    key.strip_prefix("lazy:")
}

/// Per-type collection keys (`cache:{type}:all` / `cache:{type}:list`).
pub fn is_collection_key(key: &str) -> bool {
    key.starts_with("cache:") && (key.ends_with(":all") || key.ends_with(":list"))
}

/// Percent-encode `%` and `:` so a value stays inside one `:`-separated
/// key segment.
pub fn encode_segment(value: &str) -> String {
    if !value.contains([':', '%']) {
        return value.to_string();
    }
    let mut encoded = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            c => encoded.push(c),
        }
    }
    encoded
}

// =============================================================================
// Glob Patterns
// =============================================================================

/// Escape glob metacharacters so a value matches only itself.
pub fn glob_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis-style glob match: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // Last `*` position in the pattern and the text index it resumes from
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        let advance = if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => Some(1),
                '[' => match class_match(&p, pi, t[ti]) {
                    Some((true, len)) => Some(len),
                    Some((false, _)) => None,
                    None => (t[ti] == '[').then_some(1),
                },
                '\\' if pi + 1 < p.len() => (p[pi + 1] == t[ti]).then_some(2),
                c => (c == t[ti]).then_some(1),
            }
        } else {
            None
        };

        if let Some(len) = advance {
            pi += len;
            ti += 1;
            continue;
        }

        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match `c` against the class starting at `p[start] == '['`.
///
/// Returns `(matched, pattern_chars_consumed)` or `None` if unterminated.
fn class_match(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (lo, hi) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1 - start))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builders() {
        assert_eq!(entity_key(EntityType::Division, "D1"), "cache:division:D1");
        assert_eq!(all_key(EntityType::Section), "cache:section:all");
        assert_eq!(list_key(EntityType::Employee), "cache:employee:list");
        assert_eq!(
            relationship_key(EntityType::Division, "D1", EntityType::Section),
            "rel:division:D1:sections"
        );
        assert_eq!(lazy_key(EntityType::Employee, "E9"), "lazy:employee:E9");
        assert_eq!(
            search_key(EntityType::Employee, "name", "  ADA "),
            "search:employee:name:ada"
        );
        assert!(glob_match(
            &search_pattern(EntityType::Employee),
            "search:employee:name:ada"
        ));
        assert!(!glob_match(
            &search_pattern(EntityType::Section),
            "search:employee:name:ada"
        ));
    }

    #[test]
    fn test_namespace_of_key() {
        assert_eq!(Namespace::of_key("lazy:employee:1"), Some(Namespace::Lazy));
        assert_eq!(Namespace::of_key("rel:division:D1:sections"), Some(Namespace::Relationship));
        assert_eq!(Namespace::of_key(USAGE_STATS_KEY), Some(Namespace::System));
        assert_eq!(Namespace::of_key("unrelated"), None);
        assert!(Namespace::Report.is_tracked());
        assert!(!Namespace::Cache.is_tracked());
    }

    #[test]
    fn test_usage_key_parsing() {
        assert_eq!(
            parse_usage_key("employee:E1"),
            Some((EntityType::Employee, "E1"))
        );
        assert_eq!(parse_usage_key("bogus"), None);
        assert_eq!(usage_key_for_lazy("lazy:section:S1"), Some("section:S1"));
    }

    #[test]
    fn test_collection_keys() {
        assert!(is_collection_key("cache:division:all"));
        assert!(is_collection_key("cache:division:list"));
        assert!(!is_collection_key("cache:division:D1"));
        assert!(!is_collection_key("lazy:division:all"));
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("D1"), "D1");
        assert_eq!(encode_segment("org:D1"), "org%3AD1");
        assert_eq!(encode_segment("50%:x"), "50%25%3Ax");
        assert_eq!(encode_segment(""), "");
    }

    #[test]
    fn test_glob_star_and_question() {
        assert!(glob_match("cache:*", "cache:division:D1"));
        assert!(glob_match("*", ""));
        assert!(glob_match("lazy:?mployee:*", "lazy:employee:42"));
        assert!(!glob_match("cache:*", "lazy:division:D1"));
        assert!(glob_match("report:*:2025-01-01:2025-01-07:*", "report:group:2025-01-01:2025-01-07:D1::::"));
        assert!(!glob_match("report:*:2025-01-01:2025-01-07:*", "report:group:2025-01-02:2025-01-07:::::"));
    }

    #[test]
    fn test_glob_classes() {
        assert!(glob_match("k[abc]", "kb"));
        assert!(!glob_match("k[abc]", "kd"));
        assert!(glob_match("k[a-c]", "kc"));
        assert!(glob_match("k[^a-c]", "kz"));
        assert!(!glob_match("k[^a-c]", "ka"));
    }

    #[test]
    fn test_glob_escape_round_trip() {
        let literal = "weird*id?[x]";
        let pattern = format!("lazy:{}", glob_escape(literal));
        assert!(glob_match(&pattern, "lazy:weird*id?[x]"));
        assert!(!glob_match(&pattern, "lazy:weirdXXid?[x]"));
    }
}
