// Host selector expressions over group tags

use super::Host;

/// One term of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    /// Union with hosts carrying this tag (or named so)
    Include(String),
    /// Keep only hosts that also carry this tag
    Intersect(String),
    /// Drop hosts carrying this tag
    Exclude(String),
}

/// Target-host selector for a task.
///
/// Patterns follow the familiar inventory syntax:
/// - `all`, `*` or empty: every host
/// - `webservers`: hosts tagged `webservers`, or the host named so
/// - `webservers:dbservers` (or `webservers,dbservers`): union
/// - `webservers:&prod`: intersection
/// - `webservers:!staging`: exclusion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSelector {
    source: String,
    terms: Vec<Term>,
    all: bool,
}

impl HostSelector {
    pub fn all() -> Self {
        HostSelector {
            source: "all".to_string(),
            terms: Vec::new(),
            all: true,
        }
    }

    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        let mut terms = Vec::new();
        let mut all = pattern.is_empty();

        for part in pattern.split([':', ',']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some(tag) = part.strip_prefix('&') {
                terms.push(Term::Intersect(tag.to_string()));
            } else if let Some(tag) = part.strip_prefix('!') {
                terms.push(Term::Exclude(tag.to_string()));
            } else if part == "all" || part == "*" {
                all = true;
            } else {
                terms.push(Term::Include(part.to_string()));
            }
        }

        // A selector made only of filters starts from every host
        if !terms.iter().any(|t| matches!(t, Term::Include(_))) {
            all = true;
        }

        HostSelector {
            source: if pattern.is_empty() {
                "all".to_string()
            } else {
                pattern.to_string()
            },
            terms,
            all,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, host: &Host) -> bool {
        let tagged = |tag: &str| host.name == tag || host.has_tag(tag);

        let mut selected = self.all
            || self
                .terms
                .iter()
                .any(|t| matches!(t, Term::Include(tag) if tagged(tag)));

        for term in &self.terms {
            match term {
                Term::Intersect(tag) => selected &= tagged(tag),
                Term::Exclude(tag) => selected &= !tagged(tag),
                Term::Include(_) => {}
            }
        }

        selected
    }
}

impl Default for HostSelector {
    fn default() -> Self {
        HostSelector::all()
    }
}

impl std::fmt::Display for HostSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for HostSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(HostSelector::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<Host> {
        vec![
            Host::new("web1").with_tag("webservers").with_tag("prod"),
            Host::new("web2").with_tag("webservers").with_tag("staging"),
            Host::new("db1").with_tag("databases").with_tag("prod"),
            Host::new("staging1").with_tag("staging"),
        ]
    }

    fn select(pattern: &str) -> Vec<String> {
        let sel = HostSelector::parse(pattern);
        hosts()
            .into_iter()
            .filter(|h| sel.matches(h))
            .map(|h| h.name)
            .collect()
    }

    #[test]
    fn test_all_patterns() {
        assert_eq!(select("all").len(), 4);
        assert_eq!(select("").len(), 4);
        assert_eq!(select("*").len(), 4);
    }

    #[test]
    fn test_group_and_host_name() {
        assert_eq!(select("webservers"), vec!["web1", "web2"]);
        assert_eq!(select("db1"), vec!["db1"]);
        assert!(select("nosuchgroup").is_empty());
    }

    #[test]
    fn test_union_intersection_exclusion() {
        assert_eq!(select("webservers:databases"), vec!["web1", "web2", "db1"]);
        assert_eq!(select("webservers,databases"), vec!["web1", "web2", "db1"]);
        assert_eq!(select("webservers:&prod"), vec!["web1"]);
        assert_eq!(select("webservers:!staging"), vec!["web1"]);
        assert_eq!(select("!staging"), vec!["web1", "db1"]);
    }

    #[test]
    fn test_display_keeps_source() {
        assert_eq!(HostSelector::parse("web:&prod").to_string(), "web:&prod");
        assert_eq!(HostSelector::parse("  ").to_string(), "all");
    }
}
