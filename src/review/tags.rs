//! Status tag extraction.
//!
//! A tag is a body line such as `Reviewed-by: Name <addr>` whose prefix is
//! one of the recognised tag names, compared case-insensitively.
//! `Reviewed-by` and `Based-on` are always recognised; deployments add
//! more through configuration.

use crate::models::{Address, Message, MessageKey};
use crate::storage::{Store, StoreError};
use mailparse::MailAddr;
use regex::Regex;
use std::collections::HashSet;

pub const REVIEWED_BY: &str = "Reviewed-by";
pub const BASED_ON: &str = "Based-on";

const BUILT_IN_TAGS: [&str; 2] = [REVIEWED_BY, BASED_ON];

#[derive(Debug, Clone)]
pub struct TagMatcher {
    names: Vec<String>,
    regex: Regex,
}

impl TagMatcher {
    /// Matcher for `configured` tag names plus the built-ins.
    pub fn new<S: AsRef<str>>(configured: &[S]) -> Result<Self, regex::Error> {
        let mut names: Vec<String> = Vec::new();
        let candidates = configured
            .iter()
            .map(|name| name.as_ref().trim())
            .chain(BUILT_IN_TAGS);
        for name in candidates {
            let name = name.trim_end_matches(':');
            if name.is_empty() || names.iter().any(|known| known.eq_ignore_ascii_case(name)) {
                continue;
            }
            names.push(name.to_string());
        }

        let alternation = names
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|");
        let regex = Regex::new(&format!("^(?i:{alternation}):"))?;
        Ok(Self { names, regex })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_tag_line(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Tag lines of `body`, in order, stopping at the first `---` line.
    pub fn extract(&self, body: &str) -> Vec<String> {
        body.lines()
            .take_while(|line| !line.starts_with("---"))
            .filter(|line| self.is_tag_line(line))
            .map(|line| line.trim_end().to_string())
            .collect()
    }
}

/// Tags of `message` followed by those of its non-patch replies,
/// depth first, without duplicates.
pub fn collect_tags(
    store: &dyn Store,
    matcher: &TagMatcher,
    message: &Message,
) -> Result<Vec<String>, StoreError> {
    let mut tags = Vec::new();
    let mut seen_tags = HashSet::new();
    let mut visited: HashSet<MessageKey> = HashSet::new();
    let mut stack = vec![message.clone()];

    while let Some(current) = stack.pop() {
        if !visited.insert(current.key()) {
            continue;
        }
        for tag in matcher.extract(&current.body) {
            if seen_tags.insert(tag.clone()) {
                tags.push(tag);
            }
        }
        let replies = store.replies(&current.key())?;
        stack.extend(replies.into_iter().filter(|reply| !reply.is_patch).rev());
    }
    Ok(tags)
}

/// Value of a tag line after its `Name:` prefix, if the prefix is `name`.
pub fn tag_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (prefix, value) = line.split_once(':')?;
    prefix
        .trim()
        .eq_ignore_ascii_case(name)
        .then(|| value.trim())
}

/// Parse the address of a `Reviewed-by:` style value.
pub fn parse_reviewer(value: &str) -> Address {
    if let Ok(list) = mailparse::addrparse(value) {
        if let Some(MailAddr::Single(info)) = list.iter().next() {
            return Address::new(
                info.display_name.clone().unwrap_or_default(),
                info.addr.to_lowercase(),
            );
        }
    }
    Address::new("", value.trim())
}

/// Reviewers named by the `Reviewed-by` lines in `tags`.
pub fn reviewers(tags: &[String]) -> Vec<Address> {
    let mut found: Vec<Address> = Vec::new();
    for value in tags.iter().filter_map(|tag| tag_value(tag, REVIEWED_BY)) {
        let reviewer = parse_reviewer(value);
        if !found.contains(&reviewer) {
            found.push(reviewer);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TagMatcher {
        TagMatcher::new(&["Tested-by", "Acked-by", "reviewed-by"]).unwrap()
    }

    #[test]
    fn built_ins_are_always_present() {
        let matcher = TagMatcher::new::<&str>(&[]).unwrap();
        assert_eq!(matcher.names(), &["Reviewed-by", "Based-on"]);
    }

    #[test]
    fn configured_names_are_deduplicated() {
        assert_eq!(
            matcher().names(),
            &["Tested-by", "Acked-by", "reviewed-by", "Based-on"]
        );
    }

    #[test]
    fn extraction_is_case_insensitive_and_stops_at_diff() {
        let body = "Some text\n\
                    REVIEWED-BY: Eric Blake <eblake@redhat.com>\n\
                    acked-by: Max <max@example.com>\n\
                    Signed-off-by: Fam <famz@redhat.com>\n\
                    ---\n\
                    Tested-by: after the marker <x@y.org>\n";
        assert_eq!(
            matcher().extract(body),
            vec![
                "REVIEWED-BY: Eric Blake <eblake@redhat.com>",
                "acked-by: Max <max@example.com>",
            ]
        );
    }

    #[test]
    fn tag_must_start_the_line() {
        let body = "> Reviewed-by: quoted <q@x.org>\n Reviewed-by: indented <i@x.org>\n";
        assert!(matcher().extract(body).is_empty());
    }

    #[test]
    fn reviewers_parse_addresses() {
        let tags = vec![
            "Reviewed-by: Eric Blake <EBlake@redhat.com>".to_string(),
            "reviewed-by: Eric Blake <eblake@redhat.com>".to_string(),
            "Acked-by: Someone <s@x.org>".to_string(),
        ];
        assert_eq!(
            reviewers(&tags),
            vec![Address::new("Eric Blake", "eblake@redhat.com")]
        );
    }

    #[test]
    fn tag_value_matches_name_only() {
        assert_eq!(tag_value("Based-on: <a@b>", BASED_ON), Some("<a@b>"));
        assert_eq!(tag_value("Based-on: <a@b>", REVIEWED_BY), None);
        assert_eq!(tag_value("no colon here", BASED_ON), None);
    }
}
