//! Project routing: which projects a parsed message belongs to.

use crate::models::Project;
use crate::sync::parser::ParsedMessage;
use regex::Regex;

impl Project {
    /// Whether `message` was sent to one of this project's mailing lists and
    /// its subject prefixes satisfy every `prefix_tags` rule.
    ///
    /// Rules are whitespace separated. A plain rule must equal some prefix
    /// (ignoring case), `/regex` must match the start of some prefix, and a
    /// leading `!` inverts the rule.
    pub fn recognizes(&self, message: &ParsedMessage) -> bool {
        let addressed = message.recipients.iter().any(|recipient| {
            self.mailing_lists
                .iter()
                .any(|list| list.eq_ignore_ascii_case(&recipient.address))
        });
        if !addressed {
            return false;
        }

        self.prefix_tags.split_whitespace().all(|rule| {
            let (rule, inverted) = match rule.strip_prefix('!') {
                Some(rule) => (rule, true),
                None => (rule, false),
            };
            let found = message
                .prefixes
                .iter()
                .any(|prefix| prefix_matches(rule, prefix));
            found != inverted
        })
    }
}

fn prefix_matches(rule: &str, prefix: &str) -> bool {
    let Some(pattern) = rule.strip_prefix('/') else {
        return rule.eq_ignore_ascii_case(prefix);
    };
    match Regex::new(&format!("^(?:{pattern})")) {
        Ok(regex) => regex.is_match(prefix),
        Err(err) => {
            log::warn!("ignoring invalid prefix rule /{}: {}", pattern, err);
            false
        }
    }
}
