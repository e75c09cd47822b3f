//! Search DSL compiler.
//!
//! A query is a whitespace separated list of terms, all of which must hold:
//!
//! ```text
//! bugfix from:Bob to:George age:>1w
//! from:Bob fix +reviewed -tested
//! !has:replies success:git project:qemu
//! ```
//!
//! Each term compiles to a [`Predicate`]. Terms that are not filters become
//! subject keywords, which are kept apart from the predicate tree and only
//! combined with it in [`CompiledQuery::into_predicate`], once it is known
//! whether the store offers full-text search.

use super::error::SearchError;
use super::predicate::{Predicate, SeriesFlag, StatusFilter};
use crate::models::{Caller, ResultStatus, queue_names};
use crate::storage::StoreCapabilities;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    /// Free-text subject keywords, in query order.
    pub keywords: Vec<String>,
    /// Names given through `project:` terms.
    pub projects: BTreeSet<String>,
}

impl CompiledQuery {
    /// The project hint, when the query names exactly one project.
    pub fn project(&self) -> Option<&str> {
        match self.projects.len() {
            1 => self.projects.iter().next().map(String::as_str),
            _ => None,
        }
    }

    /// Full predicate including the keyword filter for a store with
    /// `capabilities`.
    pub fn into_predicate(self, capabilities: StoreCapabilities) -> Predicate {
        if self.keywords.is_empty() {
            return self.predicate;
        }
        let keyword_filter = if capabilities.full_text_search {
            Predicate::SubjectWords(self.keywords)
        } else {
            Predicate::all(
                self.keywords
                    .into_iter()
                    .map(Predicate::SubjectContainsIgnoreCase)
                    .collect(),
            )
        };
        Predicate::all(vec![self.predicate, keyword_filter])
    }
}

pub fn compile(query: &str, caller: &Caller) -> Result<CompiledQuery, SearchError> {
    compile_at(query, caller, Utc::now())
}

/// Compile `query` with ages measured from `now`.
pub fn compile_at(
    query: &str,
    caller: &Caller,
    now: DateTime<Utc>,
) -> Result<CompiledQuery, SearchError> {
    let mut compiler = TermCompiler {
        caller,
        now,
        keywords: Vec::new(),
        projects: BTreeSet::new(),
    };
    let mut parts = Vec::new();
    for term in query.split_whitespace() {
        parts.push(compiler.term(term)?);
    }
    log::debug!(
        "compiled {:?}: {} terms, {} keywords",
        query,
        parts.len(),
        compiler.keywords.len()
    );
    Ok(CompiledQuery {
        predicate: Predicate::all(parts),
        keywords: compiler.keywords,
        projects: compiler.projects,
    })
}

struct TermCompiler<'a> {
    caller: &'a Caller,
    now: DateTime<Utc>,
    keywords: Vec<String>,
    projects: BTreeSet<String>,
}

impl TermCompiler<'_> {
    fn term(&mut self, term: &str) -> Result<Predicate, SearchError> {
        if let Some(rest) = term.strip_prefix('!') {
            if rest.is_empty() {
                return Ok(self.keyword(term));
            }
            let inner = self.term(rest)?;
            return Ok(negate_filter(inner));
        }
        if let Some(flag) = term.strip_prefix('+').filter(|rest| !rest.is_empty()) {
            return self.shortcut(flag, false);
        }
        if let Some(flag) = term.strip_prefix('-').filter(|rest| !rest.is_empty()) {
            return self.shortcut(flag, true);
        }
        self.filter(term)
    }

    /// `+X` / `-X`: a flag unless `X` is itself a `name:value` term.
    fn shortcut(&mut self, term: &str, negated: bool) -> Result<Predicate, SearchError> {
        let compiled = if term.contains(':') {
            self.filter(term)?
        } else {
            match flag_filter(term, &mut self.keywords) {
                Some(predicate) => predicate,
                None => self.keyword(term),
            }
        };
        Ok(if negated {
            negate_filter(compiled)
        } else {
            compiled
        })
    }

    fn filter(&mut self, term: &str) -> Result<Predicate, SearchError> {
        if let Some(cond) = term.strip_prefix("age:") {
            return age_filter(cond, self.now);
        }
        if (term.starts_with('<') || term.starts_with('>')) && term.len() > 1 {
            return age_filter(term, self.now);
        }

        let Some((name, value)) = term.split_once(':') else {
            return Ok(self.keyword(term));
        };
        let predicate = match name {
            "from" => Predicate::SenderContains(value.to_string()),
            "to" => Predicate::RecipientsContains(value.to_string()),
            "subject" => self.keyword(value),
            "id" | "rfc822msgid" => {
                let id = value
                    .strip_prefix('<')
                    .and_then(|id| id.strip_suffix('>'))
                    .unwrap_or(value);
                Predicate::MessageId(id.to_string())
            }
            "is" => match flag_filter(value, &mut self.keywords) {
                Some(predicate) => predicate,
                None => self.keyword(term),
            },
            "not" => match flag_filter(value, &mut self.keywords) {
                Some(predicate) => predicate.negate(),
                None => self.keyword(term),
            },
            "has" if value == "replies" => Predicate::HasComments,
            "has" => Predicate::HasProperty(value.to_string()),
            "failure" => result_filter(value, StatusFilter::Is(ResultStatus::Failure)),
            "pending" => result_filter(value, StatusFilter::Is(ResultStatus::Pending)),
            "running" => result_filter(value, StatusFilter::Is(ResultStatus::Running)),
            // "All results succeeded" as "some result exists and none failed
            // to succeed".
            "success" => Predicate::all(vec![
                result_filter(value, StatusFilter::Any),
                result_filter(value, StatusFilter::IsNot(ResultStatus::Success)).negate(),
            ]),
            "ack" | "accept" | "accepted" => self.queue_filter(value, &[queue_names::ACCEPT]),
            "nack" | "reject" | "rejected" => self.queue_filter(value, &[queue_names::REJECT]),
            "review" | "reviewed" => {
                self.queue_filter(value, &[queue_names::ACCEPT, queue_names::REJECT])
            }
            "watch" | "watched" => self.queue_filter(value, &[queue_names::WATCHED]),
            "project" => {
                self.projects.insert(value.to_string());
                Predicate::Project(value.to_string())
            }
            "maintained-by" | "maint" => {
                let needle = match (value, &self.caller.email) {
                    ("me", Some(email)) => email.clone(),
                    _ => value.to_string(),
                };
                Predicate::MaintainedBy(needle)
            }
            _ => self.keyword(term),
        };
        Ok(predicate)
    }

    fn queue_filter(&self, username: &str, names: &[&str]) -> Predicate {
        let user = if username == "me" {
            match &self.caller.username {
                Some(user) => user.clone(),
                None => return Predicate::Never,
            }
        } else {
            username.to_string()
        };
        Predicate::InQueue {
            user,
            names: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    fn keyword(&mut self, keyword: &str) -> Predicate {
        if !keyword.is_empty() {
            self.keywords.push(keyword.to_string());
        }
        Predicate::Always
    }
}

/// Negation of a compiled term. Keyword terms compile to `Always` and stay
/// that way: their text filter is applied separately and is never negated.
fn negate_filter(predicate: Predicate) -> Predicate {
    match predicate {
        Predicate::Always => Predicate::Always,
        other => other.negate(),
    }
}

fn flag_filter(flag: &str, keywords: &mut Vec<String>) -> Option<Predicate> {
    let predicate = match flag {
        "complete" => Predicate::Flag(SeriesFlag::Complete),
        "pull" => {
            keywords.push("PULL".to_string());
            Predicate::Or(vec![
                Predicate::SubjectContains("[PULL".to_string()),
                Predicate::SubjectContains("[GIT PULL".to_string()),
            ])
        }
        "reviewed" => Predicate::Flag(SeriesFlag::Reviewed),
        "obsolete" | "obsoleted" | "old" => Predicate::Flag(SeriesFlag::Obsolete),
        "applied" => Predicate::Result {
            name: "git".to_string(),
            family: false,
            status: StatusFilter::Is(ResultStatus::Success),
        },
        "tested" => Predicate::Flag(SeriesFlag::Tested),
        "merged" => Predicate::Flag(SeriesFlag::Merged),
        _ => return None,
    };
    Some(predicate)
}

fn result_filter(name: &str, status: StatusFilter) -> Predicate {
    Predicate::Result {
        name: name.to_string(),
        family: true,
        status,
    }
}

fn age_filter(cond: &str, now: DateTime<Utc>) -> Result<Predicate, SearchError> {
    let (newer_than, amount) = match cond.strip_prefix('<') {
        Some(rest) => (true, rest),
        None => (false, cond.strip_prefix('>').unwrap_or(cond)),
    };

    let mut chars = amount.chars();
    let unit = chars.next_back().map(|unit| unit.to_ascii_lowercase());
    let number = chars.as_str();
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SearchError::invalid_term(format!("age:{cond}")));
    }
    let days_per_unit = match unit {
        Some('d') => 1,
        Some('w') => 7,
        Some('m') => 30,
        Some('y') => 365,
        _ => return Err(SearchError::invalid_term(format!("age:{cond}"))),
    };
    let count: i64 = number
        .parse()
        .map_err(|_| SearchError::invalid_term(format!("age:{cond}")))?;
    let cutoff = count
        .checked_mul(days_per_unit)
        .and_then(Duration::try_days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| SearchError::invalid_term(format!("age:{cond}")))?;

    Ok(if newer_than {
        Predicate::DateAtLeast(cutoff)
    } else {
        Predicate::DateAtMost(cutoff)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn compile_anon(query: &str) -> CompiledQuery {
        compile_at(query, &Caller::anonymous(), now()).unwrap()
    }

    #[test]
    fn plain_words_become_keywords() {
        let compiled = compile_anon("bugfix  from:Bob block");
        assert_eq!(compiled.keywords, vec!["bugfix", "block"]);
        assert_eq!(compiled.predicate, Predicate::SenderContains("Bob".into()));
    }

    #[test]
    fn age_units_and_directions() {
        let older = compile_anon("age:>1w").predicate;
        assert_eq!(older, Predicate::DateAtMost(now() - Duration::days(7)));

        let newer = compile_anon("<2m").predicate;
        assert_eq!(newer, Predicate::DateAtLeast(now() - Duration::days(60)));

        let bare = compile_anon("age:1Y").predicate;
        assert_eq!(bare, Predicate::DateAtMost(now() - Duration::days(365)));
    }

    #[test]
    fn invalid_age_rejects_whole_query() {
        for query in ["age:1x", "age:w", "fix age:>abcd", "<1"] {
            let err = compile_at(query, &Caller::anonymous(), now()).unwrap_err();
            assert!(
                matches!(err, SearchError::InvalidSearchTerm(_)),
                "{query} gave {err:?}"
            );
        }
    }

    #[test]
    fn lone_angle_bracket_is_a_keyword() {
        assert_eq!(compile_anon(">").keywords, vec![">"]);
    }

    #[test]
    fn message_id_strips_brackets() {
        assert_eq!(
            compile_anon("id:<a@b.c>").predicate,
            Predicate::MessageId("a@b.c".into())
        );
        assert_eq!(
            compile_anon("rfc822msgid:a@b.c").predicate,
            Predicate::MessageId("a@b.c".into())
        );
    }

    #[test]
    fn shortcuts_map_to_flags() {
        assert_eq!(
            compile_anon("+reviewed").predicate,
            Predicate::Flag(SeriesFlag::Reviewed)
        );
        assert_eq!(
            compile_anon("-tested").predicate,
            Predicate::Flag(SeriesFlag::Tested).negate()
        );
        assert_eq!(
            compile_anon("not:old").predicate,
            Predicate::Flag(SeriesFlag::Obsolete).negate()
        );
    }

    #[test]
    fn unknown_flags_fall_back_to_keywords() {
        let compiled = compile_anon("+shiny is:sparkly -dull");
        assert_eq!(compiled.predicate, Predicate::Always);
        assert_eq!(compiled.keywords, vec!["shiny", "is:sparkly", "dull"]);
    }

    #[test]
    fn minus_with_colon_negates_the_filter() {
        assert_eq!(
            compile_anon("-from:bob").predicate,
            Predicate::SenderContains("bob".into()).negate()
        );
    }

    #[test]
    fn double_bang_is_identity() {
        assert_eq!(
            compile_anon("!!is:reviewed").predicate,
            compile_anon("is:reviewed").predicate
        );
        assert_eq!(
            compile_anon("!has:replies").predicate,
            Predicate::HasComments.negate()
        );
    }

    #[test]
    fn negated_keyword_stays_a_keyword() {
        let compiled = compile_anon("!regression");
        assert_eq!(compiled.predicate, Predicate::Always);
        assert_eq!(compiled.keywords, vec!["regression"]);
    }

    #[test]
    fn pull_adds_keyword() {
        let compiled = compile_anon("is:pull");
        assert_eq!(compiled.keywords, vec!["PULL"]);
        assert!(matches!(compiled.predicate, Predicate::Or(_)));
    }

    #[test]
    fn success_requires_no_other_status() {
        let compiled = compile_anon("success:git");
        assert_eq!(
            compiled.predicate,
            Predicate::And(vec![
                result_filter("git", StatusFilter::Any),
                Predicate::Not(Box::new(result_filter(
                    "git",
                    StatusFilter::IsNot(ResultStatus::Success)
                ))),
            ])
        );
    }

    #[test]
    fn queue_terms_resolve_me() {
        let anon = compile_anon("accept:me");
        assert_eq!(anon.predicate, Predicate::Never);

        let caller = Caller::user("fam", Some("famz@redhat.com"));
        let compiled = compile_at("review:me maint:me", &caller, now()).unwrap();
        assert_eq!(
            compiled.predicate,
            Predicate::And(vec![
                Predicate::InQueue {
                    user: "fam".into(),
                    names: vec!["accept".into(), "reject".into()],
                },
                Predicate::MaintainedBy("famz@redhat.com".into()),
            ])
        );
    }

    #[test]
    fn project_terms_record_hints() {
        let single = compile_anon("project:qemu fix");
        assert_eq!(single.project(), Some("qemu"));

        let double = compile_anon("project:qemu project:qemu-block");
        assert_eq!(double.project(), None);
        assert_eq!(double.projects.len(), 2);
    }

    #[test]
    fn keywords_follow_backend_capability() {
        let compiled = compile_anon("is:complete Fix leak");
        let indexed = compiled.clone().into_predicate(StoreCapabilities {
            full_text_search: true,
        });
        assert_eq!(
            indexed,
            Predicate::And(vec![
                Predicate::Flag(SeriesFlag::Complete),
                Predicate::SubjectWords(vec!["Fix".into(), "leak".into()]),
            ])
        );

        let fallback = compiled.into_predicate(StoreCapabilities::default());
        assert_eq!(
            fallback,
            Predicate::And(vec![
                Predicate::Flag(SeriesFlag::Complete),
                Predicate::SubjectContainsIgnoreCase("Fix".into()),
                Predicate::SubjectContainsIgnoreCase("leak".into()),
            ])
        );
    }

    #[test]
    fn empty_query_matches_everything() {
        let compiled = compile_anon("   ");
        assert_eq!(compiled.predicate, Predicate::Always);
        assert!(compiled.keywords.is_empty());
    }
}
