//! Backend-neutral filter tree produced by the query compiler.

use crate::models::{Message, Project, QueuedSeries, ResultRecord, ResultStatus};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesFlag {
    Complete,
    Reviewed,
    Obsolete,
    Tested,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Any,
    Is(ResultStatus),
    IsNot(ResultStatus),
}

impl StatusFilter {
    fn accepts(&self, status: ResultStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Is(wanted) => status == *wanted,
            StatusFilter::IsNot(unwanted) => status != *unwanted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Always,
    Never,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    DateAtLeast(DateTime<Utc>),
    DateAtMost(DateTime<Utc>),
    /// Case-insensitive match on sender name or address.
    SenderContains(String),
    /// Case-insensitive match on any To/Cc name or address.
    RecipientsContains(String),
    MessageId(String),
    Flag(SeriesFlag),
    SubjectContains(String),
    SubjectContainsIgnoreCase(String),
    /// Every word occurs as a whole token of the subject.
    SubjectWords(Vec<String>),
    HasComments,
    HasProperty(String),
    /// A result named `name` (or, with `family`, `name.*`) in a status.
    Result {
        name: String,
        family: bool,
        status: StatusFilter,
    },
    InQueue {
        user: String,
        names: Vec<String>,
    },
    /// Project or parent project name.
    Project(String),
    MaintainedBy(String),
}

impl Predicate {
    /// Logical negation that folds double negation and constants.
    pub fn negate(self) -> Predicate {
        match self {
            Predicate::Always => Predicate::Never,
            Predicate::Never => Predicate::Always,
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    /// Conjunction of `parts`, flattening nested `And`s.
    pub fn all(parts: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Predicate::Always => {}
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Always,
            1 => flat.pop().unwrap_or(Predicate::Always),
            _ => Predicate::And(flat),
        }
    }

    pub fn matches(&self, candidate: &Candidate<'_>) -> bool {
        let message = candidate.message;
        match self {
            Predicate::Always => true,
            Predicate::Never => false,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(candidate)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(candidate)),
            Predicate::Not(inner) => !inner.matches(candidate),
            Predicate::DateAtLeast(cutoff) => message.date >= *cutoff,
            Predicate::DateAtMost(cutoff) => message.date <= *cutoff,
            Predicate::SenderContains(needle) => {
                contains_ignore_case(&message.sender.name, needle)
                    || contains_ignore_case(&message.sender.address, needle)
            }
            Predicate::RecipientsContains(needle) => message.recipients.iter().any(|r| {
                contains_ignore_case(&r.name, needle) || contains_ignore_case(&r.address, needle)
            }),
            Predicate::MessageId(id) => message.message_id == *id,
            Predicate::Flag(flag) => match flag {
                SeriesFlag::Complete => message.is_complete,
                SeriesFlag::Reviewed => message.is_reviewed,
                SeriesFlag::Obsolete => message.is_obsolete,
                SeriesFlag::Tested => message.is_tested,
                SeriesFlag::Merged => message.is_merged,
            },
            Predicate::SubjectContains(needle) => message.subject.contains(needle.as_str()),
            Predicate::SubjectContainsIgnoreCase(needle) => {
                contains_ignore_case(&message.subject, needle)
            }
            Predicate::SubjectWords(words) => {
                let tokens: Vec<String> = text_tokens(&message.subject).collect();
                words
                    .iter()
                    .flat_map(|word| text_tokens(word))
                    .all(|word| tokens.contains(&word))
            }
            Predicate::HasComments => message.last_comment_date.is_some(),
            Predicate::HasProperty(name) => message.properties.contains(name),
            Predicate::Result {
                name,
                family,
                status,
            } => candidate.results.iter().any(|result| {
                result_name_matches(&result.name, name, *family) && status.accepts(result.status)
            }),
            Predicate::InQueue { user, names } => candidate
                .queues
                .iter()
                .any(|entry| entry.user == *user && names.contains(&entry.name)),
            Predicate::Project(name) => {
                candidate.project.is_some_and(|p| p.name == *name)
                    || candidate.parent_project.is_some_and(|p| p.name == *name)
            }
            Predicate::MaintainedBy(needle) => message
                .maintainers
                .iter()
                .any(|maintainer| contains_ignore_case(maintainer, needle)),
        }
    }
}

/// Everything a predicate may look at for one message.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub message: &'a Message,
    pub project: Option<&'a Project>,
    pub parent_project: Option<&'a Project>,
    pub results: &'a [ResultRecord],
    pub queues: &'a [QueuedSeries],
}

impl<'a> Candidate<'a> {
    pub fn bare(message: &'a Message) -> Self {
        Self {
            message,
            project: None,
            parent_project: None,
            results: &[],
            queues: &[],
        }
    }
}

fn result_name_matches(actual: &str, wanted: &str, family: bool) -> bool {
    if actual == wanted {
        return true;
    }
    family
        && actual
            .strip_prefix(wanted)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Lowercased alphanumeric words of `text`.
pub fn text_tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}
