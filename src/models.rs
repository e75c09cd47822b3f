use crate::properties::{PropertyMap, json_text};
use crate::sync::parser::{ParsedMessage, parse_numbering};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use uuid::Uuid;

pub type ProjectId = i32;

// ===== Projects =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub parent: Option<ProjectId>,
    /// Addresses whose presence in To/Cc routes a message to this project.
    pub mailing_lists: Vec<String>,
    /// Whitespace separated subject prefix rules (`/regex`, `!negation`).
    pub prefix_tags: String,
    pub git: Option<String>,
    pub maintainers: Vec<String>,
    pub properties: PropertyMap,
}

impl Project {
    /// New unsaved project. The store assigns the id on insert.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            parent: None,
            mailing_lists: Vec::new(),
            prefix_tags: String::new(),
            git: None,
            maintainers: Vec::new(),
            properties: PropertyMap::new(),
        }
    }

    pub fn with_mailing_list(mut self, address: impl Into<String>) -> Self {
        self.mailing_lists.push(address.into());
        self
    }

    pub fn with_prefix_tags(mut self, rules: impl Into<String>) -> Self {
        self.prefix_tags = rules.into();
        self
    }

    pub fn with_parent(mut self, parent: ProjectId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_maintainer(mut self, maintainer: impl Into<String>) -> Self {
        self.maintainers.push(maintainer.into());
        self
    }
}

// ===== Messages =====

/// A message is unique per (project, message id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub project: ProjectId,
    pub message_id: String,
}

impl MessageKey {
    pub fn new(project: ProjectId, message_id: impl Into<String>) -> Self {
        Self {
            project,
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:<{}>", self.project, self.message_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub address: String,
}

impl Address {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId(pub Uuid);

impl TopicId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TopicId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Groups all revisions of one logical series within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub project: ProjectId,
    /// Message id of the most recent series head in this topic.
    pub latest: Option<String>,
}

impl Topic {
    pub fn new(project: ProjectId) -> Self {
        Self {
            id: TopicId::new(),
            project,
            latest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub project: ProjectId,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub stripped_subject: String,
    pub version: u32,
    pub prefixes: Vec<String>,
    pub sender: Address,
    pub recipients: Vec<Address>,
    pub body: String,
    pub is_patch: bool,
    pub is_multipart: bool,
    pub content_transfer_encoding: Option<String>,
    /// Set only on series heads.
    pub topic: Option<TopicId>,
    pub is_complete: bool,
    pub is_reviewed: bool,
    pub is_obsolete: bool,
    pub is_merged: bool,
    pub is_tested: bool,
    pub num_patches: Option<u32>,
    pub last_reply_date: Option<DateTime<Utc>>,
    pub last_comment_date: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    /// MAINTAINERS entries covering the files a series touches.
    pub maintainers: Vec<String>,
    pub properties: PropertyMap,
}

impl Message {
    pub(crate) fn from_parsed(project: ProjectId, parsed: &ParsedMessage, topic: Option<TopicId>) -> Self {
        Self {
            project,
            message_id: parsed.message_id.clone(),
            in_reply_to: parsed.in_reply_to.clone(),
            date: parsed.date,
            subject: parsed.subject.clone(),
            stripped_subject: parsed.stripped_subject.clone(),
            version: parsed.version,
            prefixes: parsed.prefixes.clone(),
            sender: parsed.sender.clone(),
            recipients: parsed.recipients.clone(),
            body: parsed.body.clone(),
            is_patch: parsed.is_patch,
            is_multipart: parsed.is_multipart,
            content_transfer_encoding: parsed.content_transfer_encoding.clone(),
            topic,
            is_complete: false,
            is_reviewed: false,
            is_obsolete: false,
            is_merged: false,
            is_tested: false,
            num_patches: None,
            last_reply_date: None,
            last_comment_date: None,
            tags: Vec::new(),
            maintainers: Vec::new(),
            properties: PropertyMap::new(),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.project, self.message_id.clone())
    }

    pub fn is_series_head(&self) -> bool {
        self.topic.is_some()
    }

    /// `(position, total)` parsed from the subject prefixes.
    pub fn numbering(&self) -> (u32, u32) {
        parse_numbering(&self.prefixes)
    }

    /// Sort key used for listings: latest reply, or the message date.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_reply_date.unwrap_or(self.date)
    }
}

// ===== Results =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Running => "running",
            ResultStatus::Success => "success",
            ResultStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Ok(ResultStatus::Pending),
            "running" => Ok(ResultStatus::Running),
            "success" => Ok(ResultStatus::Success),
            "failure" => Ok(ResultStatus::Failure),
            other => Err(format!("unknown result status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultOwner {
    Project(ProjectId),
    Message(MessageKey),
}

/// gzip-compressed log text attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    compressed: Vec<u8>,
}

impl LogEntry {
    pub fn compress(text: &str) -> std::io::Result<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes())?;
        Ok(Self {
            compressed: encoder.finish()?,
        })
    }

    pub fn text(&self) -> std::io::Result<String> {
        let mut decoder = GzDecoder::new(self.compressed.as_slice());
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text)
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub owner: ResultOwner,
    /// Dotted name, e.g. `git` or `testing.checkpatch`.
    pub name: String,
    pub status: ResultStatus,
    pub last_update: DateTime<Utc>,
    #[serde(with = "json_text")]
    pub data: Value,
    pub log: Option<LogEntry>,
}

// ===== Queues =====

pub mod queue_names {
    pub const ACCEPT: &str = "accept";
    pub const REJECT: &str = "reject";
    pub const WATCHED: &str = "watched";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuedSeries {
    pub user: String,
    pub message: MessageKey,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedQuery {
    pub user: String,
    /// Resolves `me` in maintainer terms.
    pub email: Option<String>,
    pub query: String,
}

// ===== Callers =====

/// Identity of whoever runs a search or queue operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub username: Option<String>,
    pub email: Option<String>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(username: impl Into<String>, email: Option<&str>) -> Self {
        Self {
            username: Some(username.into()),
            email: email.map(str::to_string),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }
}
