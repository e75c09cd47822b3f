//! Patch series tracking for mailing-list driven projects.
//!
//! Messages are parsed ([`sync::parser`]), routed to projects and ingested
//! into a [`threading::ThreadIndex`] that groups them into series and
//! revisions. The [`review`] engine aggregates status tags, [`results`]
//! and [`queues`] record CI outcomes and per-user workflow, and [`search`]
//! compiles the query DSL into predicates run against a [`storage::Store`].

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod properties;
pub mod queues;
pub mod results;
pub mod review;
pub mod search;
pub mod storage;
pub mod sync;
pub mod threading;
pub mod tracker;

pub use config::TrackerConfig;
pub use error::TrackerError;
pub use events::{Event, EventBus, EventObserver};
pub use models::{Caller, Message, MessageKey, Project, ResultOwner, ResultStatus};
pub use storage::{MemoryStore, Store, StoreCapabilities};
pub use tracker::Tracker;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Initialise `env_logger` once per process, defaulting to `info`.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::events::{Event, EventObserver};
    use crate::models::{Address, Message};
    use crate::properties::PropertyMap;
    use crate::sync::parser::{split_subject, parse_version};
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    pub const SAMPLE_DIFF: &str = "\
Signed-off-by: Fam Zheng <famz@redhat.com>
---
 block/io.c | 2 +-
 1 file changed, 1 insertion(+), 1 deletion(-)

diff --git a/block/io.c b/block/io.c
index 1111111..2222222 100644
--- a/block/io.c
+++ b/block/io.c
@@ -1,3 +1,3 @@
 int main(void)
-    return 1;
+    return 0;
";

    /// Date used by every fixture unless overridden.
    pub fn base_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 1, 10, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// Builds raw RFC 822 messages for parser and ingestion tests.
    #[derive(Debug, Clone)]
    pub struct MessageBuilder {
        message_id: String,
        subject: String,
        from: String,
        to: String,
        cc: Vec<String>,
        in_reply_to: Option<String>,
        date: DateTime<Utc>,
        extra_headers: Vec<(String, String)>,
        body: String,
    }

    impl MessageBuilder {
        pub fn new(message_id: &str, subject: &str) -> Self {
            Self {
                message_id: message_id.to_string(),
                subject: subject.to_string(),
                from: "Patch Sender <sender@example.com>".to_string(),
                to: "devel@lists.example.org".to_string(),
                cc: Vec::new(),
                in_reply_to: None,
                date: base_date(),
                extra_headers: Vec::new(),
                body: "Message body.\n".to_string(),
            }
        }

        pub fn from(mut self, from: &str) -> Self {
            self.from = from.to_string();
            self
        }

        pub fn to(mut self, to: &str) -> Self {
            self.to = to.to_string();
            self
        }

        pub fn cc(mut self, cc: &str) -> Self {
            self.cc.push(cc.to_string());
            self
        }

        pub fn reply_to(mut self, parent: &str) -> Self {
            self.in_reply_to = Some(parent.to_string());
            self
        }

        pub fn date(mut self, date: DateTime<Utc>) -> Self {
            self.date = date;
            self
        }

        pub fn header(mut self, name: &str, value: &str) -> Self {
            self.extra_headers.push((name.to_string(), value.to_string()));
            self
        }

        pub fn body(mut self, body: &str) -> Self {
            self.body = body.to_string();
            self
        }

        /// Body of a patch: `description` followed by a diff.
        pub fn patch_body(self, description: &str) -> Self {
            let body = format!("{description}\n\n{SAMPLE_DIFF}");
            self.body(&body)
        }

        pub fn build(&self) -> String {
            let mut raw = String::new();
            raw.push_str(&format!("Message-ID: <{}>\r\n", self.message_id));
            raw.push_str(&format!("Date: {}\r\n", self.date.to_rfc2822()));
            raw.push_str(&format!("From: {}\r\n", self.from));
            raw.push_str(&format!("To: {}\r\n", self.to));
            if !self.cc.is_empty() {
                raw.push_str(&format!("Cc: {}\r\n", self.cc.join(", ")));
            }
            raw.push_str(&format!("Subject: {}\r\n", self.subject));
            if let Some(parent) = &self.in_reply_to {
                raw.push_str(&format!("In-Reply-To: <{parent}>\r\n"));
                raw.push_str(&format!("References: <{parent}>\r\n"));
            }
            for (name, value) in &self.extra_headers {
                raw.push_str(&format!("{name}: {value}\r\n"));
            }
            raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
            raw.push_str(&self.body.replace('\n', "\r\n"));
            raw
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.build().into_bytes()
        }
    }

    /// A stored-message fixture in project 1, bypassing the parser.
    pub fn sample_message(message_id: &str, subject: &str) -> Message {
        let (prefixes, stripped_subject, _) = split_subject(subject);
        let version = parse_version(&prefixes);
        Message {
            project: 1,
            message_id: message_id.to_string(),
            in_reply_to: None,
            date: base_date(),
            subject: subject.to_string(),
            stripped_subject,
            version,
            prefixes,
            sender: Address::new("Patch Sender", "sender@example.com"),
            recipients: vec![Address::new("", "devel@lists.example.org")],
            body: String::new(),
            is_patch: false,
            is_multipart: false,
            content_transfer_encoding: None,
            topic: None,
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

    /// Records every event it sees.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(Event::name).collect()
        }

        pub fn count(&self, name: &str) -> usize {
            self.events.lock().iter().filter(|e| e.name() == name).count()
        }

        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl EventObserver for RecordingObserver {
        fn on_event(&self, event: &Event) {
            self.events.lock().push(event.clone());
        }
    }
}
