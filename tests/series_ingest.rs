use chrono::Duration;
use series_tracker::sync::parser::parse_message;
use series_tracker::test_support::{MessageBuilder, RecordingObserver, base_date};
use series_tracker::{Message, MessageKey, Project, Store, Tracker, TrackerConfig, TrackerError};
use std::io::Cursor;
use std::sync::Arc;

const LIST: &str = "devel@lists.example.org";

fn setup() -> (Tracker, Project, Arc<RecordingObserver>) {
    let tracker = Tracker::in_memory(TrackerConfig::default()).expect("tracker");
    let project = tracker
        .create_project(Project::new("qemu").with_mailing_list(LIST))
        .expect("project");
    let recorder = Arc::new(RecordingObserver::default());
    tracker.register_observer(recorder.clone());
    (tracker, project, recorder)
}

fn ingest(tracker: &Tracker, project: &Project, builder: MessageBuilder) -> Message {
    let parsed = parse_message(&builder.bytes()).expect("parse");
    tracker.index().ingest(project, &parsed).expect("ingest")
}

fn reload(tracker: &Tracker, message: &Message) -> Message {
    tracker
        .store()
        .get(&message.key())
        .expect("get")
        .expect("message exists")
}

#[test]
fn single_patch_is_complete_on_ingest() {
    let (tracker, project, recorder) = setup();
    let head = ingest(
        &tracker,
        &project,
        MessageBuilder::new("quorum@example.com", "[PATCH] quorum: Only compile when supported")
            .patch_body("Quorum needs gnutls."),
    );

    assert!(head.is_series_head());
    assert!(head.is_patch);
    assert!(head.is_complete);
    assert_eq!(head.num_patches, Some(1));
    assert_eq!(recorder.count("SeriesComplete"), 1);
}

#[test]
fn series_completes_once_with_last_patch() {
    let (tracker, project, recorder) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/2] Add feature").body("Cover letter.\n"),
    );
    assert!(!cover.is_complete);

    ingest(
        &tracker,
        &project,
        MessageBuilder::new("p1@example.com", "[PATCH 1/2] Add part one")
            .reply_to("cover@example.com")
            .patch_body("Part one."),
    );
    assert!(!reload(&tracker, &cover).is_complete);
    assert_eq!(recorder.count("SeriesComplete"), 0);

    ingest(
        &tracker,
        &project,
        MessageBuilder::new("p2@example.com", "[PATCH 2/2] Add part two")
            .reply_to("cover@example.com")
            .patch_body("Part two."),
    );
    let cover = reload(&tracker, &cover);
    assert!(cover.is_complete);
    assert_eq!(cover.num_patches, Some(2));
    assert_eq!(recorder.count("SeriesComplete"), 1);

    // Later discussion never reverts completeness.
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("c1@example.com", "Re: [PATCH 2/2] Add part two")
            .from("Reviewer <reviewer@example.com>")
            .reply_to("p2@example.com")
            .date(base_date() + Duration::hours(3))
            .body("Looks fine.\n"),
    );
    let cover = reload(&tracker, &cover);
    assert!(cover.is_complete);
    assert_eq!(cover.last_comment_date, Some(base_date() + Duration::hours(3)));
    assert_eq!(recorder.count("SeriesComplete"), 1);

    let patches: Vec<String> = tracker
        .index()
        .get_patches(&cover.key())
        .unwrap()
        .into_iter()
        .map(|patch| patch.message_id)
        .collect();
    assert_eq!(patches, vec!["p1@example.com", "p2@example.com"]);
}

#[test]
fn first_patch_heads_series_without_cover() {
    let (tracker, project, _) = setup();
    let head = ingest(
        &tracker,
        &project,
        MessageBuilder::new("s1@example.com", "[PATCH 1/2] First").patch_body("One."),
    );
    assert!(head.is_series_head());

    let second = ingest(
        &tracker,
        &project,
        MessageBuilder::new("s2@example.com", "[PATCH 2/2] Second")
            .reply_to("s1@example.com")
            .patch_body("Two."),
    );
    assert!(!second.is_series_head());
    assert!(reload(&tracker, &head).is_complete);
}

#[test]
fn replies_in_a_cycle_have_no_head() {
    let (tracker, project, _) = setup();
    let a = ingest(
        &tracker,
        &project,
        MessageBuilder::new("a@example.com", "Re: loop").reply_to("b@example.com"),
    );
    let b = ingest(
        &tracker,
        &project,
        MessageBuilder::new("b@example.com", "Re: loop").reply_to("a@example.com"),
    );

    let index = tracker.index();
    assert_eq!(index.get_series_head(&reload(&tracker, &a)).unwrap(), None);
    assert_eq!(index.get_series_head(&reload(&tracker, &b)).unwrap(), None);
}

#[test]
fn own_replies_are_not_comments() {
    let (tracker, project, _) = setup();
    let head = ingest(
        &tracker,
        &project,
        MessageBuilder::new("p@example.com", "[PATCH] Fix leak")
            .from("Patch Author <author@example.com>")
            .patch_body("Fix."),
    );
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("ping@example.com", "Re: [PATCH] Fix leak")
            .from("Patch Author <author@example.com>")
            .reply_to("p@example.com")
            .date(base_date() + Duration::days(7))
            .body("Ping.\n"),
    );

    let head = reload(&tracker, &head);
    assert_eq!(head.last_reply_date, Some(base_date() + Duration::days(7)));
    assert_eq!(head.last_comment_date, None);

    ingest(
        &tracker,
        &project,
        MessageBuilder::new("reply@example.com", "Re: [PATCH] Fix leak")
            .from("Reviewer <reviewer@example.com>")
            .reply_to("ping@example.com")
            .date(base_date() + Duration::days(8))
            .body("Looks fine.\n"),
    );
    let head = reload(&tracker, &head);
    assert_eq!(head.last_comment_date, Some(base_date() + Duration::days(8)));
}

#[test]
fn undecodable_bodies_still_ingest() {
    let (tracker, project, recorder) = setup();
    let raw: &[u8] = b"Message-ID: <enc@example.com>\r\n\
From: A <a@example.org>\r\n\
To: devel@lists.example.org\r\n\
Subject: [PATCH] caf\xe9 \xff\r\n\
Content-Type: text/plain; charset=x-bogus\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
!!!not base64 \xe9\xff\r\n";
    let parsed = parse_message(raw).expect("parse");
    let message = tracker.index().ingest(&project, &parsed).expect("ingest");

    assert!(message.body.starts_with("!!!not base64"));
    assert!(!message.body.contains("Message-ID"));
    assert!(message.tags.is_empty());
    assert_eq!(recorder.count("MessageAdded"), 1);
}

#[test]
fn reingest_is_a_no_op() {
    let (tracker, project, recorder) = setup();
    let builder = MessageBuilder::new("dup@example.com", "[PATCH] Fix leak").patch_body("Fix.");

    let first = ingest(&tracker, &project, builder.clone());
    let events = recorder.events().len();
    let second = ingest(&tracker, &project, builder);

    assert_eq!(first, second);
    assert_eq!(recorder.events().len(), events);
    assert_eq!(recorder.count("MessageAdded"), 1);
}

#[test]
fn supersedes_joins_the_older_topic() {
    let (tracker, project, _) = setup();
    let v1 = ingest(
        &tracker,
        &project,
        MessageBuilder::new("v1@example.com", "[PATCH] Old name").patch_body("First try."),
    );
    let v2 = ingest(
        &tracker,
        &project,
        MessageBuilder::new("v2@example.com", "[PATCH v2] New name")
            .date(base_date() + Duration::days(1))
            .patch_body("Supersedes: <v1@example.com>\n\nSecond try."),
    );

    assert!(v1.topic.is_some());
    assert_eq!(v2.topic, v1.topic);

    let v1 = reload(&tracker, &v1);
    assert!(v1.is_obsolete);
    assert_eq!(v1.properties.obsoleted_by(), Some("v2@example.com"));

    let topic = tracker.store().topic(v2.topic.unwrap()).unwrap().unwrap();
    assert_eq!(topic.latest.as_deref(), Some("v2@example.com"));
}

#[test]
fn subtree_delete_drops_orphaned_topic() {
    let (tracker, project, _) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/1] Doomed").body("Cover.\n"),
    );
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("p1@example.com", "[PATCH 1/1] Doomed")
            .reply_to("cover@example.com")
            .patch_body("Patch."),
    );

    let deleted = tracker.index().merge_subthread_delete(&cover.key()).unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(tracker.store().topic(cover.topic.unwrap()).unwrap().is_none());

    let nothing = tracker
        .index()
        .merge_subthread_delete(&MessageKey::new(project.id, "missing@example.com"))
        .unwrap();
    assert!(nothing.is_empty());
}

#[test]
fn mark_merged_emits_once() {
    let (tracker, project, recorder) = setup();
    let head = ingest(
        &tracker,
        &project,
        MessageBuilder::new("m@example.com", "[PATCH] Merge me").patch_body("Patch."),
    );

    let merged = tracker
        .index()
        .mark_merged(project.id, &["<m@example.com>"])
        .unwrap();
    assert_eq!(merged.len(), 1);
    assert!(reload(&tracker, &head).is_merged);

    let again = tracker.index().mark_merged(project.id, &["m@example.com"]).unwrap();
    assert!(again.is_empty());
    assert_eq!(recorder.count("SeriesMerged"), 1);
}

#[test]
fn import_routes_by_list_and_prefix() {
    let (tracker, _, _) = setup();
    tracker
        .create_project(
            Project::new("qemu-block")
                .with_mailing_list(LIST)
                .with_prefix_tags("block"),
        )
        .unwrap();

    let block = MessageBuilder::new("b@example.com", "[PATCH block] Fix io").patch_body("Io.");
    assert_eq!(tracker.import(&block.bytes(), None).unwrap().len(), 2);

    let plain = MessageBuilder::new("q@example.com", "[PATCH] Fix cpu").patch_body("Cpu.");
    let stored = tracker.import(&plain.bytes(), None).unwrap();
    assert_eq!(stored.len(), 1);

    let elsewhere = MessageBuilder::new("x@example.com", "[PATCH] Fix")
        .to("other@lists.example.org")
        .patch_body("Other.");
    assert!(tracker.import(&elsewhere.bytes(), None).unwrap().is_empty());

    assert!(matches!(
        tracker.import(&plain.bytes(), Some("nope")),
        Err(TrackerError::UnknownProject(_))
    ));
}

#[test]
fn mbox_import_completes_out_of_order_series() {
    let (tracker, project, _) = setup();
    let messages = [
        MessageBuilder::new("p2@example.com", "[PATCH 2/2] Two")
            .reply_to("cover@example.com")
            .date(base_date() + Duration::minutes(2))
            .patch_body("Two."),
        MessageBuilder::new("cover@example.com", "[PATCH 0/2] Batch").body("Cover.\n"),
        MessageBuilder::new("p1@example.com", "[PATCH 1/2] One")
            .reply_to("cover@example.com")
            .date(base_date() + Duration::minutes(1))
            .patch_body("One."),
    ];
    let mut mbox = String::new();
    for message in &messages {
        mbox.push_str("From sender@example.com Mon Jun  1 10:00:00 2020\n");
        mbox.push_str(&message.build());
        mbox.push('\n');
    }

    let summary = tracker
        .importer()
        .import_mbox(Cursor::new(mbox.into_bytes()), Some("qemu"))
        .unwrap();
    assert_eq!(summary.parsed, 3);
    assert_eq!(summary.imported, 3);

    let cover = tracker
        .store()
        .get(&MessageKey::new(project.id, "cover@example.com"))
        .unwrap()
        .unwrap();
    assert!(cover.is_complete);
}
