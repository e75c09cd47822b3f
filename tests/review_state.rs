use chrono::Duration;
use series_tracker::models::Address;
use series_tracker::sync::parser::parse_message;
use series_tracker::test_support::{MessageBuilder, RecordingObserver, base_date};
use series_tracker::{Message, Project, Store, Tracker, TrackerConfig, TrackerError};
use std::sync::Arc;

fn setup() -> (Tracker, Project, Arc<RecordingObserver>) {
    let tracker = Tracker::in_memory(TrackerConfig::default()).expect("tracker");
    let project = tracker
        .create_project(Project::new("qemu").with_mailing_list("devel@lists.example.org"))
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
    tracker.store().get(&message.key()).unwrap().unwrap()
}

fn review_reply(id: &str, parent: &str, reviewer: &str) -> MessageBuilder {
    MessageBuilder::new(id, "Re: [PATCH] review")
        .from(reviewer)
        .reply_to(parent)
        .date(base_date() + Duration::hours(1))
        .body(&format!("> quoted patch\n\nReviewed-by: {reviewer}\n"))
}

#[test]
fn update_tags_reports_change_once() {
    let (tracker, project, _) = setup();
    let patch = ingest(
        &tracker,
        &project,
        MessageBuilder::new("p@example.com", "[PATCH] Fix leak").patch_body("Fix."),
    );
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("r@example.com", "Re: [PATCH] Fix leak")
            .reply_to("p@example.com")
            .body("Tested-by: Tester <tester@example.com>\n"),
    );
    tracker
        .store()
        .update(&patch.key(), &mut |message| message.tags.clear())
        .unwrap();

    let review = tracker.review();
    assert!(review.update_tags(&patch.key()).unwrap());
    let after_first = reload(&tracker, &patch).tags;
    assert!(!review.update_tags(&patch.key()).unwrap());
    assert_eq!(reload(&tracker, &patch).tags, after_first);
    assert_eq!(after_first, vec!["Tested-by: Tester <tester@example.com>"]);
}

#[test]
fn every_patch_reviewed_marks_series() {
    let (tracker, project, recorder) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/2] Series").body("Cover.\n"),
    );
    for n in 1..=2 {
        ingest(
            &tracker,
            &project,
            MessageBuilder::new(&format!("p{n}@example.com"), &format!("[PATCH {n}/2] Part {n}"))
                .reply_to("cover@example.com")
                .patch_body("Part."),
        );
    }

    ingest(
        &tracker,
        &project,
        review_reply("r1@example.com", "p1@example.com", "Eric Blake <eblake@redhat.com>"),
    );
    assert!(!reload(&tracker, &cover).is_reviewed);

    ingest(
        &tracker,
        &project,
        review_reply("r2@example.com", "p2@example.com", "Max Reitz <mreitz@redhat.com>"),
    );
    let cover = reload(&tracker, &cover);
    assert!(cover.is_reviewed);
    assert!(cover.properties.reviewed());
    assert_eq!(
        cover.properties.reviewers(),
        vec![
            Address::new("Eric Blake", "eblake@redhat.com"),
            Address::new("Max Reitz", "mreitz@redhat.com"),
        ]
    );
    assert!(recorder.count("TagsUpdate") >= 2);
}

#[test]
fn resent_patch_does_not_cover_a_missing_review() {
    let (tracker, project, _) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/2] Series").body("Cover.\n"),
    );
    for (id, subject) in [
        ("p1@example.com", "[PATCH 1/2] Part one"),
        ("p1b@example.com", "[PATCH 1/2] Part one"),
        ("p2@example.com", "[PATCH 2/2] Part two"),
    ] {
        ingest(
            &tracker,
            &project,
            MessageBuilder::new(id, subject)
                .reply_to("cover@example.com")
                .patch_body("Part."),
        );
    }
    ingest(
        &tracker,
        &project,
        review_reply("r1@example.com", "p1@example.com", "Eric Blake <eblake@redhat.com>"),
    );
    ingest(
        &tracker,
        &project,
        review_reply("r1b@example.com", "p1b@example.com", "Max Reitz <mreitz@redhat.com>"),
    );

    let summary = tracker.review().aggregate_review_state(&cover.key()).unwrap();
    assert!(!summary.reviewed);
    assert_eq!(summary.reviewed_patches, 1);
    assert_eq!(summary.expected_patches, 2);
    assert!(!reload(&tracker, &cover).is_reviewed);

    ingest(
        &tracker,
        &project,
        review_reply("r2@example.com", "p2@example.com", "Eric Blake <eblake@redhat.com>"),
    );
    assert!(reload(&tracker, &cover).is_reviewed);
}

#[test]
fn cover_letter_review_covers_the_series() {
    let (tracker, project, _) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/3] Series").body("Cover.\n"),
    );
    ingest(
        &tracker,
        &project,
        review_reply("r@example.com", "cover@example.com", "Eric Blake <eblake@redhat.com>"),
    );

    let summary = tracker.review().aggregate_review_state(&cover.key()).unwrap();
    assert!(summary.reviewed);
    assert_eq!(summary.reviewed_patches, 0);
    assert_eq!(summary.expected_patches, 3);
}

#[test]
fn removing_review_tags_clears_reviewed() {
    let (tracker, project, _) = setup();
    let patch = ingest(
        &tracker,
        &project,
        MessageBuilder::new("p@example.com", "[PATCH] Fix leak").patch_body("Fix."),
    );
    let review = ingest(
        &tracker,
        &project,
        review_reply("r@example.com", "p@example.com", "Eric Blake <eblake@redhat.com>"),
    );
    assert!(reload(&tracker, &patch).is_reviewed);

    tracker.index().merge_subthread_delete(&review.key()).unwrap();
    assert!(tracker.review().refresh_series(&patch.key()).unwrap());

    let patch = reload(&tracker, &patch);
    assert!(!patch.is_reviewed);
    assert!(patch.tags.is_empty());
    assert!(patch.properties.reviewers().is_empty());
}

#[test]
fn patch_replies_do_not_leak_tags() {
    let (tracker, project, _) = setup();
    let cover = ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/1] Series").body("Cover.\n"),
    );
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("p1@example.com", "[PATCH 1/1] Part")
            .reply_to("cover@example.com")
            .patch_body("Part.\n\nReviewed-by: Eric Blake <eblake@redhat.com>"),
    );

    assert!(reload(&tracker, &cover).tags.is_empty());
    let collected = tracker.review().collect_tags(&reload(&tracker, &cover)).unwrap();
    assert!(collected.is_empty());
}

#[test]
fn newer_revision_obsoletes_older() {
    let (tracker, project, _) = setup();
    let v1 = ingest(
        &tracker,
        &project,
        MessageBuilder::new("v1@example.com", "[PATCH] Fix leak").patch_body("v1."),
    );
    let v2 = ingest(
        &tracker,
        &project,
        MessageBuilder::new("v2@example.com", "[PATCH v2] Fix leak")
            .date(base_date() + Duration::days(2))
            .patch_body("v2."),
    );
    let v3 = ingest(
        &tracker,
        &project,
        MessageBuilder::new("v3@example.com", "[PATCH v3] Fix leak")
            .date(base_date() + Duration::days(4))
            .patch_body("v3."),
    );

    assert_eq!(v1.topic, v3.topic);
    assert_eq!(
        reload(&tracker, &v1).properties.obsoleted_by(),
        Some("v3@example.com")
    );
    assert_eq!(
        reload(&tracker, &v2).properties.obsoleted_by(),
        Some("v3@example.com")
    );
    assert!(!reload(&tracker, &v3).is_obsolete);

    // Re-running changes nothing.
    assert!(tracker.review().detect_obsolescence(&v3.key()).unwrap().is_empty());
}

#[test]
fn based_on_resolves_series_head() {
    let (tracker, project, _) = setup();
    let base = ingest(
        &tracker,
        &project,
        MessageBuilder::new("base@example.com", "[PATCH] Base work").patch_body("Base."),
    );
    let dependent = ingest(
        &tracker,
        &project,
        MessageBuilder::new("dep@example.com", "[PATCH] Dependent work")
            .patch_body("Based-on: <base@example.com>"),
    );

    let found = tracker.review().based_on(&dependent).unwrap();
    assert_eq!(found.map(|m| m.message_id), Some(base.message_id));
}

#[test]
fn aggregate_rejects_non_heads() {
    let (tracker, project, _) = setup();
    ingest(
        &tracker,
        &project,
        MessageBuilder::new("cover@example.com", "[PATCH 0/1] Series").body("Cover.\n"),
    );
    let patch = ingest(
        &tracker,
        &project,
        MessageBuilder::new("p1@example.com", "[PATCH 1/1] Part")
            .reply_to("cover@example.com")
            .patch_body("Part."),
    );
    assert!(matches!(
        tracker.review().aggregate_review_state(&patch.key()),
        Err(TrackerError::NotSeriesHead(_))
    ));
}
