//! End-to-end queue behavior against the scripted extractor.

#![cfg(unix)]

mod common;

use std::time::Duration;

use chrono::Utc;

use common::{HANG_SCRIPT, mock_url, setup_queue, wait_until};
use vidq::config::{MAX_RETENTION_DAYS, MAX_WINDOW_SECS, Preset, UserOptions};
use vidq::domain::{ConditionRule, DownloadRecord, DownloadStatus, ItemOptions};
use vidq::database::models::Partition;
use vidq::queue::{AddRequest, GetMode, MaintenanceReport, QueueEvent};
use vidq::store::{SortOrder, StatusFilter};

fn paused_request() -> AddRequest {
    AddRequest {
        auto_start: false,
        ..AddRequest::default()
    }
}

fn history_status(q: &common::TestQueue, url: &str) -> Option<DownloadStatus> {
    q.container.queue.history().get_by_url(url).map(|r| r.status)
}

fn pending_status(q: &common::TestQueue, url: &str) -> Option<DownloadStatus> {
    q.container.queue.pending().get_by_url(url).map(|r| r.status)
}

#[tokio::test]
async fn test_download_finishes_and_is_archived() {
    let q = setup_queue(|_| {}).await;
    let mut events = q.container.queue.subscribe();
    let url = q.engine.item("abc");

    let response = q.container.queue.add(&url, AddRequest::default()).await;
    assert!(response.is_ok(), "{response:?}");

    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;

    let record = q.container.queue.history().get_by_url(&url).unwrap();
    let expected = q.download_dir().join("abc.mp4");
    assert_eq!(record.filename.as_deref(), expected.to_str());
    assert_eq!(record.progress.percent, Some(100.0));
    assert_eq!(record.archive_id.as_deref(), Some("mock abc"));
    assert!(expected.exists());
    assert!(q.container.queue.pending().is_empty());
    assert!(q.container.archive.is_archived("mock abc").await);

    let mut saw_added = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            QueueEvent::Added { .. } => saw_added = true,
            QueueEvent::Completed { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert!(saw_added && saw_completed);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_second_add_after_finish_is_already_downloaded() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("dup");

    q.container.queue.add(&url, AddRequest::default()).await;
    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;

    let extracts = q.engine.extracts();
    let response = q.container.queue.add(&url, AddRequest::default()).await;
    assert!(!response.is_ok());
    assert!(response.hidden);
    assert!(response.msg.unwrap().contains("already been downloaded"));
    // Refused before extraction.
    assert_eq!(q.engine.extracts(), extracts);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_second_add_while_pending_is_already_queued() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("queued");

    assert!(q.container.queue.add(&url, paused_request()).await.is_ok());
    let response = q.container.queue.add(&url, paused_request()).await;
    assert!(!response.is_ok());
    assert!(response.hidden);
    assert_eq!(
        response.msg.as_deref(),
        Some("Item is already in the download queue.")
    );
    assert_eq!(q.container.queue.pending().len(), 1);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_canonical_id_is_checked_against_archive() {
    let q = setup_queue(|_| {}).await;
    // The URL names an alias; extraction reports the canonical id.
    let url = q
        .engine
        .item_with("alias", |info| info.id = "canonical".to_string());
    q.container.archive.add("mock canonical").await.unwrap();

    let response = q.container.queue.add(&url, AddRequest::default()).await;
    assert!(!response.is_ok());
    assert!(response.hidden);
    assert_eq!(
        response.msg.as_deref(),
        Some("Item has already been downloaded (mock canonical).")
    );
    // The URL id was not archived, so extraction ran.
    assert_eq!(q.engine.extracts(), 1);
    assert!(q.container.queue.pending().is_empty());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_slow_extraction_times_out() {
    let q = setup_queue(|config| config.extract_timeout_secs = 1).await;
    let url = q.engine.item("slow");
    q.engine.delay(&url, Duration::from_secs(5));

    let response = q.container.queue.add(&url, AddRequest::default()).await;
    assert!(!response.is_ok());
    assert!(!response.hidden);
    assert_eq!(
        response.msg.as_deref(),
        Some("Extraction timed out after 1s")
    );
    assert!(q.container.queue.pending().is_empty());
    assert!(q.container.queue.history().is_empty());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_extraction_slot_wait_times_out() {
    let q = setup_queue(|config| {
        config.extract_concurrency = 1;
        config.extract_acquire_timeout_secs = 1;
    })
    .await;
    let slow = q.engine.item("slow");
    q.engine.delay(&slow, Duration::from_secs(3));
    let fast = q.engine.item("fast");

    let queue = q.container.queue.clone();
    let slow_add = tokio::spawn({
        let slow = slow.clone();
        async move { queue.add(&slow, paused_request()).await }
    });
    wait_until("slow extraction to start", || q.engine.extracts() == 1).await;

    let response = q.container.queue.add(&fast, paused_request()).await;
    assert!(!response.is_ok());
    assert_eq!(
        response.msg.as_deref(),
        Some("Too many concurrent extractions, gave up after 1s")
    );
    assert_eq!(q.engine.extracts(), 1);

    // The slot holder still completes.
    assert!(slow_add.await.unwrap().is_ok());
    assert!(q.container.queue.pending().get_by_url(&slow).is_some());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_invalid_and_unsupported_urls() {
    let q = setup_queue(|_| {}).await;

    let response = q.container.queue.add("not a url", AddRequest::default()).await;
    assert!(!response.is_ok());
    assert!(!response.hidden);

    let response = q
        .container
        .queue
        .add(&mock_url("unknown"), AddRequest::default())
        .await;
    assert!(!response.is_ok());
    assert!(response.msg.unwrap().contains("Unsupported URL"));
    assert!(q.container.queue.pending().is_empty());
    assert!(q.container.queue.history().is_empty());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_auto_start_false_is_never_dispatched_until_started() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("manual");

    q.container.queue.add(&url, paused_request()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pending_status(&q, &url), Some(DownloadStatus::Idle));
    assert_eq!(q.engine.downloads(), 0);

    let id = q.container.queue.pending().get_by_url(&url).unwrap().id;
    let results = q.container.queue.start_items(&[id]).await;
    assert!(results[0].is_ok());

    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;
    assert_eq!(q.engine.downloads(), 1);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_pause_items_holds_item_back() {
    let q = setup_queue(|config| config.workers = 1).await;
    q.container.queue.pause();
    let url = q.engine.item("held");
    q.container.queue.add(&url, AddRequest::default()).await;

    let id = q.container.queue.pending().get_by_url(&url).unwrap().id;
    assert!(q.container.queue.pause_items(&[id.clone()]).await[0].is_ok());
    q.container.queue.resume();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(q.engine.downloads(), 0);
    assert!(!q.container.queue.pending().get(&id).unwrap().auto_start);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_global_pause_and_resume() {
    let q = setup_queue(|_| {}).await;
    q.container.queue.pause();
    assert!(q.container.queue.is_paused());

    let url = q.engine.item("later");
    q.container.queue.add(&url, AddRequest::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pending_status(&q, &url), Some(DownloadStatus::Idle));
    assert_eq!(q.engine.downloads(), 0);

    q.container.queue.resume();
    assert!(!q.container.queue.is_paused());
    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_not_started_moves_to_history() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("never");
    q.container.queue.add(&url, paused_request()).await;
    let id = q.container.queue.pending().get_by_url(&url).unwrap().id;

    let results = q.container.queue.cancel(&[id.clone(), "missing".to_string()]).await;
    assert!(results[0].is_ok());
    assert!(!results[1].is_ok());

    assert!(q.container.queue.pending().is_empty());
    assert_eq!(
        q.container.queue.history().get(&id).unwrap().status,
        DownloadStatus::Cancelled
    );
    assert_eq!(q.engine.downloads(), 0);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_download() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("long");
    q.engine.script(&url, HANG_SCRIPT);
    q.container.queue.add(&url, AddRequest::default()).await;

    wait_until("download to start", || {
        pending_status(&q, &url) == Some(DownloadStatus::Preparing)
    })
    .await;
    let id = q.container.queue.pending().get_by_url(&url).unwrap().id;

    let results = q.container.queue.cancel(&[id.clone()]).await;
    assert!(results[0].is_ok());
    assert_eq!(
        q.container.queue.history().get(&id).unwrap().status,
        DownloadStatus::Cancelled
    );
    assert_eq!(q.container.queue.active_count(), 0);
    assert!(!q.container.archive.is_archived("mock long").await);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_failed_download_and_retry() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("broken");
    q.engine.script(&url, "echo 'ERROR: boom' >&2; exit 1");
    q.container.queue.add(&url, AddRequest::default()).await;

    wait_until("download to fail", || {
        history_status(&q, &url) == Some(DownloadStatus::Error)
    })
    .await;
    let record = q.container.queue.history().get_by_url(&url).unwrap();
    assert!(record.error.as_deref().unwrap().contains("boom"));

    // Retrying a finished-with-error item re-extracts and re-runs it.
    let results = q.container.queue.retry(&[record.id.clone()]).await;
    assert!(results[0].is_ok(), "{results:?}");
    assert!(q.container.queue.history().get(&record.id).is_none());
    assert_eq!(q.engine.extracts(), 2);

    wait_until("retry to fail again", || {
        history_status(&q, &url) == Some(DownloadStatus::Error)
    })
    .await;
    assert_eq!(q.engine.downloads(), 2);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_retry_rejects_finished_items() {
    let q = setup_queue(|_| {}).await;
    let mut record = DownloadRecord::new(mock_url("done"), "done", "Done", ItemOptions::default());
    record.status = DownloadStatus::Finished;
    q.container.queue.history().put(record.clone()).await;

    let results = q.container.queue.retry(&[record.id.clone()]).await;
    assert!(!results[0].is_ok());
    assert!(q.container.queue.history().exists(&record.id));

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_clear_removes_file_inside_download_dir() {
    let q = setup_queue(|config| config.remove_files = true).await;
    let url = q.engine.item("clearme");
    q.container.queue.add(&url, AddRequest::default()).await;
    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;

    let record = q.container.queue.history().get_by_url(&url).unwrap();
    let file = q.download_dir().join("clearme.mp4");
    assert!(file.exists());

    let results = q.container.queue.clear(&[record.id.clone()], true).await;
    assert!(results[0].is_ok(), "{results:?}");
    assert!(!file.exists());
    assert!(q.container.queue.history().is_empty());
    assert!(!q.container.archive.is_archived("mock clearme").await);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_clear_keeps_file_when_removal_disabled() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("keepme");
    q.container.queue.add(&url, AddRequest::default()).await;
    wait_until("download to finish", || {
        history_status(&q, &url) == Some(DownloadStatus::Finished)
    })
    .await;

    let record = q.container.queue.history().get_by_url(&url).unwrap();
    let results = q.container.queue.clear(&[record.id], true).await;
    assert!(results[0].is_ok());
    assert_eq!(results[0].msg.as_deref(), Some("File removal is disabled"));
    assert!(q.download_dir().join("keepme.mp4").exists());
    assert!(q.container.queue.history().is_empty());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_playlist_expansion_with_limit() {
    let q = setup_queue(|config| config.playlist_items_limit = 2).await;
    let entries: Vec<String> = ["p1", "p2", "p3"].iter().map(|id| q.engine.item(id)).collect();
    let url = q.engine.playlist("list", "My List", &entries);

    let response = q.container.queue.add(&url, paused_request()).await;
    assert!(response.is_ok(), "{response:?}");
    assert_eq!(response.msg.as_deref(), Some("Added 2 items"));

    let pending = q.container.queue.pending().items();
    assert_eq!(pending.len(), 2);
    for (index, record) in pending.iter().enumerate() {
        let extras = &record.options.extras;
        assert_eq!(extras["playlist_index"], (index + 1).to_string());
        assert_eq!(extras["playlist_count"], "3");
        assert_eq!(extras["playlist_title"], "My List");
        assert_eq!(extras["playlist_id"], "list");
        assert_eq!(extras["playlist_uploader"], "uploader");
    }

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_playlist_entry_failures_are_combined() {
    let q = setup_queue(|_| {}).await;
    let entries = vec![q.engine.item("ok1"), mock_url("gone")];
    let url = q.engine.playlist("mixed", "Mixed", &entries);

    let response = q.container.queue.add(&url, paused_request()).await;
    assert!(!response.is_ok());
    assert!(
        response
            .msg
            .unwrap()
            .contains("1 of 2 playlist entries failed")
    );
    assert_eq!(q.container.queue.pending().len(), 1);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_upcoming_live_is_rescheduled_once_per_pass() {
    let q = setup_queue(|config| config.live_buffer_secs = 0).await;
    let started = Utc::now().timestamp() - 3600;
    let url = q.engine.upcoming("stream", started);

    let response = q.container.queue.add(&url, AddRequest::default()).await;
    assert!(response.is_ok());
    let record = q.container.queue.history().get_by_url(&url).unwrap();
    assert_eq!(record.status, DownloadStatus::NotLive);
    assert!(record.is_live);
    assert_eq!(record.scheduled_live_at.unwrap().timestamp(), started);
    assert!(q.container.queue.pending().is_empty());

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report.rescheduled, 1);
    assert_eq!(report.stale, 0);
    // Still upcoming: one fresh not_live record replaces the old one.
    assert_eq!(q.engine.extracts(), 2);
    assert_eq!(q.container.queue.history().len(), 1);
    assert!(q.container.queue.history().get(&record.id).is_none());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_future_live_is_not_rescheduled() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.upcoming("future", Utc::now().timestamp() + 86_400);
    q.container.queue.add(&url, AddRequest::default()).await;

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report.rescheduled, 0);
    assert_eq!(q.engine.extracts(), 1);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_stalled_download_is_cancelled_by_maintenance() {
    let q = setup_queue(|config| config.stale_after_secs = 0).await;
    let url = q.engine.item("stuck");
    q.engine.script(&url, HANG_SCRIPT);
    q.container.queue.add(&url, AddRequest::default()).await;

    wait_until("download to start", || {
        pending_status(&q, &url) == Some(DownloadStatus::Preparing)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report.stale, 1);
    let record = q.container.queue.history().get_by_url(&url).unwrap();
    assert_eq!(record.status, DownloadStatus::Cancelled);
    assert_eq!(record.msg.as_deref(), Some("Cancelled after no progress"));

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_with_century_windows() {
    let q = setup_queue(|config| {
        config.stale_after_secs = MAX_WINDOW_SECS;
        config.live_buffer_secs = MAX_WINDOW_SECS;
        config.history_retention_days = MAX_RETENTION_DAYS;
    })
    .await;
    let stuck = q.engine.item("stuck");
    q.engine.script(&stuck, HANG_SCRIPT);
    q.container.queue.add(&stuck, AddRequest::default()).await;
    let stream = q.engine.upcoming("stream", Utc::now().timestamp() - 3600);
    q.container.queue.add(&stream, AddRequest::default()).await;

    wait_until("download to start", || {
        pending_status(&q, &stuck) == Some(DownloadStatus::Preparing)
    })
    .await;

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report, MaintenanceReport::default());
    assert!(pending_status(&q, &stuck).is_some());
    assert_eq!(history_status(&q, &stream), Some(DownloadStatus::NotLive));

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_premiere_length_delays_rescheduling() {
    let q = setup_queue(|config| config.live_buffer_secs = 0).await;
    let now = Utc::now().timestamp();
    // Started an hour ago but runs for two: not due yet.
    let running = q.engine.premiere("running", now - 3600, 7200.0);
    // Started three hours ago and ran for one: due.
    let ended = q.engine.premiere("ended", now - 3 * 3600, 3600.0);
    // A length past the end of the calendar is never due.
    let endless = q.engine.premiere("endless", now - 3600, 1e300);
    for url in [&running, &ended, &endless] {
        assert!(q.container.queue.add(url, AddRequest::default()).await.is_ok());
    }
    let record = q.container.queue.history().get_by_url(&running).unwrap();
    assert!(record.is_premiere);
    assert_eq!(record.duration, Some(7200.0));

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report.rescheduled, 1);
    // Only the ended premiere was extracted again.
    assert_eq!(q.engine.extracts(), 4);
    assert_eq!(history_status(&q, &running), Some(DownloadStatus::NotLive));

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_retention_purges_old_finished_history() {
    let q = setup_queue(|config| config.history_retention_days = 1).await;
    let mut events = q.container.queue.subscribe();

    let mut old = DownloadRecord::new(mock_url("old"), "old", "Old", ItemOptions::default());
    old.status = DownloadStatus::Finished;
    old.created_at = Utc::now() - chrono::Duration::days(3);
    let mut old_error = DownloadRecord::new(mock_url("bad"), "bad", "Bad", ItemOptions::default());
    old_error.fail("boom");
    old_error.created_at = old.created_at;
    let mut fresh = DownloadRecord::new(mock_url("new"), "new", "New", ItemOptions::default());
    fresh.status = DownloadStatus::Finished;
    for record in [&old, &old_error, &fresh] {
        q.container.queue.history().put(record.clone()).await;
    }

    let report = q.container.queue.run_maintenance().await;
    assert_eq!(report.purged, 1);
    assert!(q.container.queue.history().get(&old.id).is_none());
    assert!(q.container.queue.history().get(&old_error.id).is_some());
    assert!(q.container.queue.history().get(&fresh.id).is_some());

    let removed = loop {
        match events.recv().await.unwrap() {
            QueueEvent::Removed { partition, id } => break (partition, id),
            _ => continue,
        }
    };
    assert_eq!(removed, (Partition::History, old.id.clone()));

    let page = q
        .container
        .queue
        .paginate(1, 10, SortOrder::Asc, None)
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_live_item_runs_while_workers_are_busy() {
    let q = setup_queue(|_| {}).await;
    let busy = q.engine.item("busy");
    q.engine.script(&busy, HANG_SCRIPT);
    q.container.queue.add(&busy, AddRequest::default()).await;
    wait_until("persistent worker to be busy", || {
        pending_status(&q, &busy) == Some(DownloadStatus::Preparing)
    })
    .await;
    assert_eq!(q.container.queue.pool().available_workers(), 0);

    let regular = q.engine.item("regular");
    q.container.queue.add(&regular, AddRequest::default()).await;
    let live = q.engine.live("live");
    q.container.queue.add(&live, AddRequest::default()).await;
    assert!(q.container.queue.pending().get_by_url(&live).unwrap().is_live);

    wait_until("live download to finish", || {
        history_status(&q, &live) == Some(DownloadStatus::Finished)
    })
    .await;
    // The regular item still waits for the persistent worker.
    assert_eq!(pending_status(&q, &regular), Some(DownloadStatus::Idle));
    assert!(pending_status(&q, &busy).is_some_and(|s| s.is_active()));
    wait_until("temporary worker to exit", || {
        q.container
            .queue
            .pool()
            .status()
            .iter()
            .all(|w| !w.temporary)
    })
    .await;

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_condition_rules() {
    let q = setup_queue(|_| {}).await;
    q.container
        .conditions
        .push(ConditionRule::new("short", "duration < 60").skipping())
        .await;
    q.container
        .conditions
        .push(ConditionRule::new("long", "duration > 3600").with_cli_args(["-f", "worst"]))
        .await;

    let short = q.engine.duration("short", 30.0);
    let response = q.container.queue.add(&short, paused_request()).await;
    assert!(response.is_ok());
    assert_eq!(history_status(&q, &short), Some(DownloadStatus::Skip));

    let long = q.engine.duration("long", 7200.0);
    let response = q.container.queue.add(&long, paused_request()).await;
    assert!(response.is_ok(), "{response:?}");
    let record = q.container.queue.pending().get_by_url(&long).unwrap();
    assert!(record.options.requeued);
    assert_eq!(record.options.cli_args, vec!["-f", "worst"]);
    // Extracted once for admission and once for the requeue.
    assert_eq!(q.engine.extracts(), 3);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_preset_options_are_applied() {
    let q = setup_queue(|_| {}).await;
    q.container
        .presets
        .insert(Preset::new("music").with_folder("audio").with_cli_args(["-x"]))
        .await;
    let url = q.engine.item("song");

    let request = AddRequest {
        options: UserOptions {
            preset: Some("music".to_string()),
            ..Default::default()
        },
        auto_start: false,
    };
    assert!(q.container.queue.add(&url, request).await.is_ok());
    let record = q.container.queue.pending().get_by_url(&url).unwrap();
    assert_eq!(record.options.preset.as_deref(), Some("music"));
    assert_eq!(record.folder.as_deref(), Some("audio"));
    assert_eq!(record.options.cli_args, vec!["-x"]);

    let request = AddRequest {
        options: UserOptions {
            preset: Some("missing".to_string()),
            ..Default::default()
        },
        auto_start: false,
    };
    let response = q.container.queue.add(&q.engine.item("other"), request).await;
    assert!(!response.is_ok());

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_history_pagination() {
    let q = setup_queue(|_| {}).await;
    for i in 0..25 {
        let mut record = DownloadRecord::new(
            mock_url(&format!("h{i}")),
            format!("h{i}"),
            format!("History {i}"),
            ItemOptions::default(),
        );
        record.status = if i % 5 == 0 {
            DownloadStatus::Error
        } else {
            DownloadStatus::Finished
        };
        q.container.queue.history().put(record).await;
    }

    let page = q
        .container
        .queue
        .paginate(1, 10, SortOrder::Asc, None)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.total, 25);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.items[0].title, "History 0");

    let page = q
        .container
        .queue
        .paginate(99, 10, SortOrder::Asc, None)
        .await
        .unwrap();
    assert_eq!(page.page, 3);
    assert_eq!(page.items.len(), 5);

    let errors = q
        .container
        .queue
        .paginate(
            1,
            10,
            SortOrder::Desc,
            Some(StatusFilter::parse("error").unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(errors.total, 5);
    assert_eq!(errors.items[0].title, "History 20");

    let snapshot = q.container.queue.get(GetMode::Pending);
    assert!(snapshot.history.is_empty());
    assert_eq!(q.container.queue.get(GetMode::History).history.len(), 25);

    q.container.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_running_items_pending() {
    let q = setup_queue(|_| {}).await;
    let url = q.engine.item("interrupted");
    q.engine.script(&url, HANG_SCRIPT);
    q.container.queue.add(&url, AddRequest::default()).await;

    wait_until("download to start", || {
        pending_status(&q, &url) == Some(DownloadStatus::Preparing)
    })
    .await;

    q.container.shutdown().await;
    assert_eq!(pending_status(&q, &url), Some(DownloadStatus::Idle));
    assert!(q.container.queue.history().is_empty());
}
