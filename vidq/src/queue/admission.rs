//! Admission: dedup, extraction, playlist expansion, live detection and condition rules.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use super::{AddRequest, AddResponse, DownloadQueue, QueueEvent};
use crate::database::models::Partition;
use crate::domain::condition::evaluate_rules;
use crate::domain::{ConditionAction, DownloadRecord, DownloadStatus, ItemOptions};
use crate::downloader::{Extraction, LiveStatus, MediaInfo, PlaylistInfo};
use crate::{Error, Result};

const MSG_ALREADY_QUEUED: &str = "Item is already in the download queue.";

/// State threaded through one recursive admission.
#[derive(Debug)]
pub struct AdmissionContext {
    visited: HashSet<String>,
    depth: usize,
    max_depth: usize,
}

impl AdmissionContext {
    pub fn new(max_depth: usize) -> Self {
        Self {
            visited: HashSet::new(),
            depth: 0,
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn enter(&mut self, url: &str) -> Result<()> {
        if self.depth >= self.max_depth {
            return Err(Error::admission(format!(
                "Maximum admission depth ({}) exceeded at {url}",
                self.max_depth
            )));
        }
        if !self.visited.insert(url.to_string()) {
            return Err(Error::duplicate(format!("{url} was already visited")));
        }
        self.depth += 1;
        Ok(())
    }

    fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Allow `url` to be admitted again in this call, for requeues with rewritten options.
    fn forget(&mut self, url: &str) {
        self.visited.remove(url);
    }
}

/// How an extracted item relates to live streaming.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LiveState {
    /// Regular video.
    NotLive,
    /// Downloadable live stream.
    Live,
    /// Stream or premiere that cannot be downloaded yet.
    Waiting { scheduled: DateTime<Utc> },
}

fn classify_live(info: &MediaInfo, now: DateTime<Utc>) -> LiveState {
    let scheduled = info
        .release_timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or(now);
    match info.live_status {
        Some(LiveStatus::IsUpcoming) => LiveState::Waiting { scheduled },
        Some(LiveStatus::IsLive) => LiveState::Live,
        Some(LiveStatus::PostLive) if !info.has_formats => LiveState::Waiting { scheduled },
        _ => LiveState::NotLive,
    }
}

fn validate_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::admission("URL must not be empty"));
    }
    url::Url::parse(url).map_err(|e| Error::admission(format!("Invalid URL {url:?}: {e}")))?;
    Ok(url.to_string())
}

impl DownloadQueue {
    /// Admit a URL. Errors are returned in the response and never stored.
    pub async fn add(self: &Arc<Self>, url: &str, request: AddRequest) -> AddResponse {
        match self.try_add(url, request).await {
            Ok(records) => AddResponse::ok(match records.as_slice() {
                [record] => match record.status {
                    DownloadStatus::NotLive => format!("Scheduled {}", record.title),
                    DownloadStatus::Skip => format!("Skipped {}", record.title),
                    _ => format!("Added {}", record.title),
                },
                records => format!("Added {} items", records.len()),
            }),
            Err(e) => {
                if e.is_hidden() {
                    debug!(url, error = %e, "Admission refused");
                } else {
                    warn!(url, error = %e, "Admission failed");
                }
                AddResponse::error(&e)
            }
        }
    }

    async fn try_add(self: &Arc<Self>, url: &str, request: AddRequest) -> Result<Vec<DownloadRecord>> {
        let options = self
            .options
            .build(self.presets.as_ref(), &request.options)
            .await?;
        let mut ctx = AdmissionContext::new(self.config.max_admission_depth);
        self.admit(url, options, request.auto_start, &mut ctx).await
    }

    /// Admit `url` with resolved options. Returns every record created.
    pub(super) fn admit<'a>(
        self: &'a Arc<Self>,
        url: &'a str,
        options: ItemOptions,
        auto_start: bool,
        ctx: &'a mut AdmissionContext,
    ) -> BoxFuture<'a, Result<Vec<DownloadRecord>>> {
        Box::pin(async move {
            let url = validate_url(url)?;
            ctx.enter(&url)?;
            let result = self.admit_url(&url, options, auto_start, ctx).await;
            ctx.exit();
            result
        })
    }

    async fn admit_url(
        self: &Arc<Self>,
        url: &str,
        options: ItemOptions,
        auto_start: bool,
        ctx: &mut AdmissionContext,
    ) -> Result<Vec<DownloadRecord>> {
        let pre_id = self.engine.archive_id(url);
        self.check_duplicates(url, pre_id.as_deref()).await?;

        match self.extract(url, &options).await? {
            Extraction::Playlist(playlist) => {
                self.admit_playlist(playlist, options, auto_start, ctx).await
            }
            Extraction::Item(info) => {
                self.admit_item(url, *info, pre_id, options, auto_start, ctx)
                    .await
            }
        }
    }

    /// Reject URLs and archive ids that are already downloaded or queued.
    async fn check_duplicates(&self, url: &str, archive_id: Option<&str>) -> Result<()> {
        if let Some(id) = archive_id {
            if self.archive.is_archived(id).await
                || self
                    .history
                    .find(|r| {
                        r.status == DownloadStatus::Finished && r.archive_id.as_deref() == Some(id)
                    })
                    .is_some()
            {
                return Err(Error::duplicate(format!(
                    "Item has already been downloaded ({id})."
                )));
            }
            if self
                .pending
                .find(|r| r.archive_id.as_deref() == Some(id))
                .is_some()
            {
                return Err(Error::duplicate(MSG_ALREADY_QUEUED));
            }
        }
        if self.pending.get_by_url(url).is_some() {
            return Err(Error::duplicate(MSG_ALREADY_QUEUED));
        }
        Ok(())
    }

    async fn extract(&self, url: &str, options: &ItemOptions) -> Result<Extraction> {
        let acquire_timeout = self.config.extract_acquire_timeout;
        let _permit = tokio::time::timeout(acquire_timeout, self.extract_slots.acquire())
            .await
            .map_err(|_| Error::ConcurrencyTimeout(acquire_timeout))?
            .map_err(|_| Error::Other("Extraction slots closed".to_string()))?;

        let timeout = self.config.extract_timeout;
        debug!(url, engine = self.engine.name(), "Extracting");
        tokio::time::timeout(timeout, self.engine.extract(url, options))
            .await
            .map_err(|_| Error::ExtractionTimeout(timeout))?
    }

    async fn admit_playlist(
        self: &Arc<Self>,
        playlist: PlaylistInfo,
        options: ItemOptions,
        auto_start: bool,
        ctx: &mut AdmissionContext,
    ) -> Result<Vec<DownloadRecord>> {
        let count = playlist.entries.len();
        let limit = match self.config.playlist_items_limit {
            0 => count,
            n => n.min(count),
        };
        let title = playlist
            .title
            .clone()
            .or_else(|| playlist.id.clone())
            .unwrap_or_default();
        info!(playlist = %title, entries = count, limit, "Expanding playlist");

        let mut admitted = Vec::new();
        let mut failures = Vec::new();
        for (index, entry) in playlist.entries.iter().take(limit).enumerate() {
            let entry_options = options
                .clone()
                .with_extra("playlist", title.clone())
                .with_extra("playlist_id", playlist.id.clone().unwrap_or_default())
                .with_extra("playlist_title", playlist.title.clone().unwrap_or_default())
                .with_extra(
                    "playlist_uploader",
                    playlist.uploader.clone().unwrap_or_default(),
                )
                .with_extra("playlist_index", (index + 1).to_string())
                .with_extra("playlist_count", count.to_string());

            match self.admit(&entry.url, entry_options, auto_start, ctx).await {
                Ok(records) => admitted.extend(records),
                Err(e) if e.is_hidden() => {
                    debug!(url = %entry.url, error = %e, "Skipping playlist entry");
                }
                Err(e) => {
                    let name = entry.title.as_deref().unwrap_or(&entry.url);
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::extraction(format!(
                "{} of {} playlist entries failed: {}",
                failures.len(),
                limit,
                failures.join("; ")
            )));
        }
        if admitted.is_empty() && limit > 0 {
            return Err(Error::duplicate("All playlist entries are already known."));
        }
        Ok(admitted)
    }

    async fn admit_item(
        self: &Arc<Self>,
        url: &str,
        info: MediaInfo,
        pre_id: Option<String>,
        options: ItemOptions,
        auto_start: bool,
        ctx: &mut AdmissionContext,
    ) -> Result<Vec<DownloadRecord>> {
        // The post-extraction id is checked first so it is the one reported.
        let post_id = info.archive_id();
        if let Some(id) = post_id.as_deref() {
            self.check_duplicates(&info.url, Some(id)).await?;
        }
        if pre_id != post_id {
            self.check_duplicates(url, pre_id.as_deref()).await?;
        }

        let now = Utc::now();
        let live = classify_live(&info, now);

        let mut record = DownloadRecord::new(url, &info.id, &info.title, options.clone())
            .with_auto_start(auto_start)
            .with_archive_id(post_id.or(pre_id))
            .with_extractor(info.extractor_key.clone());
        record.is_live = live != LiveState::NotLive;
        record.is_premiere = info.is_premiere();
        record.duration = info.duration;

        if let LiveState::Waiting { scheduled } = live {
            record.status = DownloadStatus::NotLive;
            record.scheduled_live_at = Some(scheduled);
            record.msg = Some(format!("Stream starts at {}", scheduled.to_rfc3339()));
            info!(title = %record.title, %scheduled, "Live stream not started, scheduling");
            return Ok(vec![self.store_history(record).await]);
        }

        let rules = self.conditions.rules().await;
        match evaluate_rules(&rules, &info.raw) {
            Some(ConditionAction::Skip { rule }) => {
                record.status = DownloadStatus::Skip;
                record.msg = Some(format!("Skipped by condition rule {rule}"));
                info!(title = %record.title, rule = %rule, "Skipping item");
                return Ok(vec![self.store_history(record).await]);
            }
            Some(ConditionAction::Requeue {
                rule,
                cli_args,
                preset,
            }) if !options.requeued => {
                info!(title = %record.title, rule = %rule, "Requeueing item with rewritten options");
                let base = match preset.as_deref() {
                    Some(name) => {
                        self.options
                            .rebase(self.presets.as_ref(), &options, name)
                            .await?
                    }
                    None => options,
                };
                let next = base.requeue_with(&cli_args, None);
                ctx.forget(url);
                return self.admit(url, next, auto_start, ctx).await;
            }
            _ => {}
        }

        self.pending.put(record.clone()).await;
        info!(id = %record.id, title = %record.title, live = record.is_live, "Item queued");
        self.events.publish(QueueEvent::Added {
            partition: Partition::Pending,
            record: Box::new(record.clone()),
        });
        self.dispatch.notify_one();
        Ok(vec![record])
    }

    async fn store_history(&self, record: DownloadRecord) -> DownloadRecord {
        self.history.put(record.clone()).await;
        self.events.publish(QueueEvent::Added {
            partition: Partition::History,
            record: Box::new(record.clone()),
        });
        record
    }
}
