use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncError;
use crate::store::SyncStore;

/// What the view should do with its scroll position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollAction {
    None,
    ScrollToBottom,
    ScrollTo { message_id: String, highlight: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The target is cached at this index of the channel feed.
    Found { index: usize },
    /// The page budget ran out, or the feed ended, before the target showed up.
    Exhausted { pages_loaded: u32 },
    Cancelled,
}

/// Scroll state for one channel view.
///
/// The view reports user scrolling and content growth; the policy answers
/// with what to do. While a seek is in flight nothing snaps to the bottom.
#[derive(Debug, Clone)]
pub struct ScrollPolicy {
    pinned_to_bottom: bool,
    seeking: Option<String>,
    highlight: Option<String>,
}

impl ScrollPolicy {
    pub fn new() -> Self {
        Self {
            pinned_to_bottom: true,
            seeking: None,
            highlight: None,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_to_bottom
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.is_some()
    }

    pub fn highlighted(&self) -> Option<&str> {
        self.highlight.as_deref()
    }

    pub fn content_grew(&self) -> ScrollAction {
        if self.pinned_to_bottom && self.seeking.is_none() {
            ScrollAction::ScrollToBottom
        } else {
            ScrollAction::None
        }
    }

    pub fn user_scrolled(&mut self, at_bottom: bool) {
        self.pinned_to_bottom = at_bottom;
    }

    pub fn begin_seek(&mut self, message_id: impl Into<String>) {
        self.seeking = Some(message_id.into());
        self.pinned_to_bottom = false;
    }

    pub fn finish_seek(&mut self, outcome: &SeekOutcome) -> ScrollAction {
        let target = self.seeking.take();
        match (target, outcome) {
            (Some(message_id), SeekOutcome::Found { .. }) => {
                self.highlight = Some(message_id.clone());
                ScrollAction::ScrollTo {
                    message_id,
                    highlight: true,
                }
            }
            _ => ScrollAction::None,
        }
    }

    pub fn cancel_seek(&mut self) {
        self.seeking = None;
    }

    pub fn clear_highlight(&mut self) {
        self.highlight = None;
    }
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore {
    /// Page a channel backward until `target_id` is cached, the page budget
    /// runs out, or `cancel` fires.
    pub async fn seek(
        &self,
        channel_id: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SeekOutcome, SyncError> {
        let budget = self.config().seek_attempts;
        let mut pages_loaded = 0;
        loop {
            if let Some(index) = self.channel_position(channel_id, target_id) {
                debug!("seek found {} after {} pages", target_id, pages_loaded);
                return Ok(SeekOutcome::Found { index });
            }
            if pages_loaded >= budget {
                return Ok(SeekOutcome::Exhausted { pages_loaded });
            }
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SeekOutcome::Cancelled),
                fetched = self.load_older(channel_id) => fetched?,
            };
            if !fetched {
                return Ok(SeekOutcome::Exhausted { pages_loaded });
            }
            pages_loaded += 1;
        }
    }
}
