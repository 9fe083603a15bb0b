//! Sequential download orchestration.
//!
//! A [`DownloadSession`] walks an ordered list of items one at a time. The
//! session never performs I/O itself: every call returns the [`Step`] the
//! caller has to carry out next, so only the UI thread ever mutates it.

use std::path::PathBuf;

use crate::{
    error::Error,
    model::{DownloadRequest, PlaylistEntry, Quality},
};

/// What happens when one item of a session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and move on to the next item (batches)
    ContinuePastFailure,
    /// End the session and surface the error (single downloads)
    FailFast,
}

/// One unit of work in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionItem {
    pub title: String,
    pub url: String,
    /// Position in the playlist, `None` for single downloads
    pub playlist_index: Option<usize>,
}

impl From<&PlaylistEntry> for SessionItem {
    fn from(entry: &PlaylistEntry) -> Self {
        Self {
            title: entry.title.clone(),
            url: entry.url.clone(),
            playlist_index: Some(entry.index),
        }
    }
}

/// An item that failed during a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedItem {
    pub title: String,
    pub playlist_index: Option<usize>,
    pub error: Error,
}

/// Outcome counts once a session is exhausted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
}

/// The next thing the caller must do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Start downloading `item`; `position` is 0-based within the session
    Start {
        position: usize,
        total: usize,
        item: SessionItem,
    },
    /// A failed item was skipped; the following step is returned separately
    Skipped(FailedItem),
    /// Every item was attempted
    Completed(BatchSummary),
    /// A fail-fast item failed
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Cancelled,
    Finished,
}

#[derive(Debug)]
pub struct DownloadSession {
    items: Vec<SessionItem>,
    current_index: usize,
    quality: Quality,
    destination: PathBuf,
    policy: FailurePolicy,
    succeeded: usize,
    failed: Vec<FailedItem>,
    state: State,
}

impl DownloadSession {
    /// A user-confirmed subset of playlist entries
    pub fn batch(entries: &[PlaylistEntry], quality: Quality, destination: PathBuf) -> Self {
        Self::new(
            entries.iter().map(SessionItem::from).collect(),
            quality,
            destination,
            FailurePolicy::ContinuePastFailure,
        )
    }

    /// A single URL, treated as a batch of one that fails fast
    pub fn single(request: DownloadRequest) -> Self {
        let item = SessionItem {
            title: request.url.clone(),
            url: request.url,
            playlist_index: None,
        };
        Self::new(
            vec![item],
            request.quality,
            request.destination,
            FailurePolicy::FailFast,
        )
    }

    fn new(
        items: Vec<SessionItem>,
        quality: Quality,
        destination: PathBuf,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            items,
            current_index: 0,
            quality,
            destination,
            policy,
            succeeded: 0,
            failed: Vec::new(),
            state: State::Running,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn destination(&self) -> &PathBuf {
        &self.destination
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn current_item(&self) -> Option<&SessionItem> {
        self.items.get(self.current_index)
    }

    /// Returns the item to start, or the summary once every item was tried.
    /// `None` when the session is no longer running.
    pub fn advance(&mut self) -> Option<Step> {
        if !self.is_running() {
            return None;
        }
        match self.items.get(self.current_index) {
            Some(item) => Some(Step::Start {
                position: self.current_index,
                total: self.items.len(),
                item: item.clone(),
            }),
            None => {
                self.state = State::Finished;
                Some(Step::Completed(BatchSummary {
                    total: self.items.len(),
                    succeeded: self.succeeded,
                    failed: self.failed.clone(),
                }))
            }
        }
    }

    /// The current item finished; moves on to the next one.
    pub fn item_succeeded(&mut self) -> Option<Step> {
        if !self.is_running() || self.current_index >= self.items.len() {
            return None;
        }
        self.succeeded += 1;
        self.current_index += 1;
        self.advance()
    }

    /// The current item failed. Under [`FailurePolicy::ContinuePastFailure`]
    /// the failure is recorded and the returned steps are the skip followed by
    /// the next step; under [`FailurePolicy::FailFast`] the session ends.
    pub fn item_failed(&mut self, error: Error) -> Vec<Step> {
        if !self.is_running() {
            return Vec::new();
        }
        let Some(item) = self.items.get(self.current_index) else {
            return Vec::new();
        };
        let failed = FailedItem {
            title: item.title.clone(),
            playlist_index: item.playlist_index,
            error: error.clone(),
        };
        self.failed.push(failed.clone());
        self.current_index += 1;

        match self.policy {
            FailurePolicy::FailFast => {
                self.state = State::Finished;
                vec![Step::Failed(error)]
            }
            FailurePolicy::ContinuePastFailure => {
                let mut steps = vec![Step::Skipped(failed)];
                steps.extend(self.advance());
                steps
            }
        }
    }

    /// Stops the session where it is. The current index is left untouched
    /// and later completions are ignored.
    pub fn cancel(&mut self) {
        if self.state == State::Running {
            self.state = State::Cancelled;
        }
    }
}
