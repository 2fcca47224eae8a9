//! Lazy depth-first traversal of a remote tree.
//!
//! The walker keeps an explicit stack with one frame per directory being
//! listed. A frame holds the unconsumed entries of its current page. When a
//! directory entry is popped, a child frame is pushed and fully drained before
//! the parent continues, so a directory's descendants are yielded before the
//! parent's remaining entries and pages. Pages are fetched one at a time and
//! only when the consumer asks for the next item.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use tracing::{debug, warn};

use super::{RemoteEntry, RemoteIndex, RetryExecutor};
use crate::Error;

/// Item produced by [`RemoteWalker::walk`].
#[derive(Debug)]
pub enum WalkItem {
    /// A leaf file.
    File(RemoteEntry),
    /// A directory listing failed after retries; its subtree was skipped.
    Failed {
        path: String,
        /// Whether the failed directory is the walk root.
        root: bool,
        error: Error,
    },
}

struct Frame {
    path: String,
    next_page: u32,
    buffer: VecDeque<RemoteEntry>,
    done: bool,
}

impl Frame {
    fn new(path: String) -> Self {
        Self {
            path,
            next_page: 1,
            buffer: VecDeque::new(),
            done: false,
        }
    }
}

struct WalkState {
    index: Arc<dyn RemoteIndex>,
    retry: Arc<RetryExecutor>,
    per_page: u32,
    stack: Vec<Frame>,
}

/// Walks a remote tree through the retry executor.
#[derive(Clone)]
pub struct RemoteWalker {
    index: Arc<dyn RemoteIndex>,
    retry: Arc<RetryExecutor>,
    per_page: u32,
}

impl RemoteWalker {
    pub fn new(index: Arc<dyn RemoteIndex>, retry: Arc<RetryExecutor>, per_page: u32) -> Self {
        let per_page = if per_page == 0 {
            index.default_per_page()
        } else {
            per_page
        };
        Self {
            index,
            retry,
            per_page,
        }
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    /// Stream every file below `root`.
    ///
    /// A page shorter than the page size ends its directory. Directory
    /// entries are descended into and never yielded.
    pub fn walk(&self, root: &str) -> BoxStream<'static, WalkItem> {
        let root = if root.len() > 1 {
            root.trim_end_matches('/').to_string()
        } else {
            root.to_string()
        };

        let state = WalkState {
            index: Arc::clone(&self.index),
            retry: Arc::clone(&self.retry),
            per_page: self.per_page,
            stack: vec![Frame::new(root)],
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            loop {
                let frame = state.stack.last_mut()?;

                if let Some(entry) = frame.buffer.pop_front() {
                    if entry.is_dir {
                        state.stack.push(Frame::new(entry.path));
                        continue;
                    }
                    return Some((WalkItem::File(entry), state));
                }

                if frame.done {
                    state.stack.pop();
                    continue;
                }

                let path = frame.path.clone();
                let page = frame.next_page;
                let per_page = state.per_page;
                let index = Arc::clone(&state.index);
                let description = format!("listing {path} page {page}");

                let result = state
                    .retry
                    .execute(&description, || {
                        let index = Arc::clone(&index);
                        let path = path.clone();
                        async move { index.list_page(&path, page, per_page).await }
                    })
                    .await;

                match result {
                    Ok(listing) => {
                        let count = listing.entries.len();
                        debug!(path = %path, page, count, "Walked remote page");
                        if let Some(frame) = state.stack.last_mut() {
                            frame.next_page += 1;
                            frame.done = count < per_page as usize;
                            frame.buffer.extend(listing.entries);
                        }
                    }
                    Err(error) => {
                        let root = state.stack.len() == 1;
                        warn!(path = %path, error = %error, "Remote listing failed, skipping subtree");
                        state.stack.pop();
                        return Some((WalkItem::Failed { path, root, error }, state));
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Result;
    use crate::config::PacingSettings;
    use crate::remote::RemotePage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// In-memory remote tree.
    #[derive(Default)]
    pub(crate) struct FakeIndex {
        dirs: Mutex<HashMap<String, Vec<RemoteEntry>>>,
        files: Mutex<HashMap<String, Vec<u8>>>,
        broken: Mutex<HashSet<String>>,
        poisoned: Mutex<HashSet<String>>,
        pub(crate) list_calls: Mutex<Vec<(String, u32)>>,
    }

    impl FakeIndex {
        pub(crate) fn new() -> Self {
            let index = Self::default();
            index.dirs.lock().insert("/".to_string(), Vec::new());
            index
        }

        pub(crate) fn add_dir(&self, path: &str) {
            let (parent, name) = split(path);
            self.dirs
                .lock()
                .entry(parent.clone())
                .or_default()
                .push(RemoteEntry::dir(&parent, &name));
            self.dirs.lock().entry(path.to_string()).or_default();
        }

        pub(crate) fn add_file(&self, path: &str, contents: &[u8]) {
            let (parent, name) = split(path);
            self.dirs
                .lock()
                .entry(parent.clone())
                .or_default()
                .push(
                    RemoteEntry::file(&parent, &name, contents.len() as u64)
                        .with_sign(format!("sig-{name}")),
                );
            self.files.lock().insert(path.to_string(), contents.to_vec());
        }

        pub(crate) fn break_dir(&self, path: &str) {
            self.broken.lock().insert(path.to_string());
        }

        /// Listing `path` panics instead of returning an error.
        pub(crate) fn poison_dir(&self, path: &str) {
            self.poisoned.lock().insert(path.to_string());
        }
    }

    fn split(path: &str) -> (String, String) {
        let (parent, name) = path.rsplit_once('/').unwrap();
        let parent = if parent.is_empty() { "/" } else { parent };
        (parent.to_string(), name.to_string())
    }

    #[async_trait]
    impl RemoteIndex for FakeIndex {
        async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<RemotePage> {
            self.list_calls.lock().push((path.to_string(), page));
            if self.broken.lock().contains(path) {
                return Err(Error::Remote {
                    code: 500,
                    message: format!("failed to list {path}"),
                });
            }
            if self.poisoned.lock().contains(path) {
                panic!("listing {path} blew up");
            }
            let dirs = self.dirs.lock();
            let entries = dirs.get(path).ok_or_else(|| Error::Remote {
                code: 500,
                message: "object not found".to_string(),
            })?;
            let start = ((page - 1) * per_page) as usize;
            let page_entries = entries
                .iter()
                .skip(start)
                .take(per_page as usize)
                .cloned()
                .collect();
            Ok(RemotePage {
                entries: page_entries,
                total: entries.len() as u64,
            })
        }

        async fn get_info(&self, path: &str) -> Result<RemoteEntry> {
            if self.dirs.lock().contains_key(path) {
                let (parent, name) = if path == "/" {
                    ("/".to_string(), String::new())
                } else {
                    split(path)
                };
                let mut entry = RemoteEntry::dir(&parent, &name);
                entry.path = path.to_string();
                return Ok(entry);
            }
            let files = self.files.lock();
            let contents = files.get(path).ok_or_else(|| Error::Remote {
                code: 500,
                message: "object not found".to_string(),
            })?;
            let (parent, name) = split(path);
            Ok(RemoteEntry::file(&parent, &name, contents.len() as u64)
                .with_sign(format!("sig-{name}")))
        }

        async fn fetch_bytes(&self, entry: &RemoteEntry) -> Result<Bytes> {
            self.files
                .lock()
                .get(&entry.path)
                .map(|c| Bytes::from(c.clone()))
                .ok_or_else(|| Error::Remote {
                    code: 404,
                    message: "not found".to_string(),
                })
        }
    }

    pub(crate) fn no_delay_retry() -> Arc<RetryExecutor> {
        Arc::new(RetryExecutor::new(PacingSettings {
            max_retries: 2,
            retry_delay_ms: 0,
            req_delay_ms: 0,
        }))
    }

    async fn collect(walker: &RemoteWalker, root: &str) -> Vec<String> {
        walker
            .walk(root)
            .map(|item| match item {
                WalkItem::File(entry) => entry.path,
                WalkItem::Failed { path, .. } => format!("FAILED {path}"),
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_depth_first_with_pagination() {
        let index = Arc::new(FakeIndex::new());
        index.add_dir("/media");
        index.add_file("/media/a.mp4", b"a");
        index.add_dir("/media/season1");
        index.add_file("/media/season1/e1.mp4", b"1");
        index.add_file("/media/season1/e2.mp4", b"2");
        index.add_file("/media/b.mp4", b"b");

        let walker = RemoteWalker::new(index.clone(), no_delay_retry(), 2);
        let paths = collect(&walker, "/media/").await;
        assert_eq!(
            paths,
            vec![
                "/media/a.mp4",
                "/media/season1/e1.mp4",
                "/media/season1/e2.mp4",
                "/media/b.mp4",
            ]
        );

        // /media has 3 entries: full page then short page. season1 has
        // exactly 2: full page then an empty page.
        let calls = index.list_calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                ("/media".to_string(), 1),
                ("/media/season1".to_string(), 1),
                ("/media/season1".to_string(), 2),
                ("/media".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_subtree_does_not_stop_walk() {
        let index = Arc::new(FakeIndex::new());
        index.add_dir("/media");
        index.add_dir("/media/broken");
        index.add_file("/media/broken/x.mp4", b"x");
        index.add_file("/media/ok.mp4", b"ok");
        index.break_dir("/media/broken");

        let walker = RemoteWalker::new(index.clone(), no_delay_retry(), 100);
        let items: Vec<WalkItem> = walker.walk("/media").collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[0],
            WalkItem::Failed { path, root: false, .. } if path == "/media/broken"
        ));
        assert!(matches!(&items[1], WalkItem::File(e) if e.path == "/media/ok.mp4"));

        // Two attempts for the broken directory, one for /media.
        let broken_calls = index
            .list_calls
            .lock()
            .iter()
            .filter(|(p, _)| p == "/media/broken")
            .count();
        assert_eq!(broken_calls, 2);
    }

    #[tokio::test]
    async fn test_root_failure_is_flagged() {
        let index = Arc::new(FakeIndex::new());
        let walker = RemoteWalker::new(index, no_delay_retry(), 100);
        let items: Vec<WalkItem> = walker.walk("/missing").collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], WalkItem::Failed { root: true, .. }));
    }

    #[test]
    fn test_zero_page_size_uses_index_default() {
        let index = Arc::new(FakeIndex::new());
        let default = index.default_per_page();
        assert_eq!(RemoteWalker::new(index.clone(), no_delay_retry(), 0).per_page(), default);
        assert_eq!(RemoteWalker::new(index, no_delay_retry(), 7).per_page(), 7);
    }

    #[tokio::test]
    async fn test_walk_is_lazy() {
        let index = Arc::new(FakeIndex::new());
        index.add_dir("/media");
        index.add_file("/media/a.mp4", b"a");
        index.add_dir("/media/sub");
        index.add_file("/media/sub/b.mp4", b"b");

        let walker = RemoteWalker::new(index.clone(), no_delay_retry(), 100);
        let mut stream = walker.walk("/media");
        let first = stream.next().await;
        assert!(matches!(first, Some(WalkItem::File(_))));
        assert_eq!(index.list_calls.lock().len(), 1);
    }
}
