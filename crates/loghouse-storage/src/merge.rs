//! Merge engine
//!
//! Reconstructs a single strictly time-ordered view out of several
//! per-owner line streams. Within one owner, stored (sequence, position)
//! order already equals arrival order, so the merge only has to compare
//! the head timestamp of each source.
//!
//! Tie-breaking is deterministic and positional: at an identical
//! timestamp, the source with the lower index wins. Callers therefore put
//! the global log first and tests in `started` order after it, which
//! yields "global before test" and "tests in start order" at equal
//! instants.
//!
//! Everything here is pull-based: no source is drained ahead of the
//! consumer, and dropping the merged stream drops all sources with
//! nothing left running.

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use loghouse_core::LogLineItem;

use crate::error::Result;
use crate::types::{Build, Test};
use crate::{LineStream, LogStore};

/// A lazily produced, time-ordered stream of display lines.
pub type ItemStream = BoxStream<'static, Result<LogLineItem>>;

struct Source {
    stream: ItemStream,
    head: Option<LogLineItem>,
    done: bool,
}

/// Merge `sources` by line timestamp, lower source index winning ties.
pub fn merge_line_streams(sources: Vec<ItemStream>) -> ItemStream {
    let sources: Vec<Source> = sources
        .into_iter()
        .map(|stream| Source {
            stream,
            head: None,
            done: false,
        })
        .collect();

    stream::try_unfold(sources, |mut sources| async move {
        // Refill any empty head slots.
        for source in sources.iter_mut() {
            if source.head.is_none() && !source.done {
                match source.stream.next().await {
                    Some(Ok(item)) => source.head = Some(item),
                    Some(Err(e)) => return Err(e),
                    None => source.done = true,
                }
            }
        }

        // Earliest head wins; strict comparison keeps the first source on
        // ties.
        let mut best: Option<(usize, DateTime<Utc>)> = None;
        for (idx, source) in sources.iter().enumerate() {
            if let Some(head) = &source.head {
                if best.map_or(true, |(_, t)| head.time < t) {
                    best = Some((idx, head.time));
                }
            }
        }

        match best {
            Some((idx, _)) => {
                let item = sources[idx].head.take();
                Ok(item.map(|item| (item, sources)))
            }
            None => Ok(None),
        }
    })
    .boxed()
}

/// The end of a test's execution window: the start time of the
/// chronologically next test under the same build, or `None` when the
/// window is open-ended.
pub fn execution_window_end(tests: &[Test], test: &Test) -> Option<DateTime<Utc>> {
    tests
        .iter()
        .filter(|t| t.id != test.id && t.started > test.started)
        .map(|t| t.started)
        .min()
}

fn tag(lines: LineStream, global: bool) -> ItemStream {
    lines
        .map_ok(move |line| LogLineItem::from_line(line, global))
        .boxed()
}

/// Merged view for one test: its own lines plus the build's global lines
/// restricted to the test's execution window.
///
/// The global source is filtered *before* it enters the merge, so a global
/// line outside `[started, window_end)` can never leak into this test's
/// view.
pub async fn merged_test_logs(
    store: &dyn LogStore,
    build: &Build,
    test: &Test,
    window_end: Option<DateTime<Utc>>,
) -> Result<ItemStream> {
    let started = test.started;
    let global = tag(store.log_lines(&build.id, None).await?, true)
        .try_filter(move |item| {
            future::ready(item.time >= started && window_end.map_or(true, |end| item.time < end))
        })
        .boxed();
    let own = tag(store.log_lines(&build.id, Some(&test.id)).await?, false);

    Ok(merge_line_streams(vec![global, own]))
}

/// Merged "all logs" view for a build: the global log plus every test's
/// log, tests in `started` order.
pub async fn all_build_logs(store: &dyn LogStore, build: &Build) -> Result<ItemStream> {
    let mut sources = vec![tag(store.log_lines(&build.id, None).await?, true)];
    for test in store.find_tests_for_build(&build.id).await? {
        sources.push(tag(store.log_lines(&build.id, Some(&test.id)).await?, false));
    }
    Ok(merge_line_streams(sources))
}
