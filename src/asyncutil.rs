//! Scheduler-agnostic helpers shared by the supervisor and config loader.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Race a set of tasks, returning the index and outcome of whichever
/// finishes first (successfully or by panicking).
///
/// Takes `&mut JoinHandle` rather than owning them: the caller keeps every
/// handle afterward to abort or join the ones that lost the race, which the
/// connection supervisor's ordered teardown depends on.
///
/// Grounded in the original's `asyncio.wait(..., return_when=FIRST_COMPLETED)`
/// helper, which additionally raced a second `FIRST_EXCEPTION` wait against
/// the first one just to log a warning if something raised. A `JoinHandle`
/// already carries panics in its `Result`, so one `select_all` replaces both.
pub async fn wait_first<'a, T: 'a>(
    handles: Vec<&'a mut JoinHandle<T>>,
) -> (usize, Result<T, tokio::task::JoinError>) {
    let futures: Vec<Pin<Box<dyn Future<Output = Result<T, tokio::task::JoinError>> + Send + 'a>>> =
        handles.into_iter().map(|h| Box::pin(h) as _).collect();
    let (result, index, _still_running) = futures::future::select_all(futures).await;
    (index, result)
}

/// An ISO-8601 duration (`"PT30S"`, `"PT5M"`) parsed at config-load time.
///
/// The original relied on Python's `isodate.parse_duration`; this is its
/// idiomatic-Rust analogue. A malformed duration is a fatal config error,
/// never a runtime one (see [`crate::config::ConfigError`]).
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, String> {
    let parsed: iso8601_duration::Duration = input
        .parse()
        .map_err(|err| format!("invalid ISO-8601 duration {input:?}: {err:?}"))?;
    Ok(parsed.to_std())
}
