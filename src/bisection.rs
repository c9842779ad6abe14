/// Bounded first-occurrence bisection.
///
/// Re-expressed as a proper `Option<i64>` instead of a `-1` sentinel.
/// Recurses on `[start, middle]` after a success and `[middle + 1, end]`
/// after a failure so that the search range strictly shrinks on every
/// call — the variant that guarantees soundness: the returned index, if
/// any, is the first in range for which `condition` holds.
use std::future::Future;

/// Synchronous variant, used directly in tests and wherever `condition` is
/// cheap to evaluate without suspension.
pub fn first_occurrence<F>(condition: &mut F, start: i64, end: i64, max_depth: u32) -> Option<i64>
where
    F: FnMut(i64) -> bool,
{
    assert!(start <= end, "invalid range: start ({start}) > end ({end})");

    if max_depth == 0 || start == end {
        return condition(start).then_some(start);
    }

    let middle = start + (end - start) / 2;

    if condition(middle) {
        first_occurrence(condition, start, middle, max_depth - 1)
    } else {
        first_occurrence(condition, middle + 1, end, max_depth - 1)
    }
}

/// Async variant for use against a suspending probe (an HTTP request per
/// candidate timestamp, in the Backfill Engine's case).
pub async fn first_occurrence_async<F, Fut>(
    condition: &mut F,
    start: i64,
    end: i64,
    max_depth: u32,
) -> Option<i64>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(start <= end, "invalid range: start ({start}) > end ({end})");

    if max_depth == 0 || start == end {
        return condition(start).await.then_some(start);
    }

    let middle = start + (end - start) / 2;

    if condition(middle).await {
        Box::pin(first_occurrence_async(condition, start, middle, max_depth - 1)).await
    } else {
        Box::pin(first_occurrence_async(
            condition,
            middle + 1,
            end,
            max_depth - 1,
        ))
        .await
    }
}
