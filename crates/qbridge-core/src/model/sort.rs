//! Merging freshly appended rows into a sorted model.

use super::SortableDataSource;

/// Index of the first row in `0..len` that sorts after the probed row.
fn upper_bound(len: usize, mut is_after: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if is_after(mid) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Sort rows `start..end` into place among the rows before them.
///
/// The rows must already be in the source but not yet reported to the
/// client. Each row is moved to its sorted position in index order, and
/// the moved rows are reported through `inserted(source, start, count)`
/// as contiguous ranges. A pending range is reported before a row lands
/// outside it, so each reported range covers exactly the rows at those
/// positions when it is reported.
///
/// # Panics
///
/// Panics if the reported ranges do not add up to `end - start` rows.
pub fn sort_inserted<T, F>(source: &mut T, start: usize, end: usize, mut inserted: F)
where
    T: SortableDataSource + ?Sized,
    F: FnMut(&T, usize, usize),
{
    let mut pending: Option<(usize, usize)> = None;
    let mut reported = 0;

    for i in start..end {
        let n = upper_bound(i, |j| source.row_less(i, j));

        pending = match pending {
            Some((first, last)) if n >= first && n <= last + 1 => {
                if i != n {
                    source.row_move(i, n);
                }
                Some((first, last + 1))
            }
            Some((first, last)) => {
                inserted(source, first, last - first + 1);
                reported += last - first + 1;
                if i != n {
                    source.row_move(i, n);
                }
                Some((n, n))
            }
            None => {
                if i != n {
                    source.row_move(i, n);
                }
                Some((n, n))
            }
        };
    }

    if let Some((first, last)) = pending {
        inserted(source, first, last - first + 1);
        reported += last - first + 1;
    }

    assert_eq!(
        reported,
        end.saturating_sub(start),
        "sorted insert reported {} rows for an insert of {}",
        reported,
        end.saturating_sub(start)
    );
}
