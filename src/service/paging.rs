//! Page cursor for PagedExpand.
//!
//! A page token is either empty (first page) or the decimal index of the
//! first word of the page. Anything else is rejected rather than clamped.

use crate::status::Status;

/// The slice of words a page covers plus the token for the page after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub start: usize,
    pub end: usize,
    /// Empty when this is the last page.
    pub next_page_token: String,
}

/// Compute the page of `total` words selected by `page_size` and `page_token`.
///
/// A `page_size` of zero returns everything from the token to the end.
pub fn paginate(total: usize, page_size: i32, page_token: &str) -> Result<Page, Status> {
    let page_size = usize::try_from(page_size).map_err(|_| {
        Status::invalid_argument("The page size provided must not be negative.")
    })?;

    let start = if page_token.is_empty() {
        0
    } else {
        match page_token.parse::<usize>() {
            Ok(index) if index < total => index,
            _ => {
                return Err(Status::invalid_argument(format!(
                    "Invalid page token: {page_token}. Token must be within the range [0, {total})"
                )))
            }
        }
    };

    let page_size = if page_size == 0 { total } else { page_size };
    let end = start.saturating_add(page_size).min(total);

    let next_page_token = if end < total {
        end.to_string()
    } else {
        String::new()
    };

    Ok(Page {
        start,
        end,
        next_page_token,
    })
}
