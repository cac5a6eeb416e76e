use crate::models::{ListQuery, PageResponse, Pagination, StudentRecord};

pub const DEFAULT_PAGE_SIZE: usize = 100;
const FILTER_WILDCARD: &str = "All";

/// Search, filter and paginate a snapshot. Input order is preserved.
pub fn apply(records: &[StudentRecord], query: &ListQuery) -> PageResponse<StudentRecord> {
    let needle = query
        .search
        .as_deref()
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase);

    let active_filters: Vec<(&str, &str)> = query
        .filters
        .iter()
        .filter(|(_, value)| !value.is_empty() && value.as_str() != FILTER_WILDCARD)
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();

    let filtered: Vec<&StudentRecord> = records
        .iter()
        .filter(|record| needle.as_deref().map_or(true, |needle| matches_search(record, needle)))
        .filter(|record| {
            active_filters
                .iter()
                .all(|(key, value)| record.field(key).unwrap_or_default() == *value)
        })
        .collect();

    paginate(filtered, query.page, query.limit)
}

fn matches_search(record: &StudentRecord, needle: &str) -> bool {
    [
        record.full_name.as_str(),
        record.institution.as_str(),
        record.program.as_str(),
        record.district.as_str(),
    ]
    .iter()
    .any(|field| field.to_lowercase().contains(needle))
}

fn paginate(items: Vec<&StudentRecord>, page: Option<usize>, limit: Option<usize>) -> PageResponse<StudentRecord> {
    let total = items.len();
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let start = (page - 1).saturating_mul(limit);

    let data = items
        .into_iter()
        .skip(start)
        .take(limit)
        .cloned()
        .collect();

    PageResponse {
        data,
        pagination: Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        },
    }
}
