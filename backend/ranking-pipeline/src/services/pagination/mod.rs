// ============================================
// Pagination
// ============================================
// The caller pages through a candidate set in candidate pages, and each
// candidate page is shown in smaller user pages. Ranking runs over one
// candidate page; pagination cuts the requested user page out of it.

use crate::error::{PipelineError, Result};
use crate::models::PaginationFields;
use crate::services::component::{Component, InitGate};
use async_trait::async_trait;
use tracing::{error, info};

pub const MAX_CANDIDATE_PAGE_SIZE: i64 = 1000;
pub const MAX_PAGINATED_ENTITIES: usize = 1000;
pub const MAX_USER_PAGE_SIZE: i64 = 100;

#[derive(Debug, Default)]
pub struct PaginationComponent {
    gate: InitGate,
}

impl PaginationComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slice out the user page described by `fields`.
    ///
    /// Validation failures are fatal. A page that would run past the end of
    /// `entities` is an error, not a truncated page.
    pub fn paginate<T: Clone>(&self, fields: &PaginationFields, entities: &[T]) -> Result<Vec<T>> {
        if entities.is_empty() {
            info!("no entities to paginate");
            return Ok(Vec::new());
        }

        let (start, end) = page_bounds(fields, entities.len())?;
        Ok(entities[start..end].to_vec())
    }
}

fn reject(message: String, fields: &PaginationFields) -> PipelineError {
    error!(?fields, "{}", message);
    PipelineError::Pagination(message)
}

/// `[start, end)` of the user page within the current candidate page
fn page_bounds(fields: &PaginationFields, entity_count: usize) -> Result<(usize, usize)> {
    let PaginationFields {
        user_page_size,
        user_page,
        candidate_page_size,
        candidate_page,
    } = *fields;

    if user_page < 0 || candidate_page < 0 {
        return Err(reject(
            format!(
                "user page {} or candidate page {} is less than 0",
                user_page, candidate_page
            ),
            fields,
        ));
    }
    if !(0..=MAX_CANDIDATE_PAGE_SIZE).contains(&candidate_page_size) {
        return Err(reject(
            format!(
                "candidate page size {} is outside 0..={}",
                candidate_page_size, MAX_CANDIDATE_PAGE_SIZE
            ),
            fields,
        ));
    }
    if entity_count > MAX_PAGINATED_ENTITIES {
        return Err(reject(
            format!(
                "number of entities {} is greater than {}",
                entity_count, MAX_PAGINATED_ENTITIES
            ),
            fields,
        ));
    }
    if !(1..=MAX_USER_PAGE_SIZE).contains(&user_page_size) {
        return Err(reject(
            format!(
                "user page size {} is outside 1..={}",
                user_page_size, MAX_USER_PAGE_SIZE
            ),
            fields,
        ));
    }
    if user_page_size > candidate_page_size {
        return Err(reject(
            format!(
                "user page size {} is greater than candidate page size {}",
                user_page_size, candidate_page_size
            ),
            fields,
        ));
    }

    // user page relative to the start of the candidate page
    let ranking_page = user_page as f64
        - (candidate_page as f64 * candidate_page_size as f64 / user_page_size as f64);
    if ranking_page < 0.0 {
        return Err(reject(
            format!(
                "ranking page {} is less than 0, is the user page correct?",
                ranking_page
            ),
            fields,
        ));
    }

    let start = (ranking_page * user_page_size as f64) as usize;
    let end = ((ranking_page + 1.0) * user_page_size as f64) as usize;

    if end > entity_count {
        return Err(reject(
            format!(
                "computed end index {} is greater than the number of entities {}",
                end, entity_count
            ),
            fields,
        ));
    }
    if end <= start {
        return Err(reject(
            format!(
                "computed end index {} is not greater than start index {}",
                end, start
            ),
            fields,
        ));
    }

    Ok((start, end))
}

#[async_trait]
impl Component for PaginationComponent {
    fn name(&self) -> &str {
        "pagination"
    }

    fn init_gate(&self) -> &InitGate {
        &self.gate
    }
}
