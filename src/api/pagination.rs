//! Offset pagination for list endpoints

use serde::Deserialize;
use validator::Validate;

/// Largest page a list endpoint returns
pub const MAX_PAGE_SIZE: i64 = 100;

/// `?offset=&limit=` query parameters
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PageQuery {
    #[validate(range(min = 0, message = "offset must not be negative"))]
    pub offset: Option<i64>,
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: Option<i64>,
}

impl PageQuery {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(MAX_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let page = PageQuery::default();
        assert!(page.validate().is_ok());
        assert_eq!(page.offset(), 0);
        assert_eq!(page.limit(), 100);
    }

    #[test]
    fn test_bounds() {
        let page = PageQuery {
            offset: Some(20),
            limit: Some(5),
        };
        assert!(page.validate().is_ok());
        assert_eq!((page.offset(), page.limit()), (20, 5));

        for (offset, limit) in [(Some(-1), None), (None, Some(0)), (None, Some(101))] {
            assert!(PageQuery { offset, limit }.validate().is_err());
        }
    }

    #[test]
    fn test_parse_from_query_string() {
        let uri: axum::http::Uri = "/recipe_runs/?offset=10&limit=3&status=queued".parse().unwrap();
        let axum::extract::Query(page) = axum::extract::Query::<PageQuery>::try_from_uri(&uri).unwrap();
        assert_eq!(page.offset, Some(10));
        assert_eq!(page.limit, Some(3));
    }
}
