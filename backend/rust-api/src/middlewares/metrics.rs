use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Records request count and latency per normalized route
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(duration);

    response
}

/// Collapses identifiers to `{id}` to keep label cardinality bounded. Anything
/// following a `sessions` or `subjects` segment is an identifier, as is any
/// UUID-looking or numeric segment.
fn normalize_path(path: &str) -> String {
    let mut normalized = Vec::new();
    let mut previous = "";

    for segment in path.split('/') {
        let is_id = (matches!(previous, "sessions" | "subjects") && !segment.is_empty())
            || is_uuid_like(segment)
            || is_numeric_id(segment);
        normalized.push(if is_id { "{id}" } else { segment });
        previous = segment;
    }

    normalized.join("/")
}

fn is_uuid_like(s: &str) -> bool {
    s.len() == 36 && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

fn is_numeric_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/api/v1/sessions/550e8400-e29b-41d4-a716-446655440000/lock"),
            "/api/v1/sessions/{id}/lock"
        );
        assert_eq!(
            normalize_path("/api/v1/subjects/algebra-basics/items"),
            "/api/v1/subjects/{id}/items"
        );
        assert_eq!(normalize_path("/api/v1/sessions"), "/api/v1/sessions");
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn test_is_uuid_like() {
        assert!(is_uuid_like("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_uuid_like("not-a-uuid"));
    }
}
