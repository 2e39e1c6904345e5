use crate::config::Endpoints;

fn strip_query(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    path[..end].trim_end_matches('/')
}

/// Requests to the login or refresh endpoint never trigger a refresh.
pub(crate) fn is_auth_endpoint(endpoints: &Endpoints, path: &str) -> bool {
    let path = strip_query(path);
    [&endpoints.login, &endpoints.refresh]
        .iter()
        .any(|endpoint| strip_query(endpoint) == path)
}

pub(crate) fn should_attempt_refresh(
    endpoints: &Endpoints,
    status: u16,
    path: &str,
    already_retried: bool,
) -> bool {
    status == 401 && !already_retried && !is_auth_endpoint(endpoints, path)
}
