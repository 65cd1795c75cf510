//! Prefix-table routing (§4.6.4, "Prefix/pattern table" strategy). The
//! nested-regex-tree alternative the spec also names is not implemented —
//! every example server in the pack routes by longest-prefix match, and nothing
//! in this crate's scenarios needs named capture groups.

use crate::config::RouteConfig;
use crate::http::protocol::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    NotFound,
    MethodNotAllowed,
}

/// Longest-prefix match among `routes` whose `path` prefixes `url`, then a
/// method check on the winning route.
pub fn find_route<'a>(
    routes: &'a [RouteConfig],
    url: &str,
    method: &Method,
) -> Result<&'a RouteConfig, RoutingError> {
    let candidate = routes
        .iter()
        .filter(|r| url.starts_with(r.path.as_str()))
        .max_by_key(|r| r.path.len())
        .ok_or(RoutingError::NotFound)?;

    if !method.is_allowed(&candidate.methods) {
        return Err(RoutingError::MethodNotAllowed);
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn route(path: &str, methods: &[&str]) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            ..RouteConfig::default()
        }
    }

    #[test]
    fn picks_the_longest_matching_prefix() {
        let routes = vec![route("/", &["GET"]), route("/api", &["GET"])];
        let found = find_route(&routes, "/api/users", &Method::Get).unwrap();
        assert_eq!(found.path, "/api");
    }

    #[test]
    fn missing_route_is_not_found() {
        let routes = vec![route("/api", &["GET"])];
        assert_eq!(find_route(&routes, "/other", &Method::Get), Err(RoutingError::NotFound));
    }

    #[test]
    fn disallowed_method_on_matched_route() {
        let routes = vec![route("/", &["GET"])];
        assert_eq!(
            find_route(&routes, "/", &Method::Post),
            Err(RoutingError::MethodNotAllowed)
        );
    }
}
