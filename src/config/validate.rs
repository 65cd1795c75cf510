//! Drops conflicting or invalid server blocks before the reactor binds any
//! listener (§6). A server block with an unusable route or missing error
//! page would otherwise fail at request time instead of at startup.

use std::collections::{HashMap, HashSet};

use crate::config::types::ServerConfig;

pub fn validate_configs(configs: Vec<ServerConfig>) -> Vec<ServerConfig> {
    let mut conflict_indices = HashSet::new();

    // (host, port, server_name) -> indices sharing that identity
    let mut usage_map: HashMap<(String, u16, String), Vec<usize>> = HashMap::new();
    for (idx, config) in configs.iter().enumerate() {
        for port in &config.ports {
            let key = (config.host.clone(), *port, config.server_name.clone());
            usage_map.entry(key).or_default().push(idx);
        }
    }

    for ((host, port, server_name), indices) in usage_map {
        if indices.len() > 1 {
            tracing::warn!(
                host = %host,
                port,
                server_name = %server_name,
                "conflict: multiple servers share this host:port:name; dropping all of them"
            );
            conflict_indices.extend(indices);
        }
    }

    // wildcard bind conflicts: 0.0.0.0 cannot coexist with a specific IP on
    // the same port.
    let mut port_hosts: HashMap<u16, HashSet<String>> = HashMap::new();
    for config in &configs {
        for port in &config.ports {
            port_hosts.entry(*port).or_default().insert(config.host.clone());
        }
    }
    for (port, hosts) in port_hosts {
        if hosts.contains("0.0.0.0") && hosts.len() > 1 {
            tracing::warn!(port, ?hosts, "bind conflict: wildcard host mixed with specific IPs on the same port");
            for (idx, config) in configs.iter().enumerate() {
                if config.ports.contains(&port) {
                    conflict_indices.insert(idx);
                }
            }
        }
    }

    for (idx, config) in configs.iter().enumerate() {
        let mut valid = true;

        for (code, path) in &config.error_pages {
            if *code < 100 || *code > 599 {
                tracing::warn!(server = %config.server_name, code, "invalid error page status code, must be 100-599");
                valid = false;
            }
            if let Err(e) = std::fs::File::open(path) {
                tracing::warn!(server = %config.server_name, code, path = %path, error = %e, "error page file is not readable");
                valid = false;
            }
        }

        for route in &config.routes {
            if route.cgi_ext.is_none() && std::fs::read_dir(&route.root).is_err() {
                tracing::warn!(server = %config.server_name, route = %route.path, root = %route.root, "route root directory does not exist");
                valid = false;
            }
        }

        if !valid {
            conflict_indices.insert(idx);
        }
    }

    if !conflict_indices.is_empty() {
        tracing::warn!(dropped = conflict_indices.len(), "dropped invalid or conflicting server configurations");
    }

    configs
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !conflict_indices.contains(idx))
        .map(|(_, config)| config)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ServerConfig;

    fn make_config(host: &str, ports: Vec<u16>, name: &str) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            ports,
            server_name: name.to_string(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_validate_no_conflicts() {
        let configs = vec![
            make_config("127.0.0.1", vec![8001], "s1"),
            make_config("127.0.0.1", vec![8002], "s2"),
        ];
        assert_eq!(validate_configs(configs).len(), 2);
    }

    #[test]
    fn test_validate_virtual_hosts_ok() {
        let configs = vec![
            make_config("127.0.0.1", vec![8080], "example.com"),
            make_config("127.0.0.1", vec![8080], "api.example.com"),
        ];
        assert_eq!(validate_configs(configs).len(), 2);
    }

    #[test]
    fn test_validate_conflict_drops_both() {
        let configs = vec![
            make_config("127.0.0.1", vec![8080], "same.com"),
            make_config("127.0.0.1", vec![8080], "same.com"),
            make_config("127.0.0.1", vec![8081], "other.com"),
        ];
        let valid = validate_configs(configs);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].server_name, "other.com");
    }

    #[test]
    fn test_validate_multi_port_partial_conflict() {
        let configs = vec![
            make_config("127.0.0.1", vec![80, 81], "foo"),
            make_config("127.0.0.1", vec![80], "foo"),
        ];
        assert_eq!(validate_configs(configs).len(), 0);
    }

    #[test]
    fn test_validate_wildcard_conflict() {
        let configs = vec![
            make_config("0.0.0.0", vec![8080], "s1"),
            make_config("127.0.0.1", vec![8080], "s2"),
        ];
        assert_eq!(validate_configs(configs).len(), 0);
    }

    #[test]
    fn test_validate_wildcard_no_conflict() {
        let configs = vec![
            make_config("0.0.0.0", vec![8080], "s1"),
            make_config("0.0.0.0", vec![8080], "s2"),
        ];
        assert_eq!(validate_configs(configs).len(), 2);
    }

    #[test]
    fn test_validate_invalid_status_code() {
        let mut config = make_config("127.0.0.1", vec![8080], "s1");
        config.error_pages.insert(99, "exists".to_string());
        assert_eq!(validate_configs(vec![config]).len(), 0);
    }

    #[test]
    fn test_validate_missing_files() {
        let mut config = make_config("127.0.0.1", vec![8080], "s1");
        config.error_pages.insert(404, "/non/existent/path/err.html".to_string());
        assert_eq!(validate_configs(vec![config]).len(), 0);
    }

    #[test]
    fn test_validate_missing_root() {
        use crate::config::types::RouteConfig;
        let mut config = make_config("127.0.0.1", vec![8080], "s1");
        let route = RouteConfig { root: "/non/existent/dir".to_string(), ..RouteConfig::default() };
        config.routes.push(route);
        assert_eq!(validate_configs(vec![config]).len(), 0);
    }

    #[test]
    fn test_validate_valid_files() {
        use crate::config::types::RouteConfig;
        let temp_dir = std::env::temp_dir();
        let file_path = temp_dir.join("elements_test_err.html");
        std::fs::write(&file_path, "error").unwrap();

        let mut config = make_config("127.0.0.1", vec![8080], "s1");
        config.error_pages.insert(404, file_path.to_str().unwrap().to_string());

        let route = RouteConfig { root: temp_dir.to_str().unwrap().to_string(), ..RouteConfig::default() };
        config.routes.push(route);

        let valid = validate_configs(vec![config]);
        assert_eq!(valid.len(), 1);

        let _ = std::fs::remove_file(file_path);
    }

    #[test]
    fn test_validate_cgi_route_skips_root_check() {
        use crate::config::types::RouteConfig;
        let mut config = make_config("127.0.0.1", vec![8080], "s1");
        let route = RouteConfig {
            root: "/non/existent/dir".to_string(),
            cgi_ext: Some(".cgi".to_string()),
            ..RouteConfig::default()
        };
        config.routes.push(route);
        assert_eq!(validate_configs(vec![config]).len(), 1);
    }
}
