//! Black-box coverage of the YAML configuration shape (§6): defaults,
//! nested server/route lists, and the kinds of mistakes an operator's
//! config file can contain.

use elements::config::{Config, FastCgiConfig, RouteConfig, ServerConfig};

#[test]
fn parses_a_single_server_block() {
    let yaml = "
        host: 0.0.0.0
        ports: [80, 443]
        server_name: myserv
        client_max_body_size: 2048
        routes:
          - path: /
            root: ./www
    ";
    let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.ports, vec![80, 443]);
    assert_eq!(config.server_name, "myserv");
    assert_eq!(config.client_max_body_size, 2048);
    assert_eq!(config.routes[0].path, "/");
}

#[test]
fn parses_a_full_app_config_with_one_server() {
    let yaml = r#"
servers:
  - host: "127.0.0.1"
    ports: [8080, 8081]
    server_name: "test_server"
    default_server: true
    client_max_body_size: 1024
    routes:
      - path: "/"
        methods: ["GET"]
        root: "./www"
        default_file: "index.html"
        autoindex: true
"#;
    let config: Config = serde_yaml::from_str(yaml).expect("should parse a valid config");
    assert_eq!(config.servers.len(), 1);

    let server = &config.servers[0];
    assert_eq!(server.host, "127.0.0.1");
    assert_eq!(server.ports, vec![8080, 8081]);
    assert_eq!(server.server_name, "test_server");
    assert!(server.default_server);
    assert_eq!(server.client_max_body_size, 1024);
    assert_eq!(server.routes.len(), 1);
    assert_eq!(server.routes[0].path, "/");
}

#[test]
fn rejects_malformed_yaml() {
    let yaml = r#"
servers:
  - host "127.0.0.1"
"#;
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
}

#[test]
fn unknown_fields_are_ignored_rather_than_rejected() {
    let yaml = r#"
servers:
  - host: "127.0.0.1"
    unknown_field: "some_value"
    server_name: "test"
"#;
    let config: Config = serde_yaml::from_str(yaml).expect("parses despite the unknown field");
    assert_eq!(config.servers[0].host, "127.0.0.1");
    assert_eq!(config.servers[0].server_name, "test");
}

#[test]
fn rejects_wrong_indentation() {
    let yaml_bad = r#"
servers:
  - host: "127.0.0.1"
    ports: [8080]
   server_name: "bad_indent"
"#;
    assert!(serde_yaml::from_str::<Config>(yaml_bad).is_err());
}

#[test]
fn rejects_a_string_where_a_number_is_expected() {
    let yaml = r#"
servers:
  - host: "127.0.0.1"
    client_max_body_size: "not a number"
"#;
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
}

#[test]
fn rejects_a_non_numeric_port_in_the_list() {
    let yaml = r#"
servers:
  - host: "127.0.0.1"
    ports: [8080, "bad_port"]
"#;
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
}

#[test]
fn multiple_servers_parse_independently() {
    let yaml = "
        servers:
          - server_name: web1
            host: 127.0.0.1
            ports: [8080, 8081]
            routes:
              - path: /
                root: ./web1/www
          - server_name: web2
            host: 127.0.0.1
            ports: [9090]
            routes:
              - path: /
                root: ./web2/www
    ";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[0].server_name, "web1");
    assert_eq!(config.servers[1].ports, vec![9090]);
}

#[test]
fn server_config_defaults_match_the_documented_values() {
    let yaml = "server_name: test_default";
    let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.ports, vec![8080]);
    assert_eq!(config.routes.len(), 0);
    assert!(config.error_pages.is_empty());
}

#[test]
fn route_without_a_path_still_parses_to_the_default_prefix() {
    let yaml = "
        routes:
          - root: /tmp
    ";
    // `path` carries a `#[serde(default)]`, so a route with only `root` set
    // still parses; a bare route always resolves to `/` rather than
    // erroring.
    let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.routes[0].path, "/");
}

#[test]
fn rejects_a_non_boolean_autoindex() {
    let yaml = "
        routes:
          - path: /
            autoindex: yes_please
    ";
    assert!(serde_yaml::from_str::<ServerConfig>(yaml).is_err());
}

#[test]
fn fastcgi_block_fills_in_its_own_defaults() {
    let yaml = "fastcgi: {}";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let fastcgi = config.fastcgi.expect("fastcgi block present");
    assert_eq!(fastcgi.host, "127.0.0.1");
    assert_eq!(fastcgi.port, 9000);
    assert!(fastcgi.allow_persistence);
    assert_eq!(fastcgi.max_requests, None);
}

#[test]
fn fastcgi_block_overrides_are_honored() {
    let yaml = "
        fastcgi:
          port: 9001
          allow_persistence: false
          max_requests: 500
    ";
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    let fastcgi: FastCgiConfig = config.fastcgi.unwrap();
    assert_eq!(fastcgi.port, 9001);
    assert!(!fastcgi.allow_persistence);
    assert_eq!(fastcgi.max_requests, Some(500));
}

#[test]
fn route_config_defaults_allow_get_and_head() {
    let route = RouteConfig::default();
    assert_eq!(route.methods, vec!["GET".to_string(), "HEAD".to_string()]);
    assert_eq!(route.default_file, "index.html");
}
