use std::collections::HashMap;

use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SERVER_NAME: &str = "_";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;
pub const DEFAULT_ROUTE_PATH: &str = "/";
pub const DEFAULT_ROOT: &str = "./www";
pub const DEFAULT_FILE: &str = "index.html";

fn default_true() -> bool {
    true
}

fn default_event_manager() -> String {
    "auto".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

/// Top-level configuration: reactor/process-model settings plus the list of
/// virtual servers (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemonize: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<u32>,
    pub chroot: Option<String>,
    #[serde(default)]
    pub long_running: bool,
    #[serde(default = "default_loop_interval")]
    pub loop_interval: f64,
    pub timeout: Option<u64>,
    #[serde(default = "default_timeout_interval")]
    pub timeout_interval: f64,
    #[serde(default)]
    pub worker_count: usize,
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    #[serde(default = "default_event_manager")]
    pub event_manager: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    pub fastcgi: Option<FastCgiConfig>,
}

/// FastCGI responder listener (§4.7): a separate bind from the HTTP
/// `ServerConfig`s, since an upstream web server speaks the FastCGI wire
/// protocol to this process rather than plain HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct FastCgiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_fastcgi_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub allow_persistence: bool,
    pub max_requests: Option<u32>,
    #[serde(default = "default_fastcgi_root")]
    pub root: String,
    #[serde(default = "default_default_file")]
    pub default_file: String,
}

fn default_fastcgi_port() -> u16 {
    9000
}

fn default_fastcgi_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_loop_interval() -> f64 {
    1.0
}

fn default_timeout_interval() -> f64 {
    5.0
}

fn default_channel_count() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemonize: false,
            user: None,
            group: None,
            umask: None,
            chroot: None,
            long_running: false,
            loop_interval: default_loop_interval(),
            timeout: None,
            timeout_interval: default_timeout_interval(),
            worker_count: 0,
            channel_count: default_channel_count(),
            event_manager: default_event_manager(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            servers: Vec::new(),
            fastcgi: None,
        }
    }
}

/// One (possibly virtual-hosted) HTTP server (§3 Host/listener, §6 HTTP
/// options).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub default_server: bool,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default = "default_max_body")]
    pub client_max_body_size: usize,
    #[serde(default = "default_max_body")]
    pub max_upload_size: usize,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_upload_buffer")]
    pub upload_buffer_size: usize,
    #[serde(default = "default_headers_length")]
    pub max_headers_length: usize,
    #[serde(default = "default_request_line_length")]
    pub max_request_length: usize,
    #[serde(default)]
    pub gmt_offset: i32,
    #[serde(default)]
    pub session_autostart: bool,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_ports() -> Vec<u16> {
    vec![DEFAULT_PORT]
}
fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}
fn default_max_body() -> usize {
    DEFAULT_MAX_BODY_SIZE
}
fn default_upload_dir() -> String {
    "uploads".to_string()
}
fn default_upload_buffer() -> usize {
    64 * 1024
}
fn default_headers_length() -> usize {
    8 * 1024
}
fn default_request_line_length() -> usize {
    8 * 1024
}
fn default_session_cookie() -> String {
    "session_id".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_ports(),
            server_name: default_server_name(),
            default_server: false,
            error_pages: HashMap::new(),
            client_max_body_size: default_max_body(),
            max_upload_size: default_max_body(),
            upload_dir: default_upload_dir(),
            upload_buffer_size: default_upload_buffer(),
            max_headers_length: default_headers_length(),
            max_request_length: default_request_line_length(),
            gmt_offset: 0,
            session_autostart: false,
            session_cookie: default_session_cookie(),
            routes: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn find_route(
        &self,
        url: &str,
        method: &crate::http::protocol::Method,
    ) -> std::result::Result<&RouteConfig, crate::http::router::RoutingError> {
        crate::http::router::find_route(&self.routes, url, method)
    }
}

/// One route within a server: a URL prefix plus the behavior attached to it
/// (static root, redirect, CGI, upload target) (§4.6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_route_path")]
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    pub redirection: Option<String>,
    pub redirect_code: Option<u16>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_default_file")]
    pub default_file: String,
    #[serde(default)]
    pub upload_dir: String,
    pub cgi_ext: Option<String>,
    pub cgi_path: Option<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default = "default_true")]
    pub secure: bool,
}

fn default_route_path() -> String {
    DEFAULT_ROUTE_PATH.to_string()
}
fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}
fn default_default_file() -> String {
    DEFAULT_FILE.to_string()
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path: default_route_path(),
            methods: default_methods(),
            redirection: None,
            redirect_code: None,
            root: default_root(),
            default_file: default_default_file(),
            upload_dir: String::new(),
            cgi_ext: None,
            cgi_path: None,
            autoindex: false,
            secure: false,
        }
    }
}
