use clap::Parser;
use elements::config::{Cli, Config};
use elements::error::Result;
use elements::reactor::Reactor;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    init_logging(&config);

    if cli.check {
        tracing::info!("configuration OK: {}", cli.config.display());
        elements::config::display::display_config(&config.servers);
        return Ok(());
    }

    if config.daemonize {
        daemonize(&config)?;
    }

    let reactor = Reactor::new(config)?;
    reactor.run()
}

/// §10: `tracing-subscriber`, `EnvFilter` defaulting to the configured
/// `log_level`, JSON output when `log_format: json` is set.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == elements::config::types::LogFormat::Json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// §4.3, §6: double-fork daemonization plus chroot/umask/setuid/setgid, in
/// the order the original's `handle_post_daemonize` applies them — root
/// privileges (chroot, binding low ports) must be dropped last.
fn daemonize(config: &Config) -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err("fork() failed while daemonizing".into()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err("setsid() failed while daemonizing".into());
        }

        match libc::fork() {
            -1 => return Err("second fork() failed while daemonizing".into()),
            0 => {}
            _ => std::process::exit(0),
        }

        libc::umask(config.umask.unwrap_or(0o027) as libc::mode_t);

        if let Some(root) = &config.chroot {
            let c_root = std::ffi::CString::new(root.as_str())
                .map_err(|e| format!("invalid chroot path: {e}"))?;
            if libc::chroot(c_root.as_ptr()) != 0 {
                return Err(format!("chroot({root}) failed").into());
            }
            let root_dir = std::ffi::CString::new("/").unwrap();
            if libc::chdir(root_dir.as_ptr()) != 0 {
                return Err("chdir(\"/\") after chroot failed".into());
            }
        }

        if let Some(group) = &config.group {
            let c_group = std::ffi::CString::new(group.as_str())
                .map_err(|e| format!("invalid group name: {e}"))?;
            let entry = libc::getgrnam(c_group.as_ptr());
            if entry.is_null() || libc::setgid((*entry).gr_gid) != 0 {
                return Err(format!("setgid({group}) failed").into());
            }
        }

        if let Some(user) = &config.user {
            let c_user = std::ffi::CString::new(user.as_str())
                .map_err(|e| format!("invalid user name: {e}"))?;
            let entry = libc::getpwnam(c_user.as_ptr());
            if entry.is_null() || libc::setuid((*entry).pw_uid) != 0 {
                return Err(format!("setuid({user}) failed").into());
            }
        }
    }

    Ok(())
}
