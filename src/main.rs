use std::process::exit;
use std::sync::Arc;

use tracing::{error, info};

use raftis::config::Config;
use raftis::server;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cfg = if args.len() == 2 {
        match Config::load(&args[1]) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("*** FATAL CONFIG FILE ERROR ***");
                eprintln!("{}", e);
                exit(1);
            }
        }
    } else if args.len() > 2 {
        eprintln!("Usage: ./raftis-server [/path/to/raftis.conf]");
        exit(1);
    } else {
        eprintln!(
            "Warning: no config file specified, using the default config. \
             In order to specify a config file use 'raftis-server /path/to/raftis.conf'"
        );
        Config::default()
    };

    if let Some(dir) = &cfg.dir {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("Can't chdir to '{}': {}", dir, e);
            exit(1);
        }
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if cfg.daemonize {
        daemonize(&cfg.pidfile);
    }

    init_logging(&cfg);
    print_logo(&cfg);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Can't start the runtime: {}", e);
            exit(1);
        }
    };

    let code = runtime.block_on(async move {
        let handle = match server::start(cfg).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("fatal startup error: {}", e);
                return 1;
            }
        };
        let shutdown = handle.shutdown_signal.clone();
        tokio::select! {
            _ = shutdown.notified() => {
                info!("shutdown requested by client");
            }
            _ = wait_for_signal() => {
                info!("received shutdown signal");
                handle.stop(true).await;
            }
        }
        0
    });
    exit(code);
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn init_logging(cfg: &Config) {
    let level = cfg.loglevel.tracing_level();
    if cfg.logfile.is_empty() {
        tracing_subscriber::fmt().with_max_level(level).init();
    } else {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.logfile)
        {
            Ok(file) => {
                let file = Arc::new(file);
                tracing_subscriber::fmt()
                    .with_max_level(level)
                    .with_ansi(false)
                    .with_writer(move || Arc::clone(&file))
                    .init();
            }
            Err(e) => {
                eprintln!("Can't open the log file: {}", e);
                exit(1);
            }
        }
    }
}

/// Detach from the terminal: fork away the parent, start a new session,
/// point the standard streams at /dev/null, then record the pid.
fn daemonize(pidfile: &str) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        if libc::fork() != 0 {
            exit(0); // parent exits
        }
        libc::setsid(); // create a new session
        if let Ok(devnull) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
        {
            let fd = devnull.as_raw_fd();
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
        }
    }
    let _ = std::fs::write(pidfile, format!("{}\n", std::process::id()));
}

fn print_logo(cfg: &Config) {
    if cfg.daemonize {
        return;
    }
    println!(
        r#"
        .------.
       /  ._.   \      raftis {}
      |  (_)  (_)|     Redis-compatible server, consensus included
       \   __   /      Port: {}
        `------'       PID:  {}
"#,
        raftis::VERSION,
        cfg.port,
        std::process::id()
    );
}
