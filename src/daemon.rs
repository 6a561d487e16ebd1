/// Detaches the process. Must run before the tokio runtime is built.
#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    use daemonize::Daemonize;

    eprintln!("[INFO] Starting daemon mode...");

    // keep the current directory so relative --data/--logs paths still resolve
    let daemonize = Daemonize::new()
        .pid_file("/tmp/smtp-notify.pid")
        .chown_pid_file(true)
        .working_directory(".")
        .umask(0o027);

    match daemonize.start() {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("[ERROR] Daemon startup: {}", e);
            Err(anyhow::anyhow!("Failed to start daemon mode"))
        }
    }
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode not supported on this platform, staying in foreground");
    Ok(())
}
