use std::sync::Arc;

use anyhow::Result;
use smtp_notify::sink::{DirectorySink, LogSink, MessageSink};
use smtp_notify::{daemon, Bridge, Logger, Opt};
use structopt::StructOpt;

fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("SMTP Notify v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    eprintln!("[INFO] PID: {}", std::process::id());

    // Create the directories before detaching
    if let Some(log_path) = &opt.log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                eprintln!("[INFO] Created log directory: {:?}", parent);
            }
        }
    }

    if let Some(data_dir) = &opt.data_dir {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)?;
            eprintln!("[INFO] Created data directory: {:?}", data_dir);
        }
    }

    if opt.daemon {
        daemon::daemonize()?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    let logger = Logger::new(opt.log_file.clone(), opt.raw_display, opt.verbose)?;
    let bridge = Bridge::new(opt.clone(), logger.clone());

    let addr = match bridge.start().await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("[ERROR] Failed to start SMTP listener: {:#}", e);
            std::process::exit(1);
        }
    };

    for identity in &opt.tenants {
        let mut context = bridge.tenant(identity.clone()).await?;
        let sink: Arc<dyn MessageSink> = match &opt.data_dir {
            Some(dir) => Arc::new(DirectorySink::new(identity.clone(), dir.clone())),
            None => Arc::new(LogSink::new(identity.clone(), logger.clone())),
        };
        context.set_message_sink(sink);
        context.enable().await;
    }

    println!("[INFO] Listening on {}", addr);
    println!("[INFO] Domain: {}", opt.domain);
    println!("[INFO] Tenants: {:?}", opt.tenants);
    if opt.tenants.is_empty() {
        println!("[WARNING] No tenant registered, every AUTH will fail");
    }
    if !opt.allow_insecure_auth() {
        println!("[WARNING] Insecure AUTH denied, no client can authenticate without TLS");
    }
    println!("[INFO] Max message size: {} bytes", opt.max_message_bytes);
    println!("[INFO] Max recipients: {}", opt.max_recipients);
    println!("[INFO] Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("[INFO] Shutting down");
    Ok(())
}
