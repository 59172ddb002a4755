use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use kfuzz_executor::sys::RawTable;
use kfuzz_executor::{comm, exec_loop, FAIL_STATUS};
use log::LevelFilter;
use std::process::exit;
use std::sync::Arc;

/// In-process syscall executor, spawned and driven by the parent fuzzer.
#[derive(Debug, Parser)]
#[clap(name = "kfuzz-executor", version)]
struct Settings {
    /// Speak the control protocol on plain stdin/stdout instead of
    /// remapping them to the dedicated control fds.
    #[clap(long)]
    stdio: bool,
    /// Number of entries in the raw syscall dispatch table.
    #[clap(long, default_value = "512")]
    syscall_count: u64,
}

fn main() {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("EXECUTOR_LOG", "debug")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();
    // narration below info is gated by the handshake debug flag
    log::set_max_level(LevelFilter::Info);

    let channel = if settings.stdio {
        comm::stdio_channel()
    } else {
        comm::setup_control_pipes()
    };
    let (conn_in, conn_out) = match channel {
        Ok(c) => c,
        Err(e) => {
            log::error!("control channel setup failed: {}", e);
            exit(FAIL_STATUS);
        }
    };

    let table = Arc::new(RawTable::new(settings.syscall_count));
    if let Err(e) = exec_loop(table, conn_in, conn_out) {
        log::error!("{}", e);
        exit(FAIL_STATUS);
    }
}
